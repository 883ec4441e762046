//! Device entities.
//!
//! A [`DeviceEntity`] owns the features of one physical device, its request
//! queue and the single outstanding direct query. The device is either idle
//! or waiting for the reply to one query; while it waits nothing else is
//! sent to it. A reply (or the feature's ack timeout) returns it to idle.
//!
//! Queue entries are ordered by not-before time, then by insertion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::AddressId;
use crate::catalog::{DeviceTypeDefinition, TemplateCatalog};
use crate::config::EngineConfig;
use crate::error::{Error, LinkError, Result};
use crate::feature::DeviceFeature;
use crate::group::DuplicateTracker;
use crate::link::Link;
use crate::message::WireMessage;
use crate::registry::HandlerRegistry;
use crate::scheduler::SchedulerHandle;
use crate::state::{DeviceCommand, QueryStatus};

/// Longest delay the queue schedules; longer waits are cut to this.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `at + delay`, with `delay` capped at [`MAX_WAIT`].
pub(crate) fn after(at: Instant, delay: Duration) -> Instant {
    at + delay.min(MAX_WAIT)
}

/// A queued outbound request.
#[derive(Debug, Clone)]
pub struct QEntry {
    pub feature: Arc<DeviceFeature>,
    pub msg: WireMessage,
    pub not_before: Instant,
    pub seq: u64,
}

#[derive(Debug)]
struct Outstanding {
    feature: Arc<DeviceFeature>,
    issued_at: Instant,
}

#[derive(Debug)]
struct Deferred {
    feature: Arc<DeviceFeature>,
    msg: WireMessage,
    delay: Duration,
}

#[derive(Debug, Default)]
struct RequestState {
    queue: BTreeMap<(Instant, u64), QEntry>,
    seq: u64,
    outstanding: Option<Outstanding>,
    next_allowed_send: Option<Instant>,
    deferred: Vec<Deferred>,
}

impl RequestState {
    fn earliest(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }
}

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Drained {
    pub next: Option<Instant>,
    pub sent: bool,
}

impl Drained {
    fn wait(next: Option<Instant>) -> Self {
        Self { next, sent: false }
    }
}

pub struct DeviceEntity {
    me: Weak<DeviceEntity>,
    address: AddressId,
    product_key: String,
    battery_powered: bool,
    config: Arc<EngineConfig>,
    features: Vec<Arc<DeviceFeature>>,
    link: Arc<dyn Link>,
    scheduler: SchedulerHandle,
    inbound: Mutex<DuplicateTracker>,
    duplicate_inbound: AtomicBool,
    requests: Mutex<RequestState>,
    last_msg_received: Mutex<Option<Instant>>,
    last_polled: Mutex<Option<Instant>>,
    failed_queries: AtomicU32,
    removed: AtomicBool,
}

impl fmt::Debug for DeviceEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEntity")
            .field("address", &self.address)
            .field("product_key", &self.product_key)
            .field("battery_powered", &self.battery_powered)
            .field("features", &self.features)
            .finish()
    }
}

/// Assembles the features of a device before it is shared.
pub struct DeviceBuilder {
    address: AddressId,
    product_key: String,
    battery_powered: bool,
    features: Vec<Arc<DeviceFeature>>,
}

impl DeviceBuilder {
    pub fn battery_powered(mut self, battery_powered: bool) -> Self {
        self.battery_powered = battery_powered;
        self
    }

    /// Add a feature. A second feature with the same name is dropped.
    pub fn feature(mut self, feature: DeviceFeature) -> Self {
        self.push(Arc::new(feature));
        self
    }

    fn push(&mut self, feature: Arc<DeviceFeature>) {
        if self.features.iter().any(|f| f.name() == feature.name()) {
            warn!("{}: duplicate feature {} dropped", self.address, feature.name());
            return;
        }
        self.features.push(feature);
    }

    /// Add the features and feature groups of a device type. Features that
    /// reference unknown templates, and group links to unknown features, are
    /// logged and left out.
    pub fn definition(
        mut self,
        definition: &DeviceTypeDefinition,
        catalog: &TemplateCatalog,
        registry: &HandlerRegistry,
        config: &EngineConfig,
    ) -> Self {
        self.battery_powered |= definition.battery_powered;

        for feature_ref in &definition.features {
            let Some(template) = catalog.template(&feature_ref.template) else {
                warn!(
                    "{}: feature {} uses unknown template {}",
                    self.address, feature_ref.name, feature_ref.template
                );
                continue;
            };
            let group = definition
                .feature_groups
                .iter()
                .find(|g| g.features.iter().any(|name| *name == feature_ref.name));
            let mut params = group.map(|g| g.params.clone()).unwrap_or_default();
            params.extend(feature_ref.params.clone());

            let feature = DeviceFeature::from_template(
                &feature_ref.name,
                template,
                &params,
                registry,
                config,
                group.is_some(),
            );
            self.push(Arc::new(feature));
        }

        for group_ref in &definition.feature_groups {
            let Some(template) = catalog.template(&group_ref.template) else {
                warn!(
                    "{}: feature group {} uses unknown template {}",
                    self.address, group_ref.name, group_ref.template
                );
                continue;
            };
            let group = DeviceFeature::from_template(
                &group_ref.name,
                template,
                &group_ref.params,
                registry,
                config,
                false,
            );
            for member in &group_ref.features {
                match self.features.iter().find(|f| f.name() == member) {
                    Some(feature) => group.connect(feature.clone()),
                    None => warn!(
                        "{}: feature group {} references unknown feature {}",
                        self.address, group_ref.name, member
                    ),
                }
            }
            self.push(Arc::new(group));
        }

        self
    }

    pub fn build(
        self,
        link: Arc<dyn Link>,
        scheduler: SchedulerHandle,
        config: Arc<EngineConfig>,
    ) -> Arc<DeviceEntity> {
        let duplicate_window = config.duplicate_window();
        Arc::new_cyclic(|me| DeviceEntity {
            me: me.clone(),
            address: self.address,
            product_key: self.product_key,
            battery_powered: self.battery_powered,
            config,
            features: self.features,
            link,
            scheduler,
            inbound: Mutex::new(DuplicateTracker::new(duplicate_window)),
            duplicate_inbound: AtomicBool::new(false),
            requests: Mutex::new(RequestState::default()),
            last_msg_received: Mutex::new(None),
            last_polled: Mutex::new(None),
            failed_queries: AtomicU32::new(0),
            removed: AtomicBool::new(false),
        })
    }
}

impl DeviceEntity {
    pub fn builder(address: AddressId, product_key: impl Into<String>) -> DeviceBuilder {
        DeviceBuilder {
            address,
            product_key: product_key.into(),
            battery_powered: false,
            features: Vec::new(),
        }
    }

    pub fn address(&self) -> AddressId {
        self.address
    }

    pub fn product_key(&self) -> &str {
        &self.product_key
    }

    pub fn is_battery_powered(&self) -> bool {
        self.battery_powered
    }

    pub fn features(&self) -> &[Arc<DeviceFeature>] {
        &self.features
    }

    pub fn feature(&self, name: &str) -> Option<Arc<DeviceFeature>> {
        self.features.iter().find(|f| f.name() == name).cloned()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn has_any_listeners(&self) -> bool {
        self.features.iter().any(|f| f.has_listeners())
    }

    /// `false` once enough consecutive queries have timed out.
    pub fn is_responding(&self) -> bool {
        self.failed_queries.load(Ordering::Acquire) < self.config.failed_query_threshold
    }

    pub fn failed_queries(&self) -> u32 {
        self.failed_queries.load(Ordering::Acquire)
    }

    pub fn last_msg_received(&self) -> Option<Instant> {
        *self.last_msg_received.lock()
    }

    pub fn last_polled(&self) -> Option<Instant> {
        *self.last_polled.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.requests.lock().queue.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.requests.lock().deferred.len()
    }

    /// Name of the feature whose query is awaiting a reply.
    pub fn outstanding_feature(&self) -> Option<String> {
        self.requests
            .lock()
            .outstanding
            .as_ref()
            .map(|o| o.feature.name().to_string())
    }

    /// Whether the outstanding query was issued for `feature`.
    pub fn is_outstanding(&self, feature: &DeviceFeature) -> bool {
        self.requests
            .lock()
            .outstanding
            .as_ref()
            .is_some_and(|o| std::ptr::eq(Arc::as_ptr(&o.feature), feature))
    }

    /// Whether the inbound message being dispatched repeats an earlier one.
    pub fn inbound_duplicate(&self) -> bool {
        self.duplicate_inbound.load(Ordering::Acquire)
    }

    /// A battery device listens only for a short while after it talked.
    fn is_awake(&self, now: Instant) -> bool {
        !self.battery_powered
            || self
                .last_msg_received()
                .is_some_and(|last| now.saturating_duration_since(last) <= self.config.awake_window())
    }

    fn schedule(&self, at: Instant) {
        if let Some(me) = self.me.upgrade() {
            self.scheduler.add_queue(me, at);
        }
    }

    /// Forward a platform command to a feature.
    pub fn handle_command(&self, feature: &str, command: &DeviceCommand) -> Result<()> {
        let feature = self
            .feature(feature)
            .ok_or_else(|| Error::FeatureNotFound(format!("{}:{}", self.address, feature)))?;
        feature.handle_command(self, command);
        Ok(())
    }

    /// Queue `msg` on behalf of the feature called `feature`.
    pub fn enqueue_for(&self, feature: &str, msg: WireMessage, delay: Duration) {
        match self.feature(feature) {
            Some(feature) => self.enqueue_request(&feature, msg, delay),
            None => warn!("{}: cannot enqueue for unknown feature {}", self.address, feature),
        }
    }

    /// Queue `msg` to go out no earlier than `delay` from now. A queued
    /// message equal to `msg` is replaced.
    pub fn enqueue_request(&self, feature: &Arc<DeviceFeature>, msg: WireMessage, delay: Duration) {
        if self.is_removed() {
            debug!("{}: removed, dropping {}", self.address, msg);
            return;
        }
        let now = Instant::now();

        if !self.is_awake(now) {
            let mut state = self.requests.lock();
            state.deferred.retain(|d| d.msg != msg);
            debug!("{}: asleep, deferring {}", self.address, msg);
            state.deferred.push(Deferred {
                feature: feature.clone(),
                msg,
                delay,
            });
            return;
        }

        let not_before = after(now, delay);
        let earliest = {
            let mut state = self.requests.lock();
            let before = state.queue.len();
            state.queue.retain(|_, entry| entry.msg != msg);
            if state.queue.len() != before {
                debug!("{}: replacing queued {}", self.address, msg);
            }
            let in_flight = state
                .outstanding
                .as_ref()
                .is_some_and(|o| Arc::ptr_eq(&o.feature, feature));
            if !msg.is_broadcast() && !in_flight {
                feature.set_query_status(QueryStatus::QueryCreated);
            }
            let seq = state.seq;
            state.seq += 1;
            trace!("{}: queued {} for {} (+{:?})", self.address, msg, feature.name(), delay);
            state.queue.insert(
                (not_before, seq),
                QEntry {
                    feature: feature.clone(),
                    msg,
                    not_before,
                    seq,
                },
            );
            state.earliest()
        };

        if let Some(at) = earliest {
            self.schedule(at);
        }
    }

    /// Clear a timed-out query. Returns the deadline while it is still pending.
    fn expire_outstanding(&self, state: &mut RequestState, now: Instant) -> Option<Instant> {
        let outstanding = state.outstanding.as_ref()?;
        let deadline = after(outstanding.issued_at, outstanding.feature.ack_timeout());
        if now < deadline {
            return Some(deadline);
        }
        warn!(
            "{}: no reply to {} query after {:?}",
            self.address,
            outstanding.feature.name(),
            outstanding.feature.ack_timeout()
        );
        outstanding.feature.set_query_status(QueryStatus::NeverQueried);
        self.failed_queries.fetch_add(1, Ordering::AcqRel);
        state.outstanding = None;
        None
    }

    /// Send at most one queued request.
    ///
    /// Returns when this device next needs servicing, or `None` when its
    /// queue is empty and no query is awaiting a reply.
    pub async fn drain_one_entry(&self, now: Instant) -> Option<Instant> {
        self.drain(now).await.next
    }

    pub(crate) async fn drain(&self, now: Instant) -> Drained {
        if self.is_removed() {
            return Drained::wait(None);
        }

        let (entry, quiet_time, next) = {
            let mut state = self.requests.lock();
            if state.queue.is_empty() {
                // come back at the deadline so the query still times out
                let deadline = self.expire_outstanding(&mut state, now);
                return Drained::wait(deadline);
            }
            if let Some(deadline) = self.expire_outstanding(&mut state, now) {
                trace!("{}: waiting for reply until {:?}", self.address, deadline);
                return Drained::wait(Some(deadline));
            }
            if let Some(allowed) = state.next_allowed_send {
                if now < allowed {
                    return Drained::wait(Some(allowed));
                }
            }
            let Some((_, mut entry)) = state.queue.pop_first() else {
                return Drained::wait(None);
            };

            let quiet_time = if entry.msg.is_broadcast() {
                self.config.broadcast_quiet_time()
            } else {
                state.outstanding = Some(Outstanding {
                    feature: entry.feature.clone(),
                    issued_at: now,
                });
                entry.feature.set_query_status(QueryStatus::QueryPending);
                self.config.direct_quiet_time()
            };
            entry.msg.set_quiet_time(quiet_time);
            let allowed = after(now, quiet_time);
            state.next_allowed_send = Some(allowed);

            let next = match state.earliest() {
                Some(at) => at.max(allowed),
                None => allowed,
            };
            (entry, quiet_time, next)
        };

        debug!(
            "{}: sending {} for {} (quiet {:?})",
            self.address,
            entry.msg,
            entry.feature.name(),
            quiet_time
        );
        let write_timeout = self.config.write_timeout();
        let result =
            match tokio::time::timeout(write_timeout, self.link.send_frame(&self.address, &entry.msg))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout(write_timeout.as_millis() as u64)),
            };

        if let Err(e) = &result {
            warn!("{}: dropping {}: {}", self.address, entry.msg, e);
            if !entry.msg.is_broadcast() {
                let mut state = self.requests.lock();
                if state
                    .outstanding
                    .as_ref()
                    .is_some_and(|o| Arc::ptr_eq(&o.feature, &entry.feature))
                {
                    state.outstanding = None;
                }
                entry.feature.set_query_status(QueryStatus::NeverQueried);
            }
        }

        Drained {
            next: Some(next),
            sent: result.is_ok(),
        }
    }

    /// Dispatch an inbound message to the features.
    ///
    /// Non-status features are tried in order until one reports the
    /// outstanding query answered; status features always see the message.
    /// Group members are reached through their group. A nack only reaches
    /// status features.
    pub fn handle_message(&self, msg: &WireMessage) {
        if self.is_removed() {
            return;
        }
        let now = Instant::now();
        *self.last_msg_received.lock() = Some(now);
        self.failed_queries.store(0, Ordering::Release);

        let nack = msg.is_nack_of_direct();
        if nack {
            warn!(
                "{}: request 0x{:02X} failed: {}",
                self.address,
                msg.cmd1(),
                nack_reason(msg.cmd2())
            );
            self.query_refused(now);
        }

        {
            let mut tracker = self.inbound.lock();
            let duplicate = tracker.is_duplicate(msg, now);
            self.duplicate_inbound.store(duplicate, Ordering::Release);

            let features = self
                .features
                .iter()
                .filter(|f| !nack && !f.is_status() && !f.is_grouped());
            for feature in features {
                if feature.handle_message(self, msg) {
                    self.query_answered(feature, now);
                    break;
                }
            }
            for feature in self.features.iter().filter(|f| f.is_status()) {
                feature.handle_message(self, msg);
            }

            self.duplicate_inbound.store(false, Ordering::Release);
        }

        if self.battery_powered {
            self.flush_deferred();
        }
    }

    fn query_answered(&self, feature: &Arc<DeviceFeature>, now: Instant) {
        let next = {
            let mut state = self.requests.lock();
            match state.outstanding.take() {
                Some(o) if feature.routes_to(&o.feature) => {
                    debug!("{}: {} query answered", self.address, o.feature.name());
                    o.feature.set_query_status(QueryStatus::QueryAnswered);
                }
                other => {
                    feature.set_query_status(QueryStatus::QueryAnswered);
                    state.outstanding = other;
                }
            }
            state.earliest()
        };
        if let Some(at) = next {
            self.schedule(at.max(now));
        }
    }

    /// A nack ends the outstanding query without a state to publish.
    fn query_refused(&self, now: Instant) {
        let next = {
            let mut state = self.requests.lock();
            if let Some(o) = state.outstanding.take() {
                debug!("{}: {} query refused", self.address, o.feature.name());
                o.feature.set_query_status(QueryStatus::NeverQueried);
            }
            state.earliest()
        };
        if let Some(at) = next {
            self.schedule(at.max(now));
        }
    }

    fn flush_deferred(&self) {
        let deferred = std::mem::take(&mut self.requests.lock().deferred);
        if deferred.is_empty() {
            return;
        }
        info!("{}: awake, sending {} deferred requests", self.address, deferred.len());
        for entry in deferred {
            self.enqueue_request(&entry.feature, entry.msg, entry.delay);
        }
    }

    /// Queue the poll message of every pollable feature, spaced by quiet time.
    pub fn do_poll(&self, delay: Duration) {
        let mut spacing = delay;
        for feature in &self.features {
            if let Some(msg) = feature.make_poll_msg(self) {
                let quiet_time = msg.quiet_time();
                self.enqueue_request(feature, msg, spacing);
                spacing += quiet_time;
            }
        }
        *self.last_polled.lock() = Some(Instant::now());
    }

    pub fn do_poll_feature(&self, name: &str, delay: Duration) {
        let Some(feature) = self.feature(name) else {
            warn!("{}: cannot poll unknown feature {}", self.address, name);
            return;
        };
        match feature.make_poll_msg(self) {
            Some(msg) => self.enqueue_request(&feature, msg, delay),
            None => debug!("{}: feature {} is not pollable", self.address, name),
        }
    }

    /// Unschedule the device and drop all queued work. Later calls on this
    /// device do nothing.
    pub fn dispose(&self) {
        self.removed.store(true, Ordering::Release);
        {
            let mut state = self.requests.lock();
            state.queue.clear();
            state.deferred.clear();
            state.outstanding = None;
        }
        self.scheduler.remove(&self.address);
        debug!("{}: disposed", self.address);
    }
}

/// Reason code carried in cmd2 of a nack.
pub fn nack_reason(cmd2: u8) -> &'static str {
    match cmd2 {
        0xFF => "sender device not in responder database",
        0xFE => "no load detected",
        0xFD => "checksum mismatch",
        0xFC => "database search timed out",
        0xFB => "illegal value in command",
        _ => "unknown error",
    }
}
