//! Request scheduler.
//!
//! Keeps one time-ordered schedule of devices with pending work. A tick
//! task pops every device that is due, lets it send at most one request and
//! puts it back at the time it asks for. Devices are ordered by due time,
//! then by when they were scheduled.
//!
//! The scheduler is an ordinary value: construct one, hand its
//! [`SchedulerHandle`] to devices, and `start`/`stop` it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::address::AddressId;
use crate::config::EngineConfig;
use crate::device::{after, DeviceEntity};

#[derive(Default)]
struct ScheduleState {
    due: BTreeMap<(Instant, u64), Arc<DeviceEntity>>,
    by_device: HashMap<AddressId, (Instant, u64)>,
    seq: u64,
    /// No device may send before this, after another device used the link
    link_free_at: Option<Instant>,
}

impl ScheduleState {
    fn insert(&mut self, device: Arc<DeviceEntity>, at: Instant) {
        let address = device.address();
        if let Some(&key) = self.by_device.get(&address) {
            if key.0 <= at {
                return;
            }
            self.due.remove(&key);
        }
        let key = (at, self.seq);
        self.seq += 1;
        self.due.insert(key, device);
        self.by_device.insert(address, key);
    }

    fn remove(&mut self, address: &AddressId) -> bool {
        match self.by_device.remove(address) {
            Some(key) => self.due.remove(&key).is_some(),
            None => false,
        }
    }

    fn pop_due(&mut self, now: Instant) -> Vec<Arc<DeviceEntity>> {
        let mut devices = Vec::new();
        while let Some(entry) = self.due.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let device = entry.remove();
            self.by_device.remove(&device.address());
            devices.push(device);
        }
        devices
    }
}

pub(crate) struct SchedulerInner {
    state: Mutex<ScheduleState>,
    link_spacing: Duration,
}

impl SchedulerInner {
    fn add_queue(&self, device: Arc<DeviceEntity>, at: Instant) {
        trace!("{}: due at {:?}", device.address(), at);
        self.state.lock().insert(device, at);
    }

    fn remove(&self, address: &AddressId) {
        if self.state.lock().remove(address) {
            debug!("{}: unscheduled", address);
        }
    }

    /// Drain every device due at `now`. Returns how many were drained.
    async fn service_due(&self, now: Instant) -> usize {
        let due = {
            let mut state = self.state.lock();
            if state.link_free_at.is_some_and(|free| now < free) {
                return 0;
            }
            state.pop_due(now)
        };

        let mut serviced = 0;
        let mut pending = due.into_iter();
        while let Some(device) = pending.next() {
            // earlier writes in this tick may have taken a while
            let sent_at = Instant::now().max(now);
            let drained = device.drain(sent_at).await;
            serviced += 1;

            let mut state = self.state.lock();
            if let Some(next) = drained.next {
                state.insert(device, next);
            }
            if drained.sent && !self.link_spacing.is_zero() {
                let free = after(sent_at, self.link_spacing);
                state.link_free_at = Some(free);
                for rest in pending.by_ref() {
                    state.insert(rest, free);
                }
            }
        }
        serviced
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.due.clear();
        state.by_device.clear();
        state.link_free_at = None;
    }
}

/// Weak reference to a scheduler held by devices. Calls after the scheduler
/// is dropped do nothing.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    inner: Weak<SchedulerInner>,
}

impl SchedulerHandle {
    /// Schedule `device` at `at`, unless it is already due earlier.
    pub fn add_queue(&self, device: Arc<DeviceEntity>, at: Instant) {
        if let Some(inner) = self.inner.upgrade() {
            inner.add_queue(device, at);
        }
    }

    pub fn remove(&self, address: &AddressId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(address);
        }
    }
}

pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
    tick_interval: Duration,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl RequestScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(ScheduleState::default()),
                link_spacing: config.link_spacing(),
            }),
            tick_interval: config.tick_interval(),
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_queue(&self, device: Arc<DeviceEntity>, at: Instant) {
        self.inner.add_queue(device, at);
    }

    pub fn remove_device(&self, address: &AddressId) {
        self.inner.remove(address);
    }

    /// When `address` is next due, if scheduled.
    pub fn due_time(&self, address: &AddressId) -> Option<Instant> {
        self.inner.state.lock().by_device.get(address).map(|key| key.0)
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.state.lock().due.len()
    }

    /// Run one tick by hand.
    pub async fn service_due(&self, now: Instant) -> usize {
        self.inner.service_due(now).await
    }

    /// Start the tick task.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let inner = self.inner.clone();
        let running_flag = self.running.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                {
                    let r = running_flag.read().await;
                    if !*r {
                        break;
                    }
                }
                inner.service_due(Instant::now()).await;
            }
        });

        *self.task_handle.write().await = Some(handle);
        info!("Request scheduler started, tick {:?}", tick_interval);
    }

    /// Stop the tick task and forget every scheduled device.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        let mut task = self.task_handle.write().await;
        if let Some(handle) = task.take() {
            drop(task);
            handle.await.ok();
        }
        self.inner.clear();
        info!("Request scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task_handle.try_write() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::DeviceFeature;
    use crate::link::ChannelLink;

    fn device(scheduler: &RequestScheduler, address: AddressId) -> Arc<DeviceEntity> {
        let (link, _rx) = ChannelLink::new();
        DeviceEntity::builder(address, "test")
            .feature(DeviceFeature::new("f"))
            .build(Arc::new(link), scheduler.handle(), Arc::new(EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_add_queue_keeps_earlier_time() {
        let scheduler = RequestScheduler::new(&EngineConfig::default());
        let address = AddressId::insteon(1, 2, 3);
        let dev = device(&scheduler, address);
        let now = Instant::now();

        scheduler.add_queue(dev.clone(), now + Duration::from_millis(500));
        scheduler.add_queue(dev.clone(), now + Duration::from_millis(900));
        assert_eq!(scheduler.due_time(&address), Some(now + Duration::from_millis(500)));

        scheduler.add_queue(dev, now + Duration::from_millis(100));
        assert_eq!(scheduler.due_time(&address), Some(now + Duration::from_millis(100)));
        assert_eq!(scheduler.scheduled_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_device_unschedules() {
        let scheduler = RequestScheduler::new(&EngineConfig::default());
        let address = AddressId::insteon(1, 2, 3);
        scheduler.add_queue(device(&scheduler, address), Instant::now());
        scheduler.remove_device(&address);
        assert_eq!(scheduler.due_time(&address), None);
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_device_is_not_rescheduled() {
        let scheduler = RequestScheduler::new(&EngineConfig::default());
        let address = AddressId::insteon(1, 2, 3);
        let now = Instant::now();
        scheduler.add_queue(device(&scheduler, address), now);
        assert_eq!(scheduler.service_due(now).await, 1);
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = RequestScheduler::new(&EngineConfig::default());
        scheduler.start().await;
        assert!(scheduler.is_running().await);
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }
}
