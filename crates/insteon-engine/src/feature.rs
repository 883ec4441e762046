//! Device features.
//!
//! A [`DeviceFeature`] is one capability of a device (a relay, a dimmer
//! level, a contact, a battery level). It owns the handlers that translate
//! between wire messages and platform values, plus the small amount of
//! runtime state those handlers update.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::catalog::FeatureTemplate;
use crate::config::EngineConfig;
use crate::device::DeviceEntity;
use crate::error::ConfigError;
use crate::handlers::{
    CommandHandler, DefaultMsgHandler, FeatureContext, MessageHandler, NoOpCommandHandler,
    NoPollHandler, PollHandler,
};
use crate::message::WireMessage;
use crate::registry::HandlerRegistry;
use crate::state::{CommandKind, DeviceCommand, FeatureState, QueryStatus, StateChangeType};

/// Lookup key for message handlers.
///
/// Broadcast traffic has its own key space so a template can treat a group
/// "on" differently from a direct "on". A broadcast with no handlers under
/// its own key falls back to the direct key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Command(u8),
    Broadcast(u8),
}

impl MessageKey {
    pub fn for_message(msg: &WireMessage) -> Self {
        if msg.is_broadcast() {
            Self::Broadcast(msg.cmd1())
        } else {
            Self::Command(msg.cmd1())
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd1) => write!(f, "0x{:02X}", cmd1),
            Self::Broadcast(cmd1) => write!(f, "bcast:0x{:02X}", cmd1),
        }
    }
}

/// Accepts `0x11`, `17`, `bcast:0x11` and `broadcast:0x11`.
impl FromStr for MessageKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMessageKey(s.to_string());
        let trimmed = s.trim();
        let (broadcast, code) = match trimmed.split_once(':') {
            Some((prefix, code)) if prefix == "bcast" || prefix == "broadcast" => (true, code),
            Some(_) => return Err(invalid()),
            None => (false, trimmed),
        };
        let code = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => code.parse::<u8>(),
        }
        .map_err(|_| invalid())?;
        Ok(if broadcast {
            Self::Broadcast(code)
        } else {
            Self::Command(code)
        })
    }
}

/// Notified when a feature publishes a state.
pub trait FeatureListener: Send + Sync {
    fn state_changed(&self, feature: &str, state: &FeatureState);
}

impl<F> FeatureListener for F
where
    F: Fn(&str, &FeatureState) + Send + Sync,
{
    fn state_changed(&self, feature: &str, state: &FeatureState) {
        self(feature, state)
    }
}

#[derive(Debug, Default)]
struct FeatureRuntime {
    query_status: QueryStatus,
    last_value: Option<f64>,
    state: Option<FeatureState>,
}

pub struct DeviceFeature {
    name: String,
    template: String,
    ack_timeout: Duration,
    is_status: bool,
    parameters: BTreeMap<String, String>,
    state_change: StateChangeType,
    default_message_handler: Box<dyn MessageHandler>,
    default_command_handler: Box<dyn CommandHandler>,
    message_handlers: HashMap<MessageKey, Vec<Box<dyn MessageHandler>>>,
    command_handlers: HashMap<CommandKind, Box<dyn CommandHandler>>,
    poll_handler: Box<dyn PollHandler>,
    connected: RwLock<Vec<Arc<DeviceFeature>>>,
    /// Set once a group routes messages to this feature
    grouped: AtomicBool,
    runtime: Mutex<FeatureRuntime>,
    listeners: RwLock<Vec<Arc<dyn FeatureListener>>>,
}

impl fmt::Debug for DeviceFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFeature")
            .field("name", &self.name)
            .field("template", &self.template)
            .field("ack_timeout", &self.ack_timeout)
            .field("is_status", &self.is_status)
            .field("message_keys", &self.message_handlers.len())
            .field("command_kinds", &self.command_handlers.len())
            .field("poll_handler", &self.poll_handler.kind())
            .finish()
    }
}

impl DeviceFeature {
    /// Feature with default handlers and no message or command handlers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: String::new(),
            ack_timeout: EngineConfig::default().ack_timeout(),
            is_status: false,
            parameters: BTreeMap::new(),
            state_change: StateChangeType::default(),
            default_message_handler: Box::new(DefaultMsgHandler::default()),
            default_command_handler: Box::new(NoOpCommandHandler::default()),
            message_handlers: HashMap::new(),
            command_handlers: HashMap::new(),
            poll_handler: Box::new(NoPollHandler),
            connected: RwLock::new(Vec::new()),
            grouped: AtomicBool::new(false),
            runtime: Mutex::new(FeatureRuntime::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Build from a template. Handlers that cannot be built are logged and
    /// left out; the feature itself always comes up.
    ///
    /// Members of a feature group are refreshed through the group, so they
    /// get no poll handler of their own.
    pub fn from_template(
        name: impl Into<String>,
        template: &FeatureTemplate,
        params: &BTreeMap<String, String>,
        registry: &HandlerRegistry,
        config: &EngineConfig,
        group_member: bool,
    ) -> Self {
        let name = name.into();
        let mut feature = Self::new(name.clone())
            .with_status(template.status)
            .with_state_change(template.state_change)
            .with_parameters(params.clone());
        feature.template = template.name.clone();

        feature.ack_timeout = match template.ack_timeout() {
            Ok(Some(timeout)) => timeout,
            Ok(None) => config.ack_timeout(),
            Err(e) => {
                warn!("{}: {}, using default ack timeout", name, e);
                config.ack_timeout()
            }
        };

        match registry.build_message_handler(&template.default_message_handler, params) {
            Ok(handler) => feature.default_message_handler = handler,
            Err(e) => warn!("{}: default message handler omitted: {}", name, e),
        }
        match registry.build_command_handler(&template.default_command_handler, params) {
            Ok(handler) => feature.default_command_handler = handler,
            Err(e) => warn!("{}: default command handler omitted: {}", name, e),
        }

        for entry in &template.message_handlers {
            let key = match MessageKey::from_str(&entry.key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("{}: {}", name, e);
                    continue;
                }
            };
            match registry.build_message_handler(&entry.handler, params) {
                Ok(handler) => feature.add_message_handler(key, handler),
                Err(e) => warn!("{}: message handler for {} omitted: {}", name, key, e),
            }
        }

        for (kind, spec) in &template.command_handlers {
            let kind = match CommandKind::from_str(kind) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("{}: {}", name, e);
                    continue;
                }
            };
            match registry.build_command_handler(spec, params) {
                Ok(handler) => {
                    feature.command_handlers.insert(kind, handler);
                }
                Err(e) => warn!("{}: command handler for {} omitted: {}", name, kind, e),
            }
        }

        if let (false, Some(spec)) = (group_member, &template.poll_handler) {
            match registry.build_poll_handler(spec, params) {
                Ok(handler) => feature.poll_handler = handler,
                Err(e) => warn!("{}: poll handler omitted: {}", name, e),
            }
        }

        feature
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_status(mut self, is_status: bool) -> Self {
        self.is_status = is_status;
        self
    }

    pub fn with_state_change(mut self, state_change: StateChangeType) -> Self {
        self.state_change = state_change;
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_default_message_handler(mut self, handler: Box<dyn MessageHandler>) -> Self {
        self.default_message_handler = handler;
        self
    }

    pub fn with_default_command_handler(mut self, handler: Box<dyn CommandHandler>) -> Self {
        self.default_command_handler = handler;
        self
    }

    /// Append a candidate; candidates under one key are tried in insertion order.
    pub fn with_message_handler(mut self, key: MessageKey, handler: Box<dyn MessageHandler>) -> Self {
        self.add_message_handler(key, handler);
        self
    }

    /// At most one handler per command kind; a later one replaces the earlier.
    pub fn with_command_handler(mut self, kind: CommandKind, handler: Box<dyn CommandHandler>) -> Self {
        self.command_handlers.insert(kind, handler);
        self
    }

    pub fn with_poll_handler(mut self, handler: Box<dyn PollHandler>) -> Self {
        self.poll_handler = handler;
        self
    }

    fn add_message_handler(&mut self, key: MessageKey, handler: Box<dyn MessageHandler>) {
        self.message_handlers.entry(key).or_default().push(handler);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the template this feature was built from, empty when built by hand.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn is_status(&self) -> bool {
        self.is_status
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn is_pollable(&self) -> bool {
        self.poll_handler.kind() != "NoPollHandler"
    }

    /// Route inbound messages of this feature to `member` as well.
    pub fn connect(&self, member: Arc<DeviceFeature>) {
        member.grouped.store(true, Ordering::Release);
        self.connected.write().push(member);
    }

    /// Whether this feature receives messages through a group instead of
    /// directly from its device.
    pub fn is_grouped(&self) -> bool {
        self.grouped.load(Ordering::Acquire)
    }

    pub fn connected_features(&self) -> Vec<String> {
        self.connected.read().iter().map(|f| f.name.clone()).collect()
    }

    /// Run the handler for the command's kind, or the default handler.
    pub fn handle_command(&self, device: &DeviceEntity, command: &DeviceCommand) {
        let ctx = FeatureContext::new(device, self);
        let handler = self
            .command_handlers
            .get(&command.kind())
            .unwrap_or(&self.default_command_handler);
        debug!("{}: {} handles {}", ctx.label(), handler.kind(), command);
        handler.handle(&ctx, command);
    }

    fn candidates(&self, msg: &WireMessage) -> &[Box<dyn MessageHandler>] {
        let key = MessageKey::for_message(msg);
        let handlers = self.message_handlers.get(&key).or_else(|| match key {
            MessageKey::Broadcast(cmd1) => self.message_handlers.get(&MessageKey::Command(cmd1)),
            MessageKey::Command(_) => None,
        });
        handlers.map(Vec::as_slice).unwrap_or(&[])
    }

    /// `true` when some candidate under the message's key matches it.
    pub fn matches(&self, msg: &WireMessage) -> bool {
        self.candidates(msg).iter().any(|h| h.matches(msg))
    }

    /// Dispatch an inbound message to the first matching candidate, or to
    /// the default handler when none matches.
    ///
    /// Returns `true` when the handler acted on a reply while the device's
    /// outstanding query belongs to this feature (or a group member).
    pub fn handle_message(&self, device: &DeviceEntity, msg: &WireMessage) -> bool {
        let ctx = FeatureContext::new(device, self);
        let handler = self
            .candidates(msg)
            .iter()
            .find(|h| h.matches(msg))
            .unwrap_or(&self.default_message_handler);

        let acted = if device.inbound_duplicate() && handler.suppresses_duplicates() {
            trace!("{}: {} skips duplicate {}", ctx.label(), handler.kind(), msg);
            false
        } else {
            handler.handle(&ctx, msg)
        };

        let members = self.connected.read().clone();
        let mut member_answered = false;
        for member in members {
            member_answered |= member.handle_message(device, msg);
        }

        let answered = acted && msg.is_reply() && device.is_outstanding(self);
        answered || member_answered
    }

    /// `other` is this feature or one of its group members.
    pub fn routes_to(&self, other: &DeviceFeature) -> bool {
        std::ptr::eq(self, other) || self.connected.read().iter().any(|m| m.routes_to(other))
    }

    pub fn make_poll_msg(&self, device: &DeviceEntity) -> Option<WireMessage> {
        self.poll_handler.make_msg(device)
    }

    /// Record a new state and notify listeners as the state change type allows.
    pub fn update_state(&self, state: FeatureState) {
        let changed = {
            let mut runtime = self.runtime.lock();
            let changed = runtime.state.as_ref() != Some(&state);
            runtime.state = Some(state.clone());
            changed
        };
        if !changed && self.state_change == StateChangeType::Changed {
            trace!("{}: state {} unchanged", self.name, state);
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.state_changed(&self.name, &state);
        }
    }

    pub fn state(&self) -> Option<FeatureState> {
        self.runtime.lock().state.clone()
    }

    pub fn set_last_value(&self, value: f64) {
        self.runtime.lock().last_value = Some(value);
    }

    pub fn last_value(&self) -> Option<f64> {
        self.runtime.lock().last_value
    }

    pub fn query_status(&self) -> QueryStatus {
        self.runtime.lock().query_status
    }

    pub fn set_query_status(&self, status: QueryStatus) {
        let mut runtime = self.runtime.lock();
        if runtime.query_status != status {
            trace!("{}: query status {:?} -> {:?}", self.name, runtime.query_status, status);
            runtime.query_status = status;
        }
    }

    pub fn add_listener(&self, listener: impl FeatureListener + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_key_parse() {
        assert_eq!("0x11".parse::<MessageKey>().unwrap(), MessageKey::Command(0x11));
        assert_eq!("17".parse::<MessageKey>().unwrap(), MessageKey::Command(0x11));
        assert_eq!(
            "bcast:0x11".parse::<MessageKey>().unwrap(),
            MessageKey::Broadcast(0x11)
        );
        assert_eq!(MessageKey::Broadcast(0x2E).to_string(), "bcast:0x2E");
        assert!("0x1FF".parse::<MessageKey>().is_err());
        assert!("group:0x11".parse::<MessageKey>().is_err());
    }

    #[test]
    fn test_listener_and_state_change() {
        let feature = DeviceFeature::new("light").with_state_change(StateChangeType::Changed);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        feature.add_listener(move |name: &str, state: &FeatureState| {
            sink.lock().push(format!("{}={}", name, state));
        });

        feature.update_state(FeatureState::on());
        feature.update_state(FeatureState::on());
        feature.update_state(FeatureState::off());

        assert_eq!(*seen.lock(), vec!["light=ON", "light=OFF"]);
        assert_eq!(feature.state(), Some(FeatureState::off()));
        assert!(feature.has_listeners());
    }

    #[test]
    fn test_always_publishes_repeats() {
        let feature = DeviceFeature::new("light");
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        feature.add_listener(move |_: &str, _: &FeatureState| *sink.lock() += 1);
        feature.update_state(FeatureState::on());
        feature.update_state(FeatureState::on());
        assert_eq!(*count.lock(), 2);
    }
}
