//! Handler registry.
//!
//! Maps a handler kind name to a factory closure. A feature template names
//! handlers by kind; [`HandlerRegistry::build_message_handler`] and friends
//! construct a fresh instance and push each parameter through
//! [`Configurable::configure`].
//!
//! Unknown kinds fail the single build with
//! [`HandlerError::UnknownHandlerType`]; unknown or malformed parameters are
//! logged and skipped so the handler still comes up with its defaults.

use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::catalog::HandlerSpec;
use crate::error::HandlerError;
use crate::handlers::{
    CommandHandler, Configurable, ContactRequestReplyHandler, CustomMsgHandler,
    DefaultMsgHandler, DefaultPollHandler, DimmerRequestReplyHandler, FastOnOffCommandHandler,
    FlexPollHandler, GroupBroadcastCommandHandler, IncreaseDecreaseCommandHandler,
    LastTimeMsgHandler, LightOffDimmerHandler, LightOffSwitchHandler, LightOnDimmerHandler,
    LightOnOffCommandHandler, LightOnSwitchHandler, ManualChangeCommandHandler, MessageHandler,
    NoOpCommandHandler, NoOpMsgHandler, NoPollHandler, OpenedOrClosedContactHandler,
    PercentHandler, PollHandler, RampDimmerHandler, RefreshCommandHandler,
    StartManualChangeHandler, StopManualChangeHandler, SwitchRequestReplyHandler,
    TriggerPollMsgHandler, WarnCommandHandler,
};

type MessageFactory = Box<dyn Fn() -> Box<dyn MessageHandler> + Send + Sync>;
type CommandFactory = Box<dyn Fn() -> Box<dyn CommandHandler> + Send + Sync>;
type PollFactory = Box<dyn Fn() -> Box<dyn PollHandler> + Send + Sync>;

/// String-keyed factories for the three handler families.
pub struct HandlerRegistry {
    message: HashMap<String, MessageFactory>,
    command: HashMap<String, CommandFactory>,
    poll: HashMap<String, PollFactory>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            message: HashMap::new(),
            command: HashMap::new(),
            poll: HashMap::new(),
        }
    }

    /// Registry with every built-in handler kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_message_handler("DefaultMsgHandler", || {
            Box::new(DefaultMsgHandler::default())
        });
        registry.register_message_handler("NoOpMsgHandler", || Box::new(NoOpMsgHandler::default()));
        registry.register_message_handler("TriggerPollMsgHandler", || {
            Box::new(TriggerPollMsgHandler::default())
        });
        registry.register_message_handler("LightOnSwitchHandler", || {
            Box::new(LightOnSwitchHandler::default())
        });
        registry.register_message_handler("LightOffSwitchHandler", || {
            Box::new(LightOffSwitchHandler::default())
        });
        registry.register_message_handler("LightOnDimmerHandler", || {
            Box::new(LightOnDimmerHandler::default())
        });
        registry.register_message_handler("LightOffDimmerHandler", || {
            Box::new(LightOffDimmerHandler::default())
        });
        registry.register_message_handler("SwitchRequestReplyHandler", || {
            Box::new(SwitchRequestReplyHandler::default())
        });
        registry.register_message_handler("DimmerRequestReplyHandler", || {
            Box::new(DimmerRequestReplyHandler::default())
        });
        registry.register_message_handler("RampDimmerHandler", || {
            Box::new(RampDimmerHandler::default())
        });
        registry.register_message_handler("StartManualChangeHandler", || {
            Box::new(StartManualChangeHandler::default())
        });
        registry.register_message_handler("StopManualChangeHandler", || {
            Box::new(StopManualChangeHandler::default())
        });
        registry.register_message_handler("ContactRequestReplyHandler", || {
            Box::new(ContactRequestReplyHandler::default())
        });
        registry.register_message_handler("OpenedOrClosedContactHandler", || {
            Box::new(OpenedOrClosedContactHandler::default())
        });
        registry.register_message_handler("LastTimeMsgHandler", || {
            Box::new(LastTimeMsgHandler::default())
        });
        registry.register_message_handler("CustomDecimalMsgHandler", || {
            Box::new(CustomMsgHandler::decimal())
        });
        registry.register_message_handler("CustomPercentMsgHandler", || {
            Box::new(CustomMsgHandler::percent())
        });
        registry.register_message_handler("CustomOnOffMsgHandler", || {
            Box::new(CustomMsgHandler::on_off())
        });
        registry.register_message_handler("CustomBitmaskMsgHandler", || {
            Box::new(CustomMsgHandler::bitmask())
        });
        registry.register_message_handler("CustomCacheMsgHandler", || {
            Box::new(CustomMsgHandler::cache())
        });

        registry.register_command_handler("NoOpCommandHandler", || {
            Box::new(NoOpCommandHandler::default())
        });
        registry.register_command_handler("WarnCommandHandler", || {
            Box::new(WarnCommandHandler::default())
        });
        registry.register_command_handler("LightOnOffCommandHandler", || {
            Box::new(LightOnOffCommandHandler::default())
        });
        registry.register_command_handler("FastOnOffCommandHandler", || {
            Box::new(FastOnOffCommandHandler::default())
        });
        registry.register_command_handler("PercentHandler", || Box::new(PercentHandler::default()));
        registry.register_command_handler("IncreaseDecreaseCommandHandler", || {
            Box::new(IncreaseDecreaseCommandHandler::default())
        });
        registry.register_command_handler("ManualChangeCommandHandler", || {
            Box::new(ManualChangeCommandHandler::default())
        });
        registry.register_command_handler("GroupBroadcastCommandHandler", || {
            Box::new(GroupBroadcastCommandHandler::default())
        });
        registry.register_command_handler("RefreshCommandHandler", || {
            Box::new(RefreshCommandHandler::default())
        });

        registry.register_poll_handler("NoPollHandler", || Box::new(NoPollHandler));
        registry.register_poll_handler("DefaultPollHandler", || Box::new(DefaultPollHandler));
        registry.register_poll_handler("FlexPollHandler", || Box::new(FlexPollHandler::default()));

        registry
    }

    pub fn register_message_handler<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn MessageHandler> + Send + Sync + 'static,
    {
        self.message.insert(kind.into(), Box::new(factory));
    }

    pub fn register_command_handler<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn CommandHandler> + Send + Sync + 'static,
    {
        self.command.insert(kind.into(), Box::new(factory));
    }

    pub fn register_poll_handler<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn PollHandler> + Send + Sync + 'static,
    {
        self.poll.insert(kind.into(), Box::new(factory));
    }

    /// Build a message handler. `inherited` holds the owning feature's
    /// parameters; they are offered first and silently dropped when the
    /// handler does not know them.
    pub fn build_message_handler(
        &self,
        spec: &HandlerSpec,
        inherited: &BTreeMap<String, String>,
    ) -> Result<Box<dyn MessageHandler>, HandlerError> {
        let factory = self
            .message
            .get(&spec.kind)
            .ok_or_else(|| HandlerError::UnknownHandlerType(spec.kind.clone()))?;
        let mut handler = factory();
        apply_params(handler.as_mut(), spec, inherited);
        Ok(handler)
    }

    pub fn build_command_handler(
        &self,
        spec: &HandlerSpec,
        inherited: &BTreeMap<String, String>,
    ) -> Result<Box<dyn CommandHandler>, HandlerError> {
        let factory = self
            .command
            .get(&spec.kind)
            .ok_or_else(|| HandlerError::UnknownHandlerType(spec.kind.clone()))?;
        let mut handler = factory();
        apply_params(handler.as_mut(), spec, inherited);
        Ok(handler)
    }

    pub fn build_poll_handler(
        &self,
        spec: &HandlerSpec,
        inherited: &BTreeMap<String, String>,
    ) -> Result<Box<dyn PollHandler>, HandlerError> {
        let factory = self
            .poll
            .get(&spec.kind)
            .ok_or_else(|| HandlerError::UnknownHandlerType(spec.kind.clone()))?;
        let mut handler = factory();
        apply_params(handler.as_mut(), spec, inherited);
        Ok(handler)
    }

    pub fn available_message_handlers(&self) -> Vec<&str> {
        sorted_keys(&self.message)
    }

    pub fn available_command_handlers(&self) -> Vec<&str> {
        sorted_keys(&self.command)
    }

    pub fn available_poll_handlers(&self) -> Vec<&str> {
        sorted_keys(&self.poll)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn apply_params<H: Configurable + ?Sized>(
    handler: &mut H,
    spec: &HandlerSpec,
    inherited: &BTreeMap<String, String>,
) {
    for (name, value) in inherited {
        if spec.params.contains_key(name) {
            continue;
        }
        if let Err(e) = handler.configure(name, value) {
            trace!("{} ignores feature parameter: {}", spec.kind, e);
        }
    }
    for (name, value) in &spec.params {
        if let Err(e) = handler.configure(name, value) {
            warn!("Skipping parameter of {}: {}", spec.kind, e);
        }
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::InsteonAddress;
    use crate::message::WireMessage;

    #[test]
    fn test_unknown_kind_is_an_error() {
        let registry = HandlerRegistry::with_builtins();
        let result =
            registry.build_message_handler(&HandlerSpec::new("FancyHandler"), &BTreeMap::new());
        assert!(matches!(result, Err(HandlerError::UnknownHandlerType(kind)) if kind == "FancyHandler"));
    }

    #[test]
    fn test_bad_parameter_is_skipped() {
        let registry = HandlerRegistry::with_builtins();
        let spec = HandlerSpec::new("LightOnSwitchHandler")
            .with_param("colour", "red")
            .with_param("button", "2");
        let handler = registry.build_message_handler(&spec, &BTreeMap::new()).unwrap();

        let from = InsteonAddress::new(0x11, 0x22, 0x33);
        let button_2 = WireMessage::standard(
            from,
            InsteonAddress::for_group(2),
            crate::message::MessageClass::AllLinkBroadcast,
            0x11,
            0x00,
        );
        let button_3 = WireMessage::standard(
            from,
            InsteonAddress::for_group(3),
            crate::message::MessageClass::AllLinkBroadcast,
            0x11,
            0x00,
        );
        assert!(handler.matches(&button_2));
        assert!(!handler.matches(&button_3));
    }

    #[test]
    fn test_spec_params_override_inherited() {
        let registry = HandlerRegistry::with_builtins();
        let mut inherited = BTreeMap::new();
        inherited.insert("button".to_string(), "3".to_string());
        inherited.insert("unrelated".to_string(), "x".to_string());

        let spec = HandlerSpec::new("LightOnSwitchHandler").with_param("button", "2");
        let handler = registry.build_message_handler(&spec, &inherited).unwrap();
        let msg = WireMessage::standard(
            InsteonAddress::new(1, 2, 3),
            InsteonAddress::for_group(2),
            crate::message::MessageClass::AllLinkBroadcast,
            0x11,
            0x00,
        );
        assert!(handler.matches(&msg));

        let inherited_only = registry
            .build_message_handler(&HandlerSpec::new("LightOnSwitchHandler"), &inherited)
            .unwrap();
        assert!(!inherited_only.matches(&msg));
    }

    #[test]
    fn test_builtin_listing() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.available_message_handlers().contains(&"CustomBitmaskMsgHandler"));
        assert!(registry.available_command_handlers().contains(&"PercentHandler"));
        assert_eq!(
            registry.available_poll_handlers(),
            vec!["DefaultPollHandler", "FlexPollHandler", "NoPollHandler"]
        );
        assert!(HandlerRegistry::new().available_message_handlers().is_empty());
    }
}
