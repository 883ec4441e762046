//! Handler families.
//!
//! A feature is assembled from three kinds of handler, each picked by name
//! from the [`HandlerRegistry`](crate::registry::HandlerRegistry) and tuned
//! with string parameters:
//!
//! | Family | Trigger | Effect |
//! |--------|---------|--------|
//! | [`MessageHandler`] | inbound [`WireMessage`] | update feature state |
//! | [`CommandHandler`] | platform [`DeviceCommand`] | enqueue outbound messages |
//! | [`PollHandler`] | poll request | build the status query |

pub mod command;
pub mod message;
pub mod poll;

use std::time::Duration;

use crate::address::{AddressId, InsteonAddress};
use crate::device::DeviceEntity;
use crate::error::HandlerError;
use crate::feature::DeviceFeature;
use crate::message::WireMessage;
use crate::state::{DeviceCommand, FeatureState};

pub use command::{
    FastOnOffCommandHandler, GroupBroadcastCommandHandler, IncreaseDecreaseCommandHandler,
    LightOnOffCommandHandler, ManualChangeCommandHandler, NoOpCommandHandler, PercentHandler,
    RefreshCommandHandler, WarnCommandHandler,
};
pub use message::{
    ContactRequestReplyHandler, CustomMode, CustomMsgHandler, DefaultMsgHandler,
    DimmerRequestReplyHandler, LastTimeMsgHandler, LightOffDimmerHandler, LightOffSwitchHandler,
    LightOnDimmerHandler, LightOnSwitchHandler, NoOpMsgHandler, OpenedOrClosedContactHandler,
    RampDimmerHandler, StartManualChangeHandler, StopManualChangeHandler,
    SwitchRequestReplyHandler, TriggerPollMsgHandler,
};
pub use poll::{DefaultPollHandler, FlexPollHandler, NoPollHandler};

/// Parameter sink shared by every handler family.
pub trait Configurable: Send + Sync {
    /// Registry name of this handler kind.
    fn kind(&self) -> &'static str;

    /// Apply one named parameter. Unknown names must be rejected with
    /// [`HandlerError::UnknownHandlerParameter`].
    fn configure(&mut self, name: &str, value: &str) -> Result<(), HandlerError>;
}

/// Reacts to inbound messages routed to a feature.
pub trait MessageHandler: Configurable {
    /// Filter predicate. Unset comparators always match.
    fn matches(&self, msg: &WireMessage) -> bool;

    /// Process `msg`. Returns `true` when the handler acted on it.
    fn handle(&self, ctx: &FeatureContext<'_>, msg: &WireMessage) -> bool;

    /// Whether repeated group messages (broadcast, cleanup, success) are
    /// filtered out before this handler sees them.
    fn suppresses_duplicates(&self) -> bool {
        true
    }
}

/// Turns a platform command into outbound messages.
pub trait CommandHandler: Configurable {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand);
}

/// Builds the status query for a feature.
pub trait PollHandler: Configurable {
    /// `None` when the feature is not independently pollable.
    fn make_msg(&self, device: &DeviceEntity) -> Option<WireMessage>;
}

/// What a handler can see and touch while it runs.
pub struct FeatureContext<'a> {
    pub device: &'a DeviceEntity,
    pub feature: &'a DeviceFeature,
}

impl<'a> FeatureContext<'a> {
    pub fn new(device: &'a DeviceEntity, feature: &'a DeviceFeature) -> Self {
        Self { device, feature }
    }

    pub fn address(&self) -> AddressId {
        self.device.address()
    }

    pub fn insteon_address(&self) -> Option<InsteonAddress> {
        self.device.address().as_insteon()
    }

    /// Name used in log lines: `AA.BB.CC:feature`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.device.address(), self.feature.name())
    }

    pub fn publish(&self, state: FeatureState) {
        self.feature.update_state(state);
    }

    pub fn enqueue(&self, msg: WireMessage) {
        self.enqueue_delayed(msg, Duration::ZERO);
    }

    pub fn enqueue_delayed(&self, msg: WireMessage, delay: Duration) {
        self.device.enqueue_for(self.feature.name(), msg, delay);
    }

    pub fn trigger_poll(&self, delay: Duration) {
        self.device.do_poll_feature(self.feature.name(), delay);
    }
}

/// Optional byte comparators applied to inbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// 0 = standard only, 1 or 2 = extended only
    pub ext: Option<u8>,
    /// Only checked when `ext` is set
    pub cmd1: Option<u8>,
    pub cmd2: Option<u8>,
    pub d1: Option<u8>,
    pub d2: Option<u8>,
    pub d3: Option<u8>,
}

impl MessageFilter {
    pub fn matches(&self, msg: &WireMessage) -> bool {
        if let Some(ext) = self.ext {
            let wanted_extended = ext != 0;
            if msg.is_extended() != wanted_extended {
                return false;
            }
            if !field_matches(self.cmd1, Some(msg.cmd1())) {
                return false;
            }
        }
        field_matches(self.cmd2, Some(msg.cmd2()))
            && field_matches(self.d1, msg.user_data_byte(1))
            && field_matches(self.d2, msg.user_data_byte(2))
            && field_matches(self.d3, msg.user_data_byte(3))
    }
}

fn field_matches(expected: Option<u8>, actual: Option<u8>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual == Some(expected),
    }
}

/// Filter state every message handler carries.
#[derive(Debug, Clone, Default)]
pub struct HandlerBase {
    pub filter: MessageFilter,
    pub button: Option<u8>,
    pub group: Option<u8>,
}

impl HandlerBase {
    /// Apply a filter parameter. Returns `UnknownHandlerParameter` for
    /// anything that is not a filter.
    pub fn apply_param(
        &mut self,
        kind: &'static str,
        name: &str,
        value: &str,
    ) -> Result<(), HandlerError> {
        let slot = match name {
            "ext" => &mut self.filter.ext,
            "cmd1" => &mut self.filter.cmd1,
            "cmd2" => &mut self.filter.cmd2,
            "d1" => &mut self.filter.d1,
            "d2" => &mut self.filter.d2,
            "d3" => &mut self.filter.d3,
            "button" => &mut self.button,
            "group" => &mut self.group,
            _ => return Err(unknown_param(kind, name)),
        };
        *slot = parse_optional_byte(name, value)?;
        Ok(())
    }

    pub fn matches(&self, msg: &WireMessage) -> bool {
        self.filter.matches(msg) && self.is_my_button(msg) && self.matches_group(msg)
    }

    /// Button is the destination low byte for broadcasts, cmd2 otherwise.
    pub fn is_my_button(&self, msg: &WireMessage) -> bool {
        match self.button {
            None => true,
            Some(button) => button_of(msg) == button,
        }
    }

    /// Only group traffic carries a group number; everything else passes.
    pub fn matches_group(&self, msg: &WireMessage) -> bool {
        match (self.group, msg.group()) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }
}

pub fn button_of(msg: &WireMessage) -> u8 {
    if msg.is_broadcast() {
        msg.to_address().low_byte()
    } else {
        msg.cmd2()
    }
}

pub(crate) fn unknown_param(kind: &str, name: &str) -> HandlerError {
    HandlerError::UnknownHandlerParameter {
        handler: kind.to_string(),
        param: name.to_string(),
    }
}

pub(crate) fn invalid_value(name: &str, value: &str) -> HandlerError {
    HandlerError::InvalidParameterValue {
        param: name.to_string(),
        value: value.to_string(),
    }
}

/// Integer in decimal or `0x` hex.
pub fn parse_int(name: &str, value: &str) -> Result<i64, HandlerError> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        trimmed.parse()
    };
    parsed.map_err(|_| invalid_value(name, value))
}

/// Byte parameter where `-1` means unset.
pub fn parse_optional_byte(name: &str, value: &str) -> Result<Option<u8>, HandlerError> {
    match parse_int(name, value)? {
        -1 => Ok(None),
        v @ 0..=255 => Ok(Some(v as u8)),
        _ => Err(invalid_value(name, value)),
    }
}

pub fn parse_byte(name: &str, value: &str) -> Result<u8, HandlerError> {
    parse_optional_byte(name, value)?.ok_or_else(|| invalid_value(name, value))
}

pub fn parse_float(name: &str, value: &str) -> Result<f64, HandlerError> {
    value.trim().parse().map_err(|_| invalid_value(name, value))
}

pub fn parse_bool(name: &str, value: &str) -> Result<bool, HandlerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid_value(name, value)),
    }
}

pub fn parse_millis(name: &str, value: &str) -> Result<Duration, HandlerError> {
    let ms = parse_int(name, value)?;
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| invalid_value(name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageClass;

    fn broadcast_to_button(button: u8) -> WireMessage {
        WireMessage::standard(
            InsteonAddress::new(0x11, 0x22, 0x33),
            InsteonAddress::for_group(button),
            MessageClass::AllLinkBroadcast,
            0x11,
            0x00,
        )
    }

    #[test]
    fn test_button_filter_on_broadcast() {
        let mut base = HandlerBase::default();
        base.apply_param("Test", "button", "2").unwrap();
        assert!(base.matches(&broadcast_to_button(2)));
        assert!(!base.matches(&broadcast_to_button(3)));

        let unset = HandlerBase::default();
        assert!(unset.matches(&broadcast_to_button(2)));
        assert!(unset.matches(&broadcast_to_button(3)));
    }

    #[test]
    fn test_button_filter_on_cleanup_uses_cmd2() {
        let mut base = HandlerBase::default();
        base.apply_param("Test", "button", "3").unwrap();
        let cleanup = WireMessage::standard(
            InsteonAddress::new(0x11, 0x22, 0x33),
            InsteonAddress::new(0x44, 0x55, 0x66),
            MessageClass::AllLinkCleanup,
            0x11,
            0x03,
        );
        assert!(base.matches(&cleanup));
    }

    #[test]
    fn test_filter_unset_always_matches() {
        let filter = MessageFilter::default();
        let msg = WireMessage::direct(InsteonAddress::new(1, 2, 3), 0x19, 0x42);
        assert!(filter.matches(&msg));
    }

    #[test]
    fn test_filter_ext_and_payload() {
        let mut base = HandlerBase::default();
        base.apply_param("Test", "ext", "1").unwrap();
        base.apply_param("Test", "cmd1", "0x2E").unwrap();
        base.apply_param("Test", "d1", "0x01").unwrap();
        base.apply_param("Test", "d2", "-1").unwrap();

        let addr = InsteonAddress::new(1, 2, 3);
        assert!(base.matches(&WireMessage::direct_extended(addr, 0x2E, 0x00, &[0x01])));
        assert!(!base.matches(&WireMessage::direct_extended(addr, 0x2E, 0x00, &[0x02])));
        assert!(!base.matches(&WireMessage::direct_extended(addr, 0x2F, 0x00, &[0x01])));
        assert!(!base.matches(&WireMessage::direct(addr, 0x2E, 0x00)));
    }

    #[test]
    fn test_apply_param_errors() {
        let mut base = HandlerBase::default();
        assert!(matches!(
            base.apply_param("Test", "colour", "red"),
            Err(HandlerError::UnknownHandlerParameter { .. })
        ));
        assert!(matches!(
            base.apply_param("Test", "cmd2", "300"),
            Err(HandlerError::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            base.apply_param("Test", "cmd2", "abc"),
            Err(HandlerError::InvalidParameterValue { .. })
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_int("x", "0x1F").unwrap(), 31);
        assert_eq!(parse_int("x", " 12 ").unwrap(), 12);
        assert_eq!(parse_optional_byte("x", "-1").unwrap(), None);
        assert!(parse_byte("x", "-1").is_err());
        assert!(parse_bool("x", "TRUE").unwrap());
        assert_eq!(parse_millis("x", "1500").unwrap(), Duration::from_millis(1500));
        assert!(parse_millis("x", "-5").is_err());
    }
}
