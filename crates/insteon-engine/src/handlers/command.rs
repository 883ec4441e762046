//! Built-in command handlers.

use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{
    invalid_value, parse_byte, parse_int, parse_optional_byte, unknown_param, CommandHandler,
    Configurable, FeatureContext,
};
use crate::error::HandlerError;
use crate::message::WireMessage;
use crate::state::{DeviceCommand, IncreaseDecrease};

/// Addressing options shared by command handlers.
#[derive(Debug, Clone, Default)]
pub struct CommandBase {
    /// 0 standard, 1 extended with checksum, 2 extended with CRC
    pub ext: u8,
    pub d1: u8,
    pub d2: u8,
    pub d3: u8,
    /// Send as an all-link broadcast to this group instead of direct
    pub group: Option<u8>,
    /// Cap for "on" levels
    pub on_level: Option<u8>,
}

impl CommandBase {
    pub fn apply_param(
        &mut self,
        kind: &'static str,
        name: &str,
        value: &str,
    ) -> Result<(), HandlerError> {
        match name {
            "ext" => {
                let ext = parse_int(name, value)?;
                if !(0..=2).contains(&ext) {
                    return Err(invalid_value(name, value));
                }
                self.ext = ext as u8;
            }
            "d1" => self.d1 = parse_byte(name, value)?,
            "d2" => self.d2 = parse_byte(name, value)?,
            "d3" => self.d3 = parse_byte(name, value)?,
            "group" => self.group = parse_optional_byte(name, value)?,
            "on_level" => self.on_level = parse_optional_byte(name, value)?,
            _ => return Err(unknown_param(kind, name)),
        }
        Ok(())
    }

    fn level(&self, requested: u8) -> u8 {
        self.on_level.map_or(requested, |max| requested.min(max))
    }

    /// Build a group broadcast or a (possibly extended) direct message.
    fn build(&self, ctx: &FeatureContext<'_>, cmd1: u8, cmd2: u8) -> Option<WireMessage> {
        if let Some(group) = self.group {
            return Some(WireMessage::group_broadcast(group, cmd1, cmd2));
        }
        let Some(to) = ctx.insteon_address() else {
            warn!("{}: cannot address non-Insteon device", ctx.label());
            return None;
        };
        let msg = match self.ext {
            0 => WireMessage::direct(to, cmd1, cmd2),
            ext => {
                let mut msg =
                    WireMessage::direct_extended(to, cmd1, cmd2, &[self.d1, self.d2, self.d3]);
                if ext == 1 {
                    msg.set_checksum();
                } else {
                    msg.set_crc2();
                }
                msg
            }
        };
        Some(msg)
    }

    fn send(&self, ctx: &FeatureContext<'_>, cmd1: u8, cmd2: u8) {
        if let Some(msg) = self.build(ctx, cmd1, cmd2) {
            debug!("{}: sending {}", ctx.label(), msg);
            ctx.enqueue(msg);
        }
    }
}

macro_rules! command_configurable {
    ($ty:ty, $kind:literal) => {
        impl Configurable for $ty {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn configure(&mut self, name: &str, value: &str) -> Result<(), HandlerError> {
                self.base.apply_param($kind, name, value)
            }
        }
    };
}

fn unsupported(ctx: &FeatureContext<'_>, kind: &str, command: &DeviceCommand) {
    warn!("{}: {} cannot handle command {}", ctx.label(), kind, command);
}

/// Default when a feature has nothing configured for a command kind.
#[derive(Debug, Default)]
pub struct NoOpCommandHandler {
    base: CommandBase,
}

command_configurable!(NoOpCommandHandler, "NoOpCommandHandler");

impl CommandHandler for NoOpCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        trace!("{}: ignoring command {}", ctx.label(), command);
    }
}

#[derive(Debug, Default)]
pub struct WarnCommandHandler {
    base: CommandBase,
}

command_configurable!(WarnCommandHandler, "WarnCommandHandler");

impl CommandHandler for WarnCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        warn!("{}: command {} is not implemented", ctx.label(), command);
    }
}

/// ON sends 0x11 with the on-level, OFF sends 0x13.
#[derive(Debug, Default)]
pub struct LightOnOffCommandHandler {
    base: CommandBase,
}

command_configurable!(LightOnOffCommandHandler, "LightOnOffCommandHandler");

impl CommandHandler for LightOnOffCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        match command {
            DeviceCommand::OnOff(true) => self.base.send(ctx, 0x11, self.base.level(0xFF)),
            DeviceCommand::OnOff(false) => self.base.send(ctx, 0x13, 0x00),
            other => unsupported(ctx, self.kind(), other),
        }
    }
}

/// Instant on/off: 0x12 and 0x14.
#[derive(Debug, Default)]
pub struct FastOnOffCommandHandler {
    base: CommandBase,
}

command_configurable!(FastOnOffCommandHandler, "FastOnOffCommandHandler");

impl CommandHandler for FastOnOffCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        match command {
            DeviceCommand::OnOff(true) => self.base.send(ctx, 0x12, self.base.level(0xFF)),
            DeviceCommand::OnOff(false) => self.base.send(ctx, 0x14, 0x00),
            other => unsupported(ctx, self.kind(), other),
        }
    }
}

/// Percent level, rounded up onto 0-255. Zero switches off.
#[derive(Debug, Default)]
pub struct PercentHandler {
    base: CommandBase,
}

command_configurable!(PercentHandler, "PercentHandler");

impl PercentHandler {
    pub fn level_for(percent: u8) -> u8 {
        let percent = u32::from(percent.min(100));
        ((percent * 255).div_ceil(100)) as u8
    }
}

impl CommandHandler for PercentHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        let percent = match command {
            DeviceCommand::Percent(p) => *p,
            DeviceCommand::OnOff(true) => 100,
            DeviceCommand::OnOff(false) => 0,
            other => return unsupported(ctx, self.kind(), other),
        };
        match Self::level_for(percent) {
            0 => self.base.send(ctx, 0x13, 0x00),
            level => self.base.send(ctx, 0x11, self.base.level(level)),
        }
    }
}

/// Brighten (0x15) or dim (0x16) one step.
#[derive(Debug, Default)]
pub struct IncreaseDecreaseCommandHandler {
    base: CommandBase,
}

command_configurable!(IncreaseDecreaseCommandHandler, "IncreaseDecreaseCommandHandler");

impl CommandHandler for IncreaseDecreaseCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        match command {
            DeviceCommand::IncreaseDecrease(IncreaseDecrease::Increase) => {
                self.base.send(ctx, 0x15, 0x00)
            }
            DeviceCommand::IncreaseDecrease(IncreaseDecrease::Decrease) => {
                self.base.send(ctx, 0x16, 0x00)
            }
            other => unsupported(ctx, self.kind(), other),
        }
    }
}

/// Decimal 0 starts dimming down, 2 starts brightening, 1 stops.
#[derive(Debug, Default)]
pub struct ManualChangeCommandHandler {
    base: CommandBase,
}

command_configurable!(ManualChangeCommandHandler, "ManualChangeCommandHandler");

impl CommandHandler for ManualChangeCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        let DeviceCommand::Decimal(value) = command else {
            return unsupported(ctx, self.kind(), command);
        };
        let value = value.round() as i64;
        let cmd1 = if value == 1 { 0x18 } else { 0x17 };
        let cmd2 = if value == 2 { 0x01 } else { 0x00 };
        self.base.send(ctx, cmd1, cmd2);
    }
}

/// ON/OFF as an all-link broadcast; needs a `group`.
#[derive(Debug, Default)]
pub struct GroupBroadcastCommandHandler {
    base: CommandBase,
}

command_configurable!(GroupBroadcastCommandHandler, "GroupBroadcastCommandHandler");

impl CommandHandler for GroupBroadcastCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, command: &DeviceCommand) {
        let Some(group) = self.base.group else {
            warn!("{}: no group configured for broadcast", ctx.label());
            return;
        };
        let (cmd1, cmd2) = match command {
            DeviceCommand::OnOff(true) => (0x11, 0xFF),
            DeviceCommand::OnOff(false) => (0x13, 0x00),
            other => return unsupported(ctx, self.kind(), other),
        };
        debug!("{}: broadcasting {} to group {}", ctx.label(), command, group);
        ctx.enqueue(WireMessage::group_broadcast(group, cmd1, cmd2));
    }
}

/// Polls the feature.
#[derive(Debug, Default)]
pub struct RefreshCommandHandler {
    delay: Duration,
}

impl Configurable for RefreshCommandHandler {
    fn kind(&self) -> &'static str {
        "RefreshCommandHandler"
    }

    fn configure(&mut self, name: &str, value: &str) -> Result<(), HandlerError> {
        match name {
            "delay" => self.delay = super::parse_millis(name, value)?,
            _ => return Err(unknown_param("RefreshCommandHandler", name)),
        }
        Ok(())
    }
}

impl CommandHandler for RefreshCommandHandler {
    fn handle(&self, ctx: &FeatureContext<'_>, _command: &DeviceCommand) {
        debug!("{}: refresh requested", ctx.label());
        ctx.trigger_poll(self.delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_level_rounds_up() {
        assert_eq!(PercentHandler::level_for(0), 0);
        assert_eq!(PercentHandler::level_for(1), 3);
        assert_eq!(PercentHandler::level_for(50), 128);
        assert_eq!(PercentHandler::level_for(100), 255);
    }

    #[test]
    fn test_command_base_params() {
        let mut base = CommandBase::default();
        base.apply_param("Test", "ext", "1").unwrap();
        base.apply_param("Test", "d1", "0x02").unwrap();
        base.apply_param("Test", "on_level", "0x80").unwrap();
        assert_eq!(base.ext, 1);
        assert_eq!(base.d1, 2);
        assert_eq!(base.level(0xFF), 0x80);
        assert!(base.apply_param("Test", "ext", "3").is_err());
        assert!(matches!(
            base.apply_param("Test", "button", "1"),
            Err(HandlerError::UnknownHandlerParameter { .. })
        ));
    }
}
