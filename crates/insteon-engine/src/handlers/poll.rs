//! Poll handlers build the query that refreshes a feature.

use super::{invalid_value, parse_byte, parse_int, unknown_param, Configurable, PollHandler};
use crate::device::DeviceEntity;
use crate::error::HandlerError;
use crate::message::WireMessage;

/// Feature is refreshed by some other feature's poll.
#[derive(Debug, Default)]
pub struct NoPollHandler;

impl Configurable for NoPollHandler {
    fn kind(&self) -> &'static str {
        "NoPollHandler"
    }

    fn configure(&mut self, name: &str, _value: &str) -> Result<(), HandlerError> {
        Err(unknown_param("NoPollHandler", name))
    }
}

impl PollHandler for NoPollHandler {
    fn make_msg(&self, _device: &DeviceEntity) -> Option<WireMessage> {
        None
    }
}

/// Standard status request, cmd1 0x19.
#[derive(Debug, Default)]
pub struct DefaultPollHandler;

impl Configurable for DefaultPollHandler {
    fn kind(&self) -> &'static str {
        "DefaultPollHandler"
    }

    fn configure(&mut self, name: &str, _value: &str) -> Result<(), HandlerError> {
        Err(unknown_param("DefaultPollHandler", name))
    }
}

impl PollHandler for DefaultPollHandler {
    fn make_msg(&self, device: &DeviceEntity) -> Option<WireMessage> {
        let to = device.address().as_insteon()?;
        Some(WireMessage::direct(to, 0x19, 0x00))
    }
}

/// Query with configurable command bytes and optional extended payload.
#[derive(Debug, Clone)]
pub struct FlexPollHandler {
    cmd1: u8,
    cmd2: u8,
    ext: u8,
    data: [u8; 3],
}

impl Default for FlexPollHandler {
    fn default() -> Self {
        Self {
            cmd1: 0x19,
            cmd2: 0x00,
            ext: 0,
            data: [0; 3],
        }
    }
}

impl Configurable for FlexPollHandler {
    fn kind(&self) -> &'static str {
        "FlexPollHandler"
    }

    fn configure(&mut self, name: &str, value: &str) -> Result<(), HandlerError> {
        match name {
            "cmd1" => self.cmd1 = parse_byte(name, value)?,
            "cmd2" => self.cmd2 = parse_byte(name, value)?,
            "ext" => {
                let ext = parse_int(name, value)?;
                if !(0..=2).contains(&ext) {
                    return Err(invalid_value(name, value));
                }
                self.ext = ext as u8;
            }
            "d1" => self.data[0] = parse_byte(name, value)?,
            "d2" => self.data[1] = parse_byte(name, value)?,
            "d3" => self.data[2] = parse_byte(name, value)?,
            _ => return Err(unknown_param("FlexPollHandler", name)),
        }
        Ok(())
    }
}

impl PollHandler for FlexPollHandler {
    fn make_msg(&self, device: &DeviceEntity) -> Option<WireMessage> {
        let to = device.address().as_insteon()?;
        let msg = match self.ext {
            0 => WireMessage::direct(to, self.cmd1, self.cmd2),
            1 => {
                let mut msg = WireMessage::direct_extended(to, self.cmd1, self.cmd2, &self.data);
                msg.set_checksum();
                msg
            }
            _ => {
                let mut msg = WireMessage::direct_extended(to, self.cmd1, self.cmd2, &self.data);
                msg.set_crc2();
                msg
            }
        };
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flex_poll_params() {
        let mut handler = FlexPollHandler::default();
        handler.configure("cmd1", "0x2E").unwrap();
        handler.configure("ext", "1").unwrap();
        handler.configure("d1", "0x01").unwrap();
        assert_eq!(handler.cmd1, 0x2E);
        assert_eq!(handler.ext, 1);
        assert_eq!(handler.data, [1, 0, 0]);
        assert!(handler.configure("ext", "7").is_err());
        assert!(handler.configure("button", "1").is_err());
    }

    #[test]
    fn test_parameterless_handlers_reject_params() {
        assert!(NoPollHandler.configure("cmd1", "1").is_err());
        assert!(DefaultPollHandler.configure("cmd1", "1").is_err());
    }
}
