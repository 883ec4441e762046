//! Insteon wire messages.
//!
//! Inbound frames are the modem's "standard message received" (`0x02 0x50`,
//! 11 bytes) and "extended message received" (`0x02 0x51`, 25 bytes):
//!
//! ```text
//! 02 5x | from[3] | to[3] | flags | cmd1 | cmd2 | [ud1 .. ud14]
//! ```
//!
//! Flags: bits 7-5 message class, bit 4 extended, bits 3-2 hops left,
//! bits 1-0 max hops.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::InsteonAddress;
use crate::error::MessageError;

pub const START_BYTE: u8 = 0x02;
pub const STANDARD_RECEIVED: u8 = 0x50;
pub const EXTENDED_RECEIVED: u8 = 0x51;
pub const STANDARD_LENGTH: usize = 11;
pub const EXTENDED_LENGTH: usize = 25;
pub const USER_DATA_LENGTH: usize = 14;

/// Default quiet time after a direct message.
pub const DIRECT_QUIET_TIME: Duration = Duration::from_millis(500);
/// Default quiet time after a broadcast or group message.
pub const BROADCAST_QUIET_TIME: Duration = Duration::from_millis(1500);

const EXTENDED_FLAG: u8 = 0x10;

/// Message class carried in the upper three bits of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Direct,
    AckOfDirect,
    AllLinkCleanup,
    AllLinkCleanupAck,
    Broadcast,
    NackOfDirect,
    AllLinkBroadcast,
    AllLinkCleanupNack,
}

impl MessageClass {
    pub fn from_flags(flags: u8) -> Self {
        match flags >> 5 {
            0b000 => Self::Direct,
            0b001 => Self::AckOfDirect,
            0b010 => Self::AllLinkCleanup,
            0b011 => Self::AllLinkCleanupAck,
            0b100 => Self::Broadcast,
            0b101 => Self::NackOfDirect,
            0b110 => Self::AllLinkBroadcast,
            _ => Self::AllLinkCleanupNack,
        }
    }

    pub fn bits(self) -> u8 {
        let bits = match self {
            Self::Direct => 0b000,
            Self::AckOfDirect => 0b001,
            Self::AllLinkCleanup => 0b010,
            Self::AllLinkCleanupAck => 0b011,
            Self::Broadcast => 0b100,
            Self::NackOfDirect => 0b101,
            Self::AllLinkBroadcast => 0b110,
            Self::AllLinkCleanupNack => 0b111,
        };
        bits << 5
    }

    pub fn is_broadcast(self) -> bool {
        matches!(self, Self::Broadcast | Self::AllLinkBroadcast)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "DIRECT",
            Self::AckOfDirect => "ACK_OF_DIRECT",
            Self::AllLinkCleanup => "ALL_LINK_CLEANUP",
            Self::AllLinkCleanupAck => "ALL_LINK_CLEANUP_ACK",
            Self::Broadcast => "BROADCAST",
            Self::NackOfDirect => "NACK_OF_DIRECT",
            Self::AllLinkBroadcast => "ALL_LINK_BROADCAST",
            Self::AllLinkCleanupNack => "ALL_LINK_CLEANUP_NACK",
        };
        f.write_str(name)
    }
}

/// A decoded (or to-be-encoded) Insteon message.
///
/// `quiet_time` is a post-construction rate limiting hint and takes no part
/// in equality or hashing.
#[derive(Debug, Clone)]
pub struct WireMessage {
    from: InsteonAddress,
    to: InsteonAddress,
    class: MessageClass,
    hops_left: u8,
    max_hops: u8,
    cmd1: u8,
    cmd2: u8,
    user_data: Option<[u8; USER_DATA_LENGTH]>,
    quiet_time: Duration,
}

impl WireMessage {
    /// Standard-length message.
    pub fn standard(
        from: InsteonAddress,
        to: InsteonAddress,
        class: MessageClass,
        cmd1: u8,
        cmd2: u8,
    ) -> Self {
        Self {
            from,
            to,
            class,
            hops_left: 3,
            max_hops: 3,
            cmd1,
            cmd2,
            user_data: None,
            quiet_time: default_quiet_time(class),
        }
    }

    /// Extended message with a 14-byte payload.
    pub fn extended(
        from: InsteonAddress,
        to: InsteonAddress,
        class: MessageClass,
        cmd1: u8,
        cmd2: u8,
        user_data: [u8; USER_DATA_LENGTH],
    ) -> Self {
        Self {
            user_data: Some(user_data),
            ..Self::standard(from, to, class, cmd1, cmd2)
        }
    }

    /// Outbound direct request to `to`. The modem fills in the source address.
    pub fn direct(to: InsteonAddress, cmd1: u8, cmd2: u8) -> Self {
        Self::standard(InsteonAddress::default(), to, MessageClass::Direct, cmd1, cmd2)
    }

    /// Outbound extended direct request with leading user data bytes.
    pub fn direct_extended(to: InsteonAddress, cmd1: u8, cmd2: u8, data: &[u8]) -> Self {
        let mut user_data = [0u8; USER_DATA_LENGTH];
        for (slot, byte) in user_data.iter_mut().zip(data) {
            *slot = *byte;
        }
        Self::extended(
            InsteonAddress::default(),
            to,
            MessageClass::Direct,
            cmd1,
            cmd2,
            user_data,
        )
    }

    /// Outbound all-link broadcast to `group`.
    pub fn group_broadcast(group: u8, cmd1: u8, cmd2: u8) -> Self {
        Self::standard(
            InsteonAddress::default(),
            InsteonAddress::for_group(group),
            MessageClass::AllLinkBroadcast,
            cmd1,
            cmd2,
        )
    }

    pub fn with_hops(mut self, hops_left: u8, max_hops: u8) -> Self {
        self.hops_left = hops_left & 0x03;
        self.max_hops = max_hops & 0x03;
        self
    }

    /// Decode a modem received-message frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < 2 {
            return Err(MessageError::InsufficientLength {
                expected: STANDARD_LENGTH,
                actual: bytes.len(),
            });
        }
        if bytes[0] != START_BYTE {
            return Err(MessageError::UnknownCommand(bytes[0]));
        }
        let (expected, kind) = match bytes[1] {
            STANDARD_RECEIVED => (STANDARD_LENGTH, "standard"),
            EXTENDED_RECEIVED => (EXTENDED_LENGTH, "extended"),
            other => return Err(MessageError::UnknownCommand(other)),
        };
        if bytes.len() < expected {
            return Err(MessageError::InsufficientLength {
                expected,
                actual: bytes.len(),
            });
        }

        let flags = bytes[8];
        let is_extended = flags & EXTENDED_FLAG != 0;
        if is_extended != (expected == EXTENDED_LENGTH) {
            return Err(MessageError::BadFlags { flags, kind });
        }

        let from = InsteonAddress::new(bytes[2], bytes[3], bytes[4]);
        let to = InsteonAddress::new(bytes[5], bytes[6], bytes[7]);
        let class = MessageClass::from_flags(flags);
        let user_data = if is_extended {
            let mut data = [0u8; USER_DATA_LENGTH];
            data.copy_from_slice(&bytes[11..EXTENDED_LENGTH]);
            Some(data)
        } else {
            None
        };

        Ok(Self {
            from,
            to,
            class,
            hops_left: (flags >> 2) & 0x03,
            max_hops: flags & 0x03,
            cmd1: bytes[9],
            cmd2: bytes[10],
            user_data,
            quiet_time: default_quiet_time(class),
        })
    }

    /// Encode into the received-message frame format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(if self.is_extended() {
            EXTENDED_LENGTH
        } else {
            STANDARD_LENGTH
        });
        out.push(START_BYTE);
        out.push(if self.is_extended() {
            EXTENDED_RECEIVED
        } else {
            STANDARD_RECEIVED
        });
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.as_bytes());
        out.push(self.flags());
        out.push(self.cmd1);
        out.push(self.cmd2);
        if let Some(data) = &self.user_data {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn flags(&self) -> u8 {
        let ext = if self.is_extended() { EXTENDED_FLAG } else { 0 };
        self.class.bits() | ext | (self.hops_left << 2) | self.max_hops
    }

    pub fn from_address(&self) -> InsteonAddress {
        self.from
    }

    pub fn to_address(&self) -> InsteonAddress {
        self.to
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn cmd1(&self) -> u8 {
        self.cmd1
    }

    pub fn cmd2(&self) -> u8 {
        self.cmd2
    }

    pub fn hops_left(&self) -> u8 {
        self.hops_left
    }

    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    pub fn user_data(&self) -> Option<&[u8; USER_DATA_LENGTH]> {
        self.user_data.as_ref()
    }

    /// User data byte `n` (1-based, as in `d1`..`d14`). `None` for standard messages.
    pub fn user_data_byte(&self, n: usize) -> Option<u8> {
        if n == 0 {
            return None;
        }
        self.user_data.as_ref().and_then(|d| d.get(n - 1).copied())
    }

    pub fn is_extended(&self) -> bool {
        self.user_data.is_some()
    }

    pub fn is_broadcast(&self) -> bool {
        self.class.is_broadcast()
    }

    pub fn is_all_link_broadcast(&self) -> bool {
        self.class == MessageClass::AllLinkBroadcast
    }

    pub fn is_direct(&self) -> bool {
        self.class == MessageClass::Direct
    }

    pub fn is_ack_of_direct(&self) -> bool {
        self.class == MessageClass::AckOfDirect
    }

    pub fn is_nack_of_direct(&self) -> bool {
        self.class == MessageClass::NackOfDirect
    }

    pub fn is_all_link_cleanup(&self) -> bool {
        self.class == MessageClass::AllLinkCleanup
    }

    pub fn is_all_link_broadcast_or_cleanup(&self) -> bool {
        self.is_all_link_broadcast() || self.is_all_link_cleanup()
    }

    /// Ack or nack answering a direct request.
    pub fn is_reply(&self) -> bool {
        self.is_ack_of_direct() || self.is_nack_of_direct()
    }

    /// Group number: destination low byte for all-link broadcasts, cmd2 for cleanups.
    pub fn group(&self) -> Option<u8> {
        match self.class {
            MessageClass::AllLinkBroadcast => Some(self.to.low_byte()),
            MessageClass::AllLinkCleanup | MessageClass::AllLinkCleanupAck => Some(self.cmd2),
            _ => None,
        }
    }

    /// Store the one-byte checksum of `cmd1, cmd2, d1..d13` in `d14`.
    pub fn set_checksum(&mut self) {
        let (cmd1, cmd2) = (self.cmd1, self.cmd2);
        if let Some(data) = self.user_data.as_mut() {
            let sum = data[..13]
                .iter()
                .fold(cmd1.wrapping_add(cmd2), |acc, b| acc.wrapping_add(*b));
            data[13] = (!sum).wrapping_add(1);
        }
    }

    /// Store the two-byte CRC of `cmd1, cmd2, d1..d12` in `d13` and `d14`.
    pub fn set_crc2(&mut self) {
        let (cmd1, cmd2) = (self.cmd1, self.cmd2);
        if let Some(data) = self.user_data.as_mut() {
            let mut crc: u16 = 0;
            for byte in [cmd1, cmd2].iter().chain(data[..12].iter()) {
                let mut b = *byte;
                for _ in 0..8 {
                    let mut fb = u16::from(b & 0x01);
                    for tap in [0x8000u16, 0x4000, 0x1000, 0x0008] {
                        if crc & tap != 0 {
                            fb ^= 0x01;
                        }
                    }
                    crc = (crc << 1) | fb;
                    b >>= 1;
                }
            }
            data[12] = (crc >> 8) as u8;
            data[13] = (crc & 0xFF) as u8;
        }
    }

    pub fn quiet_time(&self) -> Duration {
        self.quiet_time
    }

    pub fn set_quiet_time(&mut self, quiet_time: Duration) {
        self.quiet_time = quiet_time;
    }
}

/// Protocol minimum pause after sending a message of `class`.
pub fn default_quiet_time(class: MessageClass) -> Duration {
    if class.is_broadcast() {
        BROADCAST_QUIET_TIME
    } else {
        DIRECT_QUIET_TIME
    }
}

impl PartialEq for WireMessage {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.class == other.class
            && self.hops_left == other.hops_left
            && self.max_hops == other.max_hops
            && self.cmd1 == other.cmd1
            && self.cmd2 == other.cmd2
            && self.user_data == other.user_data
    }
}

impl Eq for WireMessage {}

impl Hash for WireMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.from.hash(state);
        self.to.hash(state);
        self.class.hash(state);
        self.hops_left.hash(state);
        self.max_hops.hash(state);
        self.cmd1.hash(state);
        self.cmd2.hash(state);
        self.user_data.hash(state);
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}{} cmd1=0x{:02X} cmd2=0x{:02X}",
            self.from,
            self.to,
            self.class,
            if self.is_extended() { " EXT" } else { "" },
            self.cmd1,
            self.cmd2
        )?;
        if let Some(data) = &self.user_data {
            write!(f, " data={}", hex::encode_upper(data))?;
        }
        Ok(())
    }
}
