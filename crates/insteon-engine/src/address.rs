//! Device addressing.
//!
//! Insteon devices use a 3-byte address written `AA.BB.CC`; X10 devices
//! use a house letter and a unit number written `H.UU`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;

/// A 3-byte Insteon address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InsteonAddress(pub [u8; 3]);

impl InsteonAddress {
    pub const fn new(high: u8, middle: u8, low: u8) -> Self {
        Self([high, middle, low])
    }

    pub fn high_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn middle_byte(&self) -> u8 {
        self.0[1]
    }

    pub fn low_byte(&self) -> u8 {
        self.0[2]
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Destination address used by all-link broadcasts to `group`.
    pub fn for_group(group: u8) -> Self {
        Self([0x00, 0x00, group])
    }
}

impl fmt::Display for InsteonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for InsteonAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidAddressFormat(s.to_string());
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 3];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

/// Endpoint of a device on the shared link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressId {
    Insteon(InsteonAddress),
    /// House code 0-15 (A-P) and unit code 1-16.
    X10 { house: u8, unit: u8 },
}

impl AddressId {
    pub fn insteon(high: u8, middle: u8, low: u8) -> Self {
        Self::Insteon(InsteonAddress::new(high, middle, low))
    }

    pub fn x10(house: char, unit: u8) -> Result<Self, AddressError> {
        let invalid = || AddressError::InvalidAddressFormat(format!("{house}.{unit}"));
        let house = house.to_ascii_uppercase();
        if !('A'..='P').contains(&house) || !(1..=16).contains(&unit) {
            return Err(invalid());
        }
        Ok(Self::X10 {
            house: house as u8 - b'A',
            unit,
        })
    }

    pub fn is_insteon(&self) -> bool {
        matches!(self, Self::Insteon(_))
    }

    pub fn is_x10(&self) -> bool {
        matches!(self, Self::X10 { .. })
    }

    pub fn as_insteon(&self) -> Option<InsteonAddress> {
        match self {
            Self::Insteon(addr) => Some(*addr),
            Self::X10 { .. } => None,
        }
    }
}

impl From<InsteonAddress> for AddressId {
    fn from(addr: InsteonAddress) -> Self {
        Self::Insteon(addr)
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insteon(addr) => addr.fmt(f),
            Self::X10 { house, unit } => write!(f, "{}.{:02}", (b'A' + house) as char, unit),
        }
    }
}

impl FromStr for AddressId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((house, unit)) = s.split_once('.') {
            // X10 form: single house letter, 1-2 digit unit
            let mut letters = house.chars();
            if let (Some(letter), None) = (letters.next(), letters.next()) {
                if letter.is_ascii_alphabetic() && letter.to_ascii_uppercase() <= 'P' {
                    if unit.is_empty() || unit.len() > 2 || !unit.chars().all(|c| c.is_ascii_digit())
                    {
                        return Err(AddressError::InvalidAddressFormat(s.to_string()));
                    }
                    let unit: u8 = unit
                        .parse()
                        .map_err(|_| AddressError::InvalidAddressFormat(s.to_string()))?;
                    return Self::x10(letter, unit)
                        .map_err(|_| AddressError::InvalidAddressFormat(s.to_string()));
                }
            }
        }
        InsteonAddress::from_str(s).map(Self::Insteon)
    }
}

impl Serialize for AddressId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AddressId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
