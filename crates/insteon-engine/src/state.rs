//! Values exchanged with the platform: feature states going up, commands
//! coming down.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Externally visible value of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeatureState {
    OnOff(bool),
    /// 0-100
    Percent(u8),
    Decimal(f64),
    /// `true` when open
    OpenClosed(bool),
    DateTime(DateTime<Utc>),
}

impl FeatureState {
    pub fn on() -> Self {
        Self::OnOff(true)
    }

    pub fn off() -> Self {
        Self::OnOff(false)
    }

    pub fn percent(level: impl Into<f64>) -> Self {
        Self::Percent(level.into().round().clamp(0.0, 100.0) as u8)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnOff(true) => f.write_str("ON"),
            Self::OnOff(false) => f.write_str("OFF"),
            Self::Percent(level) => write!(f, "{level}%"),
            Self::Decimal(value) => write!(f, "{value}"),
            Self::OpenClosed(true) => f.write_str("OPEN"),
            Self::OpenClosed(false) => f.write_str("CLOSED"),
            Self::DateTime(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// When listeners are told about a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeType {
    /// Every update, even when the value is unchanged
    #[default]
    Always,
    /// Only when the value differs from the last published one
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncreaseDecrease {
    Increase,
    Decrease,
}

/// Platform command routed to a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeviceCommand {
    OnOff(bool),
    Percent(u8),
    IncreaseDecrease(IncreaseDecrease),
    Decimal(f64),
    Refresh,
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::OnOff(_) => CommandKind::OnOff,
            Self::Percent(_) => CommandKind::Percent,
            Self::IncreaseDecrease(_) => CommandKind::IncreaseDecrease,
            Self::Decimal(_) => CommandKind::Decimal,
            Self::Refresh => CommandKind::Refresh,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnOff(true) => f.write_str("ON"),
            Self::OnOff(false) => f.write_str("OFF"),
            Self::Percent(level) => write!(f, "{level}%"),
            Self::IncreaseDecrease(IncreaseDecrease::Increase) => f.write_str("INCREASE"),
            Self::IncreaseDecrease(IncreaseDecrease::Decrease) => f.write_str("DECREASE"),
            Self::Decimal(value) => write!(f, "{value}"),
            Self::Refresh => f.write_str("REFRESH"),
        }
    }
}

/// Parses `ON`, `OFF`, `INCREASE`, `DECREASE`, `REFRESH`, `NN%` or a number.
impl FromStr for DeviceCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_uppercase().as_str() {
            "ON" => return Ok(Self::OnOff(true)),
            "OFF" => return Ok(Self::OnOff(false)),
            "INCREASE" => return Ok(Self::IncreaseDecrease(IncreaseDecrease::Increase)),
            "DECREASE" => return Ok(Self::IncreaseDecrease(IncreaseDecrease::Decrease)),
            "REFRESH" => return Ok(Self::Refresh),
            _ => {}
        }
        if let Some(level) = s.strip_suffix('%') {
            return level
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|l| *l <= 100)
                .map(Self::Percent)
                .ok_or_else(|| format!("invalid percent: {s}"));
        }
        s.parse::<f64>()
            .map(Self::Decimal)
            .map_err(|_| format!("unrecognized command: {s}"))
    }
}

/// Key under which a feature registers its command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    OnOff,
    Percent,
    IncreaseDecrease,
    Decimal,
    Refresh,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnOff => "OnOffType",
            Self::Percent => "PercentType",
            Self::IncreaseDecrease => "IncreaseDecreaseType",
            Self::Decimal => "DecimalType",
            Self::Refresh => "RefreshType",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `OnOffType`, `on_off`, `onoff` and similar spellings.
impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized.strip_suffix("type").unwrap_or(normalized.as_str());
        match normalized {
            "onoff" => Ok(Self::OnOff),
            "percent" => Ok(Self::Percent),
            "increasedecrease" => Ok(Self::IncreaseDecrease),
            "decimal" => Ok(Self::Decimal),
            "refresh" => Ok(Self::Refresh),
            _ => Err(format!("unknown command kind: {s}")),
        }
    }
}

/// Query lifecycle of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    NeverQueried,
    /// Request queued, not yet on the link
    QueryCreated,
    /// Request sent, waiting for the reply
    QueryPending,
    QueryAnswered,
}
