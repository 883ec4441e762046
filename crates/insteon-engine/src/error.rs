//! Error types for the dispatch engine.
//!
//! Configuration errors abort a single definition, handler errors degrade a
//! single handler or parameter, and link errors drop a single queued request.
//! Nothing here is allowed to take down the scheduler.

use thiserror::Error;

/// Failure to parse a device address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Neither the `aa.bb.cc` nor the `H.UU` grammar matched.
    #[error("Invalid address format: {0}")]
    InvalidAddressFormat(String),
}

/// Failure to decode a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Frame shorter than its type requires.
    #[error("Insufficient length: expected {expected} bytes, got {actual}")]
    InsufficientLength { expected: usize, actual: usize },

    /// Start byte or modem command is not a supported received-message frame.
    #[error("Unknown frame command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Extended flag disagrees with the frame type.
    #[error("Bad flags byte 0x{flags:02X} for {kind} frame")]
    BadFlags { flags: u8, kind: &'static str },
}

/// Failure to build or configure a handler from its spec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("Unknown handler type: {0}")]
    UnknownHandlerType(String),

    #[error("Unknown parameter '{param}' for handler {handler}")]
    UnknownHandlerParameter { handler: String, param: String },

    #[error("Invalid value '{value}' for parameter '{param}'")]
    InvalidParameterValue { param: String, value: String },
}

/// Failure while loading templates or device types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required attribute '{attribute}' in {context}")]
    MissingAttribute { attribute: String, context: String },

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Invalid timeout '{0}'")]
    InvalidTimeout(String),

    #[error("Invalid message key '{0}'")]
    InvalidMessageKey(String),

    #[error("Invalid command kind '{0}'")]
    InvalidCommandKind(String),

    #[error("Unknown feature template '{template}' referenced by {product_key}")]
    UnknownTemplate { template: String, product_key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure writing to the shared link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(String),

    #[error("Link write timed out after {0}ms")]
    Timeout(u64),

    #[error("Link is closed")]
    Closed,

    #[error("Address not supported by link: {0}")]
    UnsupportedAddress(String),
}

/// Engine-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unknown product key: {0}")]
    UnknownProductKey(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
