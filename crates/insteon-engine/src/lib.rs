//! Declarative dispatch engine for Insteon devices.
//!
//! Provides:
//! - Addresses and wire frames of the Insteon protocol
//! - Pluggable message, command and poll handlers picked by name
//! - Feature templates and device types loaded from JSON
//! - Per-device request queues with one outstanding query at a time
//! - A shared scheduler that paces traffic on the half-duplex link

pub mod address;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod feature;
pub mod group;
pub mod handlers;
pub mod link;
pub mod manager;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod state;

// Re-exports
pub use address::{AddressId, InsteonAddress};

pub use catalog::{
    DeviceTypeDefinition, FeatureGroupRef, FeatureRef, FeatureTemplate, HandlerSpec, LoadIssue,
    LoadReport, MessageHandlerEntry, TemplateCatalog,
};

pub use config::{EngineConfig, MAX_ACK_TIMEOUT};

pub use device::{nack_reason, DeviceBuilder, DeviceEntity, QEntry, MAX_WAIT};

pub use error::{
    AddressError, ConfigError, Error, HandlerError, LinkError, MessageError, Result,
};

pub use feature::{DeviceFeature, FeatureListener, MessageKey};

pub use group::{DuplicateTracker, GroupAction, GroupMessageStateMachine};

pub use handlers::{
    CommandHandler, Configurable, FeatureContext, HandlerBase, MessageFilter, MessageHandler,
    PollHandler,
};

pub use link::{ChannelLink, Link, SentFrame};

pub use manager::{DeviceManager, MAX_STORED_MESSAGES, MAX_STORED_SENDERS};

pub use message::{MessageClass, WireMessage};

pub use registry::HandlerRegistry;

pub use scheduler::{RequestScheduler, SchedulerHandle};

pub use state::{
    CommandKind, DeviceCommand, FeatureState, IncreaseDecrease, QueryStatus, StateChangeType,
};
