//! Device manager.
//!
//! Owns everything a running engine needs: configuration, handler registry,
//! template catalog, the link, the scheduler and the device table. Inbound
//! frames enter here and are routed by source address.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::{AddressId, InsteonAddress};
use crate::catalog::TemplateCatalog;
use crate::config::EngineConfig;
use crate::device::{DeviceBuilder, DeviceEntity};
use crate::error::{Error, Result};
use crate::link::Link;
use crate::message::WireMessage;
use crate::registry::HandlerRegistry;
use crate::scheduler::RequestScheduler;
use crate::state::DeviceCommand;

/// Frames kept per unknown address until the device is added.
pub const MAX_STORED_MESSAGES: usize = 20;

/// Unknown addresses with stored frames; the one silent longest makes room.
pub const MAX_STORED_SENDERS: usize = 64;

#[derive(Debug)]
struct StoredFrames {
    frames: VecDeque<WireMessage>,
    last_seen: Instant,
}

pub struct DeviceManager {
    config: Arc<EngineConfig>,
    registry: HandlerRegistry,
    catalog: TemplateCatalog,
    link: Arc<dyn Link>,
    scheduler: RequestScheduler,
    devices: DashMap<AddressId, Arc<DeviceEntity>>,
    stored: DashMap<InsteonAddress, StoredFrames>,
}

impl DeviceManager {
    pub fn new(
        config: EngineConfig,
        registry: HandlerRegistry,
        catalog: TemplateCatalog,
        link: Arc<dyn Link>,
    ) -> Self {
        let scheduler = RequestScheduler::new(&config);
        Self {
            config: Arc::new(config),
            registry,
            catalog,
            link,
            scheduler,
            devices: DashMap::new(),
            stored: DashMap::new(),
        }
    }

    /// Built-in handlers and device types, configuration from the environment.
    pub fn with_defaults(link: Arc<dyn Link>) -> Self {
        Self::new(
            EngineConfig::from_env(),
            HandlerRegistry::with_builtins(),
            TemplateCatalog::builtin(),
            link,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Builder for a device of `product_key`, with its features filled in.
    pub fn device_builder(&self, address: AddressId, product_key: &str) -> Result<DeviceBuilder> {
        let definition = self
            .catalog
            .device_type(product_key)
            .ok_or_else(|| Error::UnknownProductKey(product_key.to_string()))?;
        Ok(DeviceEntity::builder(address, product_key).definition(
            definition,
            &self.catalog,
            &self.registry,
            &self.config,
        ))
    }

    /// Create and register a device. An existing device at the same address
    /// is replaced.
    pub fn add_device(&self, address: AddressId, product_key: &str) -> Result<Arc<DeviceEntity>> {
        let device = self.device_builder(address, product_key)?.build(
            self.link.clone(),
            self.scheduler.handle(),
            self.config.clone(),
        );
        self.insert_device(device.clone());
        Ok(device)
    }

    /// Register a device built elsewhere and replay frames that arrived for
    /// it before it existed.
    pub fn insert_device(&self, device: Arc<DeviceEntity>) {
        let address = device.address();
        if let Some(old) = self.devices.insert(address, device.clone()) {
            debug!("{}: replacing existing device", address);
            old.dispose();
        }
        info!(
            "{}: added {} with {} features",
            address,
            device.product_key(),
            device.features().len()
        );

        if let Some(insteon) = address.as_insteon() {
            if let Some((_, stored)) = self.stored.remove(&insteon) {
                debug!("{}: replaying {} stored messages", address, stored.frames.len());
                for msg in stored.frames {
                    device.handle_message(&msg);
                }
            }
        }
    }

    pub fn remove_device(&self, address: &AddressId) -> Option<Arc<DeviceEntity>> {
        let (_, device) = self.devices.remove(address)?;
        device.dispose();
        info!("{}: removed", address);
        Some(device)
    }

    pub fn device(&self, address: &AddressId) -> Option<Arc<DeviceEntity>> {
        self.devices.get(address).map(|d| d.value().clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn addresses(&self) -> Vec<AddressId> {
        self.devices.iter().map(|d| *d.key()).collect()
    }

    pub fn stored_message_count(&self, address: &InsteonAddress) -> usize {
        self.stored.get(address).map_or(0, |s| s.frames.len())
    }

    /// Number of unknown addresses with stored frames.
    pub fn stored_sender_count(&self) -> usize {
        self.stored.len()
    }

    fn evict_quietest_sender(&self) {
        let quietest = self
            .stored
            .iter()
            .min_by_key(|entry| entry.last_seen)
            .map(|entry| *entry.key());
        if let Some(address) = quietest {
            self.stored.remove(&address);
            debug!("{}: dropped stored messages", address);
        }
    }

    /// Route a decoded inbound frame. Returns `false` when no device owns the
    /// source address; the frame is then kept for replay.
    pub fn on_frame_received(&self, msg: &WireMessage) -> bool {
        let from = msg.from_address();
        let device = self.device(&AddressId::Insteon(from));
        match device {
            Some(device) => {
                device.handle_message(msg);
                true
            }
            None => {
                debug!("{}: no device, storing {}", from, msg);
                let now = Instant::now();
                if !self.stored.contains_key(&from) && self.stored.len() >= MAX_STORED_SENDERS {
                    self.evict_quietest_sender();
                }
                let mut stored = self.stored.entry(from).or_insert_with(|| StoredFrames {
                    frames: VecDeque::new(),
                    last_seen: now,
                });
                if stored.frames.len() == MAX_STORED_MESSAGES {
                    stored.frames.pop_front();
                }
                stored.frames.push_back(msg.clone());
                stored.last_seen = now;
                false
            }
        }
    }

    /// Decode and route a raw modem frame.
    pub fn on_bytes_received(&self, bytes: &[u8]) -> Result<bool> {
        let msg = WireMessage::decode(bytes).inspect_err(|e| {
            warn!("Dropping undecodable frame {}: {}", hex::encode_upper(bytes), e);
        })?;
        Ok(self.on_frame_received(&msg))
    }

    pub fn send_command(
        &self,
        address: &AddressId,
        feature: &str,
        command: &DeviceCommand,
    ) -> Result<()> {
        let device = self
            .device(address)
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;
        device.handle_command(feature, command)
    }

    pub fn poll(&self, address: &AddressId, delay: Duration) -> Result<()> {
        let device = self
            .device(address)
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;
        device.do_poll(delay);
        Ok(())
    }

    /// Poll every device someone is listening to. Returns how many were polled.
    pub fn poll_listened(&self, delay: Duration) -> usize {
        let devices: Vec<Arc<DeviceEntity>> = self
            .devices
            .iter()
            .filter(|d| d.has_any_listeners())
            .map(|d| d.value().clone())
            .collect();
        for device in &devices {
            device.do_poll(delay);
        }
        devices.len()
    }
}
