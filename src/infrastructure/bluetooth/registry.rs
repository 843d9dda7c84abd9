//! Device Registry
//!
//! Authoritative record per discovered or connected device, keyed by id.
//! The registry is owned by the manager state and only mutated under its
//! lock, so each mutation is applied whole.

use crate::domain::models::{
    ConnectionHandle, Device, DeviceId, DeviceMetadata, DeviceState, DiscoveryReport,
};
use crate::error::{ManagerError, Result};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a device from a discovery report.
    ///
    /// Returns `true` when the device was not tracked before. The connection
    /// state of an existing record is never touched.
    pub fn upsert_discovered(&mut self, report: &DiscoveryReport, now: Instant) -> bool {
        let metadata = DeviceMetadata {
            name: report.name.clone(),
            rssi: report.rssi,
            advertisement: report.advertisement.clone(),
            last_seen: now,
        };

        match self.devices.get_mut(&report.id) {
            Some(device) => {
                // keep a previously advertised name if this report has none
                let name = metadata.name.or_else(|| device.metadata.name.take());
                device.metadata = DeviceMetadata { name, ..metadata };
                false
            }
            None => {
                debug!(
                    "Tracking new device {} ({})",
                    report.id,
                    metadata.display_name()
                );
                self.devices.insert(
                    report.id.clone(),
                    Device {
                        id: report.id.clone(),
                        metadata,
                        state: DeviceState::Discovered,
                        connection: None,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, id: &DeviceId) -> Result<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))
    }

    pub fn state(&self, id: &DeviceId) -> Result<DeviceState> {
        self.get(id).map(Device::state)
    }

    /// Apply a state transition.
    ///
    /// `connection` must be present when moving to `Connected` and absent
    /// otherwise. Returns the previous state.
    pub fn set_state(
        &mut self,
        id: &DeviceId,
        next: DeviceState,
        connection: Option<ConnectionHandle>,
    ) -> Result<DeviceState> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;
        let previous = device.state;

        let handle_ok = (next == DeviceState::Connected) == connection.is_some();
        if !previous.can_transition_to(next) || !handle_ok {
            return Err(ManagerError::InvalidState {
                id: id.clone(),
                state: previous,
                action: transition_action(next),
            });
        }

        device.state = next;
        device.connection = connection;
        info!("Device {}: {} -> {}", id, previous, next);
        Ok(previous)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Ids and handles of every `Connected` device
    pub fn connected(&self) -> Vec<(DeviceId, ConnectionHandle)> {
        self.devices
            .values()
            .filter_map(|d| d.connection.map(|handle| (d.id.clone(), handle)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) -> Vec<Device> {
        self.devices.drain().map(|(_, device)| device).collect()
    }
}

fn transition_action(next: DeviceState) -> &'static str {
    match next {
        DeviceState::Discovered => "release",
        DeviceState::Connecting => "connect",
        DeviceState::Connected => "complete connection of",
        DeviceState::Disconnecting => "disconnect",
    }
}
