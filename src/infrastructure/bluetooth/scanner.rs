//! Scan Controller
//!
//! Owns the single scan session, feeds discovery reports into the registry
//! and publishes them.

use crate::domain::models::{DeviceId, DiscoveryReport, ManagerEvent, ScanFilter};
use crate::error::{ManagerError, Result};
use crate::infrastructure::bluetooth::bridge::EventBridge;
use crate::infrastructure::bluetooth::radio::Radio;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Identifies one scan session, so a caller can end only the scan it began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSessionId(u64);

/// An active scan
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub id: ScanSessionId,
    pub filter: ScanFilter,
    last_prune: Instant,
}

#[derive(Debug, Default)]
pub struct ScanController {
    session: Option<ScanSession>,
    next_session: u64,
}

impl ScanController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin discovery with the given filter
    pub fn start(
        &mut self,
        filter: ScanFilter,
        radio: &dyn Radio,
        bridge: &EventBridge,
        now: Instant,
    ) -> Result<ScanSessionId> {
        if self.session.is_some() {
            return Err(ManagerError::AlreadyScanning);
        }

        info!("Starting BLE scan with filter {:?}", filter);
        radio
            .start_scan(&filter)
            .map_err(|e| ManagerError::HardwareFailure(e.to_string()))?;

        self.next_session += 1;
        let id = ScanSessionId(self.next_session);
        self.session = Some(ScanSession {
            id,
            filter,
            last_prune: now,
        });
        bridge.emit(ManagerEvent::ScanStarted);
        Ok(id)
    }

    /// End discovery. Returns `false` when no scan was running.
    pub fn stop(&mut self, radio: &dyn Radio, bridge: &EventBridge) -> bool {
        if self.session.is_none() {
            return false;
        }

        info!("Stopping BLE scan...");
        if let Err(e) = radio.stop_scan() {
            warn!("Radio failed to stop scanning: {}", e);
        }
        self.end_session(bridge)
    }

    /// End discovery only if `id` is still the running session
    pub fn stop_session(
        &mut self,
        id: ScanSessionId,
        radio: &dyn Radio,
        bridge: &EventBridge,
    ) -> bool {
        if self.session.as_ref().map(|s| s.id) != Some(id) {
            debug!("Scan session already ended, leaving the current scan running");
            return false;
        }
        self.stop(radio, bridge)
    }

    /// Drop the session without talking to the radio (adapter went away)
    pub fn end_session(&mut self, bridge: &EventBridge) -> bool {
        match self.session.take() {
            Some(_) => {
                bridge.emit(ManagerEvent::ScanStopped);
                true
            }
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    /// Record a discovery report.
    ///
    /// Returns `true` if the report was accepted into the registry.
    pub fn handle_discovery(
        &self,
        registry: &mut DeviceRegistry,
        report: &DiscoveryReport,
        bridge: &EventBridge,
        now: Instant,
    ) -> bool {
        let Some(session) = self.session.as_ref() else {
            trace!("Discovery of {} outside a scan session, ignoring", report.id);
            return false;
        };

        if !session.filter.matches(report) {
            trace!("Discovery of {} filtered out", report.id);
            return false;
        }

        registry.upsert_discovered(report, now);
        if let Ok(device) = registry.get(&report.id) {
            debug!(
                "Discovered {} ({}) rssi={} state={}",
                device.id,
                device.metadata.display_name(),
                device.metadata.rssi,
                device.state()
            );
            bridge.emit(ManagerEvent::DeviceDiscovered {
                id: device.id.clone(),
                metadata: device.metadata.clone(),
            });
        }
        true
    }

    /// Forget devices that stopped advertising since the previous prune.
    ///
    /// Devices with a link (connecting, connected, disconnecting) are kept.
    pub fn prune_stale(
        &mut self,
        registry: &mut DeviceRegistry,
        bridge: &EventBridge,
        now: Instant,
    ) -> Vec<DeviceId> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let cutoff = session.last_prune;
        session.last_prune = now;

        let stale: Vec<DeviceId> = registry
            .iter()
            .filter(|d| !d.state().is_linked() && d.metadata.last_seen < cutoff)
            .map(|d| d.id.clone())
            .collect();

        for id in &stale {
            registry.remove(id);
            debug!("Device {} stopped advertising, removed", id);
            bridge.emit(ManagerEvent::DeviceRemoved { id: id.clone() });
        }
        stale
    }
}
