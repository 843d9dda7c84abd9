//! Connection Orchestrator
//!
//! Drives the per-device state machine: issues connect, disconnect and
//! write requests, applies radio completions and unsolicited drops, and
//! turns heartbeat verdicts into consistent `Connected → Discovered`
//! transitions.
//!
//! The orchestrator is a short-lived view over the manager state, built
//! while the state lock is held, so every method runs serialized with all
//! other mutations.

use crate::domain::models::{
    ConnectionHandle, DeviceId, DeviceState, DisconnectReason, ManagerEvent, OperationKind,
    PingOutcome,
};
use crate::error::{ManagerError, Result};
use crate::infrastructure::bluetooth::bridge::EventBridge;
use crate::infrastructure::bluetooth::correlator::{
    CallbackCorrelator, OperationResult, OperationToken, Responder,
};
use crate::infrastructure::bluetooth::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::Radio;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Devices to connect to as soon as they are discovered
#[derive(Debug, Default)]
pub struct AutoConnect {
    remember_on_connect: bool,
    ids: HashSet<DeviceId>,
}

impl AutoConnect {
    pub fn new(remember_on_connect: bool, ids: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            remember_on_connect,
            ids: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.ids.contains(id)
    }

    pub fn set(&mut self, id: &DeviceId, enabled: bool) {
        if enabled {
            self.ids.insert(id.clone());
        } else {
            self.ids.remove(id);
        }
    }

    fn remember(&mut self, id: &DeviceId) {
        if self.remember_on_connect {
            self.ids.insert(id.clone());
        }
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct ConnectionOrchestrator<'a> {
    pub registry: &'a mut DeviceRegistry,
    pub correlator: &'a mut CallbackCorrelator,
    pub heartbeat: &'a mut HeartbeatMonitor,
    pub auto_connect: &'a mut AutoConnect,
    pub radio: &'a dyn Radio,
    pub bridge: &'a EventBridge,
}

impl ConnectionOrchestrator<'_> {
    // === Commands ===

    /// Start connecting to a `Discovered` device
    pub fn connect(
        &mut self,
        id: &DeviceId,
        responder: Responder,
        now: Instant,
    ) -> Result<OperationToken> {
        self.require_not_pending(id, OperationKind::Connect)?;
        self.require_state(id, DeviceState::Discovered, "connect")?;
        let token = self
            .correlator
            .register(id, OperationKind::Connect, responder, now)?;
        self.registry.set_state(id, DeviceState::Connecting, None)?;

        info!("Connecting to device {}", id);
        if let Err(e) = self.radio.connect(id) {
            let error = ManagerError::HardwareFailure(e.to_string());
            self.fail_connect(id, error.clone());
            return Err(error);
        }
        Ok(token)
    }

    /// Start disconnecting a `Connected` device
    pub fn disconnect(
        &mut self,
        id: &DeviceId,
        responder: Responder,
        now: Instant,
    ) -> Result<OperationToken> {
        self.require_not_pending(id, OperationKind::Disconnect)?;
        let handle = self.require_connected(id, "disconnect")?;
        let token = self
            .correlator
            .register(id, OperationKind::Disconnect, responder, now)?;

        info!("Disconnecting device {}", id);
        // a refused request leaves the link up, so the device stays connected
        if let Err(e) = self.radio.disconnect(id, handle) {
            let error = ManagerError::HardwareFailure(e.to_string());
            self.correlator
                .resolve(id, OperationKind::Disconnect, Err(error.clone()));
            return Err(error);
        }

        self.registry.set_state(id, DeviceState::Disconnecting, None)?;
        self.heartbeat.clear(id);
        self.auto_connect.set(id, false);
        Ok(token)
    }

    /// Write a framed payload to a `Connected` device
    pub fn write(
        &mut self,
        id: &DeviceId,
        payload: &[u8],
        responder: Responder,
        now: Instant,
    ) -> Result<OperationToken> {
        self.require_not_pending(id, OperationKind::Write)?;
        let handle = self.require_connected(id, "write to")?;
        let token = self
            .correlator
            .register(id, OperationKind::Write, responder, now)?;

        debug!("Writing {} bytes to {}", payload.len(), id);
        if let Err(e) = self.radio.write(id, handle, payload) {
            let error = ManagerError::HardwareFailure(e.to_string());
            self.correlator
                .resolve(id, OperationKind::Write, Err(error.clone()));
            return Err(error);
        }
        Ok(token)
    }

    /// Remove a device from tracking, whatever its state
    pub fn forget(&mut self, id: &DeviceId) -> Result<()> {
        let device = self
            .registry
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;

        self.correlator
            .resolve_all(id, ManagerError::NotFound(id.clone()));
        self.heartbeat.clear(id);
        self.auto_connect.set(id, false);

        if device.state() == DeviceState::Connecting {
            if let Err(e) = self.radio.cancel_connect(id) {
                warn!("Failed to cancel connect to forgotten device {}: {}", id, e);
            }
        }
        if let Some(handle) = device.connection() {
            self.close_link(id, handle);
        }

        info!("Forgot device {}", id);
        self.bridge
            .emit(ManagerEvent::DeviceRemoved { id: id.clone() });
        Ok(())
    }

    // === Radio completions ===

    pub fn on_connect_result(
        &mut self,
        id: &DeviceId,
        result: std::result::Result<ConnectionHandle, String>,
        now: Instant,
    ) {
        let state = match self.registry.state(id) {
            Ok(state) => state,
            Err(_) => {
                warn!("Connect result for untracked device {}, ignoring", id);
                if let Ok(handle) = result {
                    self.close_link(id, handle);
                }
                return;
            }
        };

        if state != DeviceState::Connecting {
            warn!("Late connect result for {} while {}, ignoring", id, state);
            if let Ok(handle) = result {
                self.close_link(id, handle);
            }
            return;
        }

        match result {
            Ok(handle) => {
                if let Err(e) = self
                    .registry
                    .set_state(id, DeviceState::Connected, Some(handle))
                {
                    warn!("Could not complete connection to {}: {}", id, e);
                    return;
                }
                self.heartbeat.reset(id, now);
                self.auto_connect.remember(id);
                self.correlator.resolve(id, OperationKind::Connect, Ok(()));
                info!("Device {} connected ({})", id, handle);
                self.bridge
                    .emit(ManagerEvent::DeviceConnected { id: id.clone() });
            }
            Err(reason) => {
                warn!("Connection to {} failed: {}", id, reason);
                self.fail_connect(id, ManagerError::HardwareFailure(reason));
            }
        }
    }

    pub fn on_disconnect_result(&mut self, id: &DeviceId, result: std::result::Result<(), String>) {
        match self.registry.state(id) {
            Ok(DeviceState::Disconnecting) => {
                let outcome = result.map_err(|reason| {
                    warn!("Radio reported failed disconnect of {}: {}", id, reason);
                    ManagerError::HardwareFailure(reason)
                });
                self.release(
                    id,
                    outcome,
                    ManagerEvent::DeviceDisconnected {
                        id: id.clone(),
                        reason: DisconnectReason::Requested,
                    },
                );
            }
            Ok(state) => debug!("Disconnect result for {} while {}, ignoring", id, state),
            Err(_) => debug!("Disconnect result for untracked device {}, ignoring", id),
        }
    }

    /// The radio dropped a link on its own
    pub fn on_disconnected(&mut self, id: &DeviceId, reason: String) {
        match self.registry.state(id) {
            Ok(DeviceState::Connected) | Ok(DeviceState::Disconnecting) => {
                info!("Device {} disconnected: {}", id, reason);
                self.release(
                    id,
                    Ok(()),
                    ManagerEvent::DeviceDisconnected {
                        id: id.clone(),
                        reason: DisconnectReason::Remote(reason),
                    },
                );
            }
            Ok(DeviceState::Connecting) => {
                warn!("Device {} dropped while connecting: {}", id, reason);
                self.fail_connect(id, ManagerError::HardwareFailure(reason));
            }
            Ok(DeviceState::Discovered) => {
                debug!("Disconnect of idle device {} ignored", id)
            }
            Err(_) => warn!("Disconnect of untracked device {} ignored", id),
        }
    }

    pub fn on_write_result(&mut self, id: &DeviceId, result: std::result::Result<(), String>) {
        self.correlator.resolve(
            id,
            OperationKind::Write,
            result.map_err(ManagerError::HardwareFailure),
        );
    }

    pub fn on_ping_result(&mut self, id: &DeviceId, outcome: PingOutcome, now: Instant) {
        if !matches!(self.registry.state(id), Ok(DeviceState::Connected)) {
            debug!("Ping result for {} which is no longer connected", id);
            return;
        }

        match outcome {
            PingOutcome::Alive(reply) => {
                self.heartbeat.record_alive(id, now);
                match protocol::parse_battery(&reply) {
                    Ok(level) => {
                        debug!("Device {} battery at {}%", id, level);
                        self.heartbeat.record_battery(id, level);
                    }
                    Err(e) => debug!("Unreadable ping reply from {}: {}", id, e),
                }
            }
            PingOutcome::Failed(reason) => {
                warn!("Ping to {} failed: {}", id, reason);
                self.lose(id);
            }
            PingOutcome::TimedOut => {
                warn!("Ping to {} timed out", id);
                self.lose(id);
            }
        }
    }

    // === Periodic work ===

    pub fn heartbeat_tick(&mut self, now: Instant) {
        let frame = protocol::ping_frame();
        for action in self.heartbeat.tick(self.registry, now) {
            match action {
                HeartbeatAction::Ping { id, handle } => {
                    debug!("Pinging {}", id);
                    if let Err(e) = self.radio.ping(&id, handle, &frame) {
                        warn!("Could not ping {}: {}", id, e);
                        self.lose(&id);
                    }
                }
                HeartbeatAction::Lost { id } => self.lose(&id),
            }
        }
    }

    /// Time out stale pending operations and roll back what they left behind
    pub fn sweep(&mut self, now: Instant, timeout: Duration) {
        for (id, kind) in self.correlator.sweep_timed_out(now, timeout) {
            match (kind, self.registry.state(&id)) {
                (OperationKind::Connect, Ok(DeviceState::Connecting)) => {
                    if let Err(e) = self.radio.cancel_connect(&id) {
                        warn!("Failed to cancel connect to {}: {}", id, e);
                    }
                    self.fail_connect(
                        &id,
                        ManagerError::Timeout {
                            id: id.clone(),
                            kind,
                        },
                    );
                }
                (OperationKind::Disconnect, Ok(DeviceState::Disconnecting)) => {
                    self.release(
                        &id,
                        Ok(()),
                        ManagerEvent::DeviceDisconnected {
                            id: id.clone(),
                            reason: DisconnectReason::Timeout,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    /// Adapter powered off: every link and pending operation is gone
    pub fn adapter_powered_off(&mut self) {
        let failed = self.correlator.drain(ManagerError::HardwareFailure(
            "bluetooth adapter powered off".to_string(),
        ));
        if failed > 0 {
            info!("Failed {} pending operations after adapter power off", failed);
        }
        self.heartbeat.clear_all();

        for device in self.registry.clear() {
            if device.state().is_linked() {
                self.bridge.emit(ManagerEvent::DeviceDisconnected {
                    id: device.id.clone(),
                    reason: DisconnectReason::AdapterPoweredOff,
                });
            }
            self.bridge
                .emit(ManagerEvent::DeviceRemoved { id: device.id });
        }
    }

    // === Helpers ===

    /// A second request of the same kind is rejected, not queued
    fn require_not_pending(&self, id: &DeviceId, kind: OperationKind) -> Result<()> {
        if self.correlator.is_pending(id, kind) {
            return Err(ManagerError::DuplicateOperation {
                id: id.clone(),
                kind,
            });
        }
        Ok(())
    }

    fn require_state(&self, id: &DeviceId, expected: DeviceState, action: &'static str) -> Result<()> {
        let state = self.registry.state(id)?;
        if state != expected {
            return Err(ManagerError::InvalidState {
                id: id.clone(),
                state,
                action,
            });
        }
        Ok(())
    }

    fn require_connected(&self, id: &DeviceId, action: &'static str) -> Result<ConnectionHandle> {
        let device = self.registry.get(id)?;
        match (device.state(), device.connection()) {
            (DeviceState::Connected, Some(handle)) => Ok(handle),
            (state, _) => Err(ManagerError::InvalidState {
                id: id.clone(),
                state,
                action,
            }),
        }
    }

    /// `Connecting → Discovered`, failing the pending connect
    fn fail_connect(&mut self, id: &DeviceId, error: ManagerError) {
        if let Err(e) = self.registry.set_state(id, DeviceState::Discovered, None) {
            warn!("Could not roll back connect of {}: {}", id, e);
        }
        let reason = error.to_string();
        if self.correlator.is_pending(id, OperationKind::Connect) {
            self.correlator
                .resolve(id, OperationKind::Connect, Err(error));
        }
        self.bridge.emit(ManagerEvent::ConnectionFailed {
            id: id.clone(),
            reason,
        });
    }

    /// `Connected`/`Disconnecting → Discovered`: clear the link and liveness,
    /// settle any pending disconnect and fail in-flight writes
    fn release(&mut self, id: &DeviceId, outcome: OperationResult, event: ManagerEvent) {
        if let Err(e) = self.registry.set_state(id, DeviceState::Discovered, None) {
            warn!("Could not release {}: {}", id, e);
            return;
        }
        self.heartbeat.clear(id);

        if self.correlator.is_pending(id, OperationKind::Disconnect) {
            self.correlator
                .resolve(id, OperationKind::Disconnect, outcome);
        }
        if self.correlator.is_pending(id, OperationKind::Write) {
            self.correlator.resolve(
                id,
                OperationKind::Write,
                Err(ManagerError::HardwareFailure("connection closed".to_string())),
            );
        }
        self.bridge.emit(event);
    }

    /// Heartbeat verdict: the link is dead even though the radio never said so
    fn lose(&mut self, id: &DeviceId) {
        let handle = self.registry.get(id).ok().and_then(|d| d.connection());
        self.release(id, Ok(()), ManagerEvent::ConnectionLost { id: id.clone() });
        if let Some(handle) = handle {
            self.close_link(id, handle);
        }
    }

    /// Best-effort teardown of a link nobody is tracking anymore
    fn close_link(&self, id: &DeviceId, handle: ConnectionHandle) {
        debug!("Releasing stray link {} of {}", handle, id);
        if let Err(e) = self.radio.disconnect(id, handle) {
            warn!("Failed to release {} of {}: {}", handle, id, e);
        }
    }
}
