//! Bluetooth Service Module
//!
//! [`BleManager`] is the public face of the connection manager. It owns
//! the shared state behind one lock, so radio events, heartbeat ticks and
//! caller commands are applied one at a time and never race.

use crate::domain::models::{
    Device, DeviceId, DeviceState, DiscoveryReport, ManagerEvent, OperationKind, RadioEvent,
    ScanFilter,
};
use crate::domain::settings::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::infrastructure::bluetooth::{
    bridge::EventBridge,
    connection::{AutoConnect, ConnectionOrchestrator},
    correlator::{CallbackCorrelator, OperationResult, OperationToken},
    heartbeat::HeartbeatMonitor,
    protocol::PeripheralCommand,
    radio::Radio,
    registry::DeviceRegistry,
    scanner::{ScanController, ScanSessionId},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct ManagerState {
    registry: DeviceRegistry,
    correlator: CallbackCorrelator,
    scanner: ScanController,
    heartbeat: HeartbeatMonitor,
    auto_connect: AutoConnect,
    adapter_powered: bool,
}

/// Caller's handle on an in-flight command
#[derive(Debug)]
pub struct Completion {
    token: OperationToken,
    rx: oneshot::Receiver<OperationResult>,
}

impl Completion {
    pub fn token(&self) -> OperationToken {
        self.token
    }

    /// Wait for the operation to resolve
    pub async fn wait(self) -> OperationResult {
        self.rx.await.unwrap_or(Err(ManagerError::Shutdown))
    }

    /// Non-blocking check; `None` while still pending
    pub fn try_result(&mut self) -> Option<OperationResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ManagerError::Shutdown)),
        }
    }
}

/// Central-role BLE connection manager
#[derive(Clone)]
pub struct BleManager {
    state: Arc<Mutex<ManagerState>>,
    radio: Arc<dyn Radio>,
    bridge: EventBridge,
    config: Arc<ManagerConfig>,
}

impl BleManager {
    pub fn new(radio: Arc<dyn Radio>, config: ManagerConfig) -> Self {
        let state = ManagerState {
            registry: DeviceRegistry::new(),
            correlator: CallbackCorrelator::new(),
            scanner: ScanController::new(),
            heartbeat: HeartbeatMonitor::new(config.staleness_threshold, config.ping_timeout),
            auto_connect: AutoConnect::new(
                config.auto_reconnect,
                config.known_device_ids.iter().cloned(),
            ),
            adapter_powered: true,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            radio,
            bridge: EventBridge::new(),
            config: Arc::new(config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orchestrator<'a>(&'a self, state: &'a mut ManagerState) -> ConnectionOrchestrator<'a> {
        ConnectionOrchestrator {
            registry: &mut state.registry,
            correlator: &mut state.correlator,
            heartbeat: &mut state.heartbeat,
            auto_connect: &mut state.auto_connect,
            radio: self.radio.as_ref(),
            bridge: &self.bridge,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // === Event bridge ===

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        self.bridge.subscribe()
    }

    pub fn unsubscribe(&self) {
        self.bridge.unsubscribe();
    }

    pub fn is_observing(&self) -> bool {
        self.bridge.is_observing()
    }

    // === Commands ===

    pub fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        self.begin_scan(filter).map(|_| ())
    }

    fn begin_scan(&self, filter: ScanFilter) -> Result<ScanSessionId> {
        let mut state = self.lock();
        if !state.adapter_powered {
            return Err(ManagerError::AdapterUnavailable);
        }
        state
            .scanner
            .start(filter, self.radio.as_ref(), &self.bridge, Instant::now())
    }

    /// Stopping when not scanning is a no-op
    pub fn stop_scan(&self) {
        self.lock().scanner.stop(self.radio.as_ref(), &self.bridge);
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanner.is_scanning()
    }

    pub fn connect(&self, id: &DeviceId) -> Result<Completion> {
        self.issue(|orchestrator, tx, now| orchestrator.connect(id, tx, now))
    }

    pub fn disconnect(&self, id: &DeviceId) -> Result<Completion> {
        self.issue(|orchestrator, tx, now| orchestrator.disconnect(id, tx, now))
    }

    pub fn write(&self, id: &DeviceId, payload: &[u8]) -> Result<Completion> {
        self.issue(|orchestrator, tx, now| orchestrator.write(id, payload, tx, now))
    }

    pub fn send_command(&self, id: &DeviceId, command: PeripheralCommand) -> Result<Completion> {
        self.write(id, &command.encode())
    }

    fn issue<F>(&self, command: F) -> Result<Completion>
    where
        F: FnOnce(
            &mut ConnectionOrchestrator<'_>,
            oneshot::Sender<OperationResult>,
            Instant,
        ) -> Result<OperationToken>,
    {
        let mut state = self.lock();
        if !state.adapter_powered {
            return Err(ManagerError::AdapterUnavailable);
        }
        let (tx, rx) = oneshot::channel();
        let token = command(&mut self.orchestrator(&mut state), tx, Instant::now())?;
        Ok(Completion { token, rx })
    }

    /// Drop a device from the registry whatever its state
    pub fn forget(&self, id: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        self.orchestrator(&mut state).forget(id)
    }

    pub fn device(&self, id: &DeviceId) -> Result<Device> {
        self.lock().registry.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.lock().registry.snapshot()
    }

    pub fn is_pending(&self, id: &DeviceId, kind: OperationKind) -> bool {
        self.lock().correlator.is_pending(id, kind)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().correlator.len()
    }

    pub fn set_auto_connect(&self, id: &DeviceId, enabled: bool) {
        self.lock().auto_connect.set(id, enabled);
    }

    pub fn auto_connect_ids(&self) -> Vec<DeviceId> {
        self.lock().auto_connect.ids()
    }

    pub fn is_adapter_powered(&self) -> bool {
        self.lock().adapter_powered
    }

    /// Battery level from the last answered heartbeat ping
    pub fn battery_level(&self, id: &DeviceId) -> Option<u8> {
        self.lock().heartbeat.record(id).and_then(|record| record.battery)
    }

    // === Radio events ===

    pub fn handle_event(&self, event: RadioEvent) {
        self.handle_event_at(event, Instant::now());
    }

    pub fn handle_event_at(&self, event: RadioEvent, now: Instant) {
        self.dispatch(event, now);
    }

    /// Apply one radio event. Returns `true` when the adapter came back on.
    fn dispatch(&self, event: RadioEvent, now: Instant) -> bool {
        let mut state = self.lock();
        match event {
            RadioEvent::Discovered(report) => self.on_discovered(&mut state, &report, now),
            RadioEvent::ConnectResult { id, result } => {
                self.orchestrator(&mut state)
                    .on_connect_result(&id, result, now)
            }
            RadioEvent::DisconnectResult { id, result } => {
                self.orchestrator(&mut state).on_disconnect_result(&id, result)
            }
            RadioEvent::Disconnected { id, reason } => {
                self.orchestrator(&mut state).on_disconnected(&id, reason)
            }
            RadioEvent::PingResult { id, outcome } => {
                self.orchestrator(&mut state)
                    .on_ping_result(&id, outcome, now)
            }
            RadioEvent::WriteResult { id, result } => {
                self.orchestrator(&mut state).on_write_result(&id, result)
            }
            RadioEvent::AdapterStateChanged { powered } => {
                return self.on_adapter_state(&mut state, powered) && powered;
            }
        }
        false
    }

    fn on_discovered(&self, state: &mut ManagerState, report: &DiscoveryReport, now: Instant) {
        let accepted =
            state
                .scanner
                .handle_discovery(&mut state.registry, report, &self.bridge, now);
        if !accepted || !state.auto_connect.contains(&report.id) {
            return;
        }

        let idle = matches!(
            state.registry.state(&report.id),
            Ok(DeviceState::Discovered)
        );
        if !idle || state.correlator.is_pending(&report.id, OperationKind::Connect) {
            return;
        }

        info!("Auto-connecting to known device {}", report.id);
        // nobody waits on this completion
        let (tx, _rx) = oneshot::channel();
        if let Err(e) = self.orchestrator(state).connect(&report.id, tx, now) {
            warn!("Auto-connect to {} failed: {}", report.id, e);
        }
    }

    /// Returns `false` when the adapter was already in that state
    fn on_adapter_state(&self, state: &mut ManagerState, powered: bool) -> bool {
        if state.adapter_powered == powered {
            debug!("Adapter already powered {}, ignoring", if powered { "on" } else { "off" });
            return false;
        }
        state.adapter_powered = powered;
        info!(
            "Bluetooth adapter powered {}",
            if powered { "on" } else { "off" }
        );

        if !powered {
            state.scanner.end_session(&self.bridge);
            self.orchestrator(state).adapter_powered_off();
        }
        self.bridge
            .emit(ManagerEvent::AdapterStateChanged { powered });
        true
    }

    // === Periodic work ===

    pub fn heartbeat_tick(&self) {
        self.heartbeat_tick_at(Instant::now());
    }

    pub fn heartbeat_tick_at(&self, now: Instant) {
        let mut state = self.lock();
        self.orchestrator(&mut state).heartbeat_tick(now);
    }

    pub fn sweep_timed_out(&self) {
        self.sweep_timed_out_at(Instant::now());
    }

    pub fn sweep_timed_out_at(&self, now: Instant) {
        let mut state = self.lock();
        self.orchestrator(&mut state)
            .sweep(now, self.config.operation_timeout);
    }

    pub fn prune_stale_discoveries(&self) -> Vec<DeviceId> {
        self.prune_stale_discoveries_at(Instant::now())
    }

    pub fn prune_stale_discoveries_at(&self, now: Instant) -> Vec<DeviceId> {
        let mut state = self.lock();
        let state = &mut *state;
        state
            .scanner
            .prune_stale(&mut state.registry, &self.bridge, now)
    }

    /// Scan briefly so known devices get discovered and auto-connected
    pub async fn try_reconnect(&self) -> Result<()> {
        if self.lock().auto_connect.is_empty() {
            return Ok(());
        }

        let session = match self.begin_scan(ScanFilter::default()) {
            Ok(session) => session,
            Err(ManagerError::AlreadyScanning) => {
                debug!("Scan already running, known devices will be picked up by it");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        time::sleep(self.config.reconnect_scan_window).await;
        // a scan started by someone else in the meantime keeps running
        self.lock()
            .scanner
            .stop_session(session, self.radio.as_ref(), &self.bridge);
        Ok(())
    }

    /// Drive the manager from the radio event stream until it closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        let mut sweep = time::interval(self.config.sweep_interval);
        let mut prune = time::interval(self.config.discovery_prune_interval);
        for interval in [&mut heartbeat, &mut sweep, &mut prune] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!("Connection manager running");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Radio event stream closed, stopping connection manager");
                        break;
                    };
                    if self.dispatch(event, Instant::now()) {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.try_reconnect().await {
                                warn!("Reconnect scan failed: {}", e);
                            }
                        });
                    }
                }
                _ = heartbeat.tick() => self.heartbeat_tick(),
                _ = sweep.tick() => self.sweep_timed_out(),
                _ = prune.tick() => {
                    self.prune_stale_discoveries();
                }
            }
        }
    }
}
