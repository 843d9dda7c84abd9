//! Simulated Radio
//!
//! In-memory stand-in for a platform BLE stack. It records every request
//! and, when auto-respond is on, answers them through the event stream the
//! way a well-behaved stack would. Peripherals can be made unreachable or
//! silent to exercise failure paths.

use crate::domain::models::{
    AdvertisementData, ConnectionHandle, DeviceId, DiscoveryReport, PingOutcome, RadioEvent,
    ScanFilter,
};
use crate::infrastructure::bluetooth::radio::Radio;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// A request the manager made to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan(ScanFilter),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId, ConnectionHandle),
    CancelConnect(DeviceId),
    Ping(DeviceId, ConnectionHandle, Vec<u8>),
    Write(DeviceId, ConnectionHandle, Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub report: DiscoveryReport,
    /// Accepts connections
    pub reachable: bool,
    /// Answers pings and writes
    pub responsive: bool,
    /// Reported in ping replies
    pub battery: u8,
}

impl SimulatedPeripheral {
    pub fn new(id: &str, name: &str, rssi: i16) -> Self {
        Self {
            report: DiscoveryReport {
                id: DeviceId::from(id),
                name: Some(name.to_string()),
                rssi,
                advertisement: AdvertisementData::default(),
            },
            reachable: true,
            responsive: true,
            battery: 85,
        }
    }
}

#[derive(Default)]
struct SimState {
    auto_respond: bool,
    scanning: bool,
    powered: bool,
    peripherals: HashMap<DeviceId, SimulatedPeripheral>,
    links: HashMap<DeviceId, ConnectionHandle>,
    next_handle: u64,
    calls: Vec<RadioCall>,
    fail_next: Option<String>,
}

pub struct SimulatedRadio {
    events: mpsc::UnboundedSender<RadioEvent>,
    state: Mutex<SimState>,
}

impl SimulatedRadio {
    /// Radio in manual mode: requests are recorded, nothing is answered
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let radio = Self {
            events: tx,
            state: Mutex::new(SimState {
                powered: true,
                ..Default::default()
            }),
        };
        (Arc::new(radio), rx)
    }

    /// Radio that answers every request on its own
    pub fn responsive() -> (Arc<Self>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (radio, rx) = Self::new();
        radio.lock().auto_respond = true;
        (radio, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: RadioEvent) {
        trace!("Simulated radio event: {:?}", event);
        let _ = self.events.send(event);
    }

    /// Push an arbitrary event, as if the stack produced it
    pub fn inject(&self, event: RadioEvent) {
        self.send(event);
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let report = peripheral.report.clone();
        let scanning = {
            let mut state = self.lock();
            state.peripherals.insert(report.id.clone(), peripheral);
            state.scanning && state.auto_respond
        };
        if scanning {
            self.send(RadioEvent::Discovered(report));
        }
    }

    /// Re-send the advertisement of a known peripheral
    pub fn advertise(&self, id: &DeviceId) {
        let report = self.lock().peripherals.get(id).map(|p| p.report.clone());
        if let Some(report) = report {
            self.send(RadioEvent::Discovered(report));
        }
    }

    pub fn set_responsive(&self, id: &DeviceId, responsive: bool) {
        if let Some(p) = self.lock().peripherals.get_mut(id) {
            p.responsive = responsive;
        }
    }

    pub fn set_reachable(&self, id: &DeviceId, reachable: bool) {
        if let Some(p) = self.lock().peripherals.get_mut(id) {
            p.reachable = reachable;
        }
    }

    /// The peripheral walks out of range with an open link
    pub fn drop_link(&self, id: &DeviceId, reason: &str) {
        let dropped = self.lock().links.remove(id).is_some();
        if dropped {
            self.send(RadioEvent::Disconnected {
                id: id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    pub fn set_powered(&self, powered: bool) {
        {
            let mut state = self.lock();
            state.powered = powered;
            if !powered {
                state.scanning = false;
                state.links.clear();
            }
        }
        self.send(RadioEvent::AdapterStateChanged { powered });
    }

    /// Make the next request fail synchronously
    pub fn fail_next_request(&self, reason: &str) {
        self.lock().fail_next = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Record the call and decide whether to answer it
    fn begin(&self, call: RadioCall) -> Result<Option<MutexGuard<'_, SimState>>> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(reason) = state.fail_next.take() {
            anyhow::bail!(reason);
        }
        if !state.powered {
            anyhow::bail!("adapter powered off");
        }
        Ok(state.auto_respond.then_some(state))
    }
}

impl Radio for SimulatedRadio {
    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let reports: Vec<DiscoveryReport> = {
            let Some(mut state) = self.begin(RadioCall::StartScan(filter.clone()))? else {
                return Ok(());
            };
            state.scanning = true;
            state.peripherals.values().map(|p| p.report.clone()).collect()
        };
        for report in reports {
            self.send(RadioEvent::Discovered(report));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        if let Some(mut state) = self.begin(RadioCall::StopScan)? {
            state.scanning = false;
        }
        Ok(())
    }

    fn connect(&self, id: &DeviceId) -> Result<()> {
        let result = {
            let Some(mut state) = self.begin(RadioCall::Connect(id.clone()))? else {
                return Ok(());
            };
            match state.peripherals.get(id).map(|p| p.reachable) {
                Some(true) => {
                    state.next_handle += 1;
                    let handle = ConnectionHandle::new(state.next_handle);
                    state.links.insert(id.clone(), handle);
                    Ok(handle)
                }
                Some(false) => Err("peripheral did not respond".to_string()),
                None => Err("unknown peripheral".to_string()),
            }
        };
        self.send(RadioEvent::ConnectResult {
            id: id.clone(),
            result,
        });
        Ok(())
    }

    fn disconnect(&self, id: &DeviceId, handle: ConnectionHandle) -> Result<()> {
        {
            let Some(mut state) = self.begin(RadioCall::Disconnect(id.clone(), handle))? else {
                return Ok(());
            };
            state.links.remove(id);
        }
        self.send(RadioEvent::DisconnectResult {
            id: id.clone(),
            result: Ok(()),
        });
        Ok(())
    }

    fn cancel_connect(&self, id: &DeviceId) -> Result<()> {
        if let Some(mut state) = self.begin(RadioCall::CancelConnect(id.clone()))? {
            state.links.remove(id);
        }
        Ok(())
    }

    fn ping(&self, id: &DeviceId, handle: ConnectionHandle, frame: &[u8]) -> Result<()> {
        let outcome = {
            let Some(state) = self.begin(RadioCall::Ping(id.clone(), handle, frame.to_vec()))?
            else {
                return Ok(());
            };
            let linked = state.links.get(id) == Some(&handle);
            match (linked, state.peripherals.get(id)) {
                (true, Some(p)) if p.responsive => {
                    Some(PingOutcome::Alive(format!("{};", p.battery).into_bytes()))
                }
                (true, Some(_)) => None,
                _ => Some(PingOutcome::Failed("no link".to_string())),
            }
        };
        // a silent peripheral never answers
        if let Some(outcome) = outcome {
            self.send(RadioEvent::PingResult {
                id: id.clone(),
                outcome,
            });
        }
        Ok(())
    }

    fn write(&self, id: &DeviceId, handle: ConnectionHandle, payload: &[u8]) -> Result<()> {
        let result = {
            let Some(state) = self.begin(RadioCall::Write(id.clone(), handle, payload.to_vec()))?
            else {
                return Ok(());
            };
            let linked = state.links.get(id) == Some(&handle);
            let responsive = state.peripherals.get(id).map(|p| p.responsive);
            match (linked, responsive) {
                (true, Some(true)) => Some(Ok(())),
                (true, Some(false)) => None,
                _ => Some(Err("no link".to_string())),
            }
        };
        if let Some(result) = result {
            self.send(RadioEvent::WriteResult {
                id: id.clone(),
                result,
            });
        }
        Ok(())
    }
}
