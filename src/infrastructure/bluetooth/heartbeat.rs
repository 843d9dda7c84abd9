//! Heartbeat Monitor
//!
//! Tracks when each connected device last proved it was alive. A device
//! that has been silent longer than the staleness threshold gets pinged;
//! a ping left unanswered past the ping timeout means the link is gone.

use crate::domain::models::{ConnectionHandle, DeviceId};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessRecord {
    pub last_alive: Instant,
    pub ping_sent_at: Option<Instant>,
    /// Last level reported in a ping reply
    pub battery: Option<u8>,
}

/// What a heartbeat tick wants done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ping {
        id: DeviceId,
        handle: ConnectionHandle,
    },
    Lost {
        id: DeviceId,
    },
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    staleness_threshold: Duration,
    ping_timeout: Duration,
    records: HashMap<DeviceId, LivenessRecord>,
}

impl HeartbeatMonitor {
    pub fn new(staleness_threshold: Duration, ping_timeout: Duration) -> Self {
        Self {
            staleness_threshold,
            ping_timeout,
            records: HashMap::new(),
        }
    }

    /// Start tracking a freshly connected device
    pub fn reset(&mut self, id: &DeviceId, now: Instant) {
        self.records.insert(
            id.clone(),
            LivenessRecord {
                last_alive: now,
                ping_sent_at: None,
                battery: None,
            },
        );
    }

    /// A ping came back. Returns `false` if the device is not tracked.
    pub fn record_alive(&mut self, id: &DeviceId, now: Instant) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                trace!("Device {} is alive", id);
                record.last_alive = now;
                record.ping_sent_at = None;
                true
            }
            None => false,
        }
    }

    pub fn record_battery(&mut self, id: &DeviceId, level: u8) {
        if let Some(record) = self.records.get_mut(id) {
            record.battery = Some(level);
        }
    }

    pub fn clear(&mut self, id: &DeviceId) {
        self.records.remove(id);
    }

    pub fn clear_all(&mut self) {
        self.records.clear();
    }

    pub fn record(&self, id: &DeviceId) -> Option<&LivenessRecord> {
        self.records.get(id)
    }

    /// Inspect every connected device and decide who needs a ping and
    /// whose link should be considered lost
    pub fn tick(&mut self, registry: &DeviceRegistry, now: Instant) -> Vec<HeartbeatAction> {
        let connected = registry.connected();
        self.records
            .retain(|id, _| connected.iter().any(|(connected_id, _)| connected_id == id));

        let mut actions = Vec::new();
        for (id, handle) in connected {
            let record = self.records.entry(id.clone()).or_insert_with(|| {
                debug!("Connected device {} had no liveness record", id);
                LivenessRecord {
                    last_alive: now,
                    ping_sent_at: None,
                    battery: None,
                }
            });

            if let Some(sent_at) = record.ping_sent_at {
                if now.saturating_duration_since(sent_at) >= self.ping_timeout {
                    warn!("Ping to {} went unanswered", id);
                    actions.push(HeartbeatAction::Lost { id });
                }
                continue;
            }

            if now.saturating_duration_since(record.last_alive) > self.staleness_threshold {
                record.ping_sent_at = Some(now);
                actions.push(HeartbeatAction::Ping { id, handle });
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AdvertisementData, DeviceState, DiscoveryReport};

    fn connected_registry(id: &DeviceId, handle: ConnectionHandle, now: Instant) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.upsert_discovered(
            &DiscoveryReport {
                id: id.clone(),
                name: None,
                rssi: -50,
                advertisement: AdvertisementData::default(),
            },
            now,
        );
        registry.set_state(id, DeviceState::Connecting, None).unwrap();
        registry
            .set_state(id, DeviceState::Connected, Some(handle))
            .unwrap();
        registry
    }

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(5), Duration::from_secs(3))
    }

    #[test]
    fn test_fresh_device_not_pinged() {
        let id = DeviceId::from("AA:BB");
        let t0 = Instant::now();
        let registry = connected_registry(&id, ConnectionHandle::new(1), t0);
        let mut monitor = monitor();
        monitor.reset(&id, t0);

        assert!(monitor.tick(&registry, t0 + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn test_stale_device_pinged_once() {
        let id = DeviceId::from("AA:BB");
        let handle = ConnectionHandle::new(1);
        let t0 = Instant::now();
        let registry = connected_registry(&id, handle, t0);
        let mut monitor = monitor();
        monitor.reset(&id, t0);

        let t6 = t0 + Duration::from_secs(6);
        assert_eq!(
            monitor.tick(&registry, t6),
            vec![HeartbeatAction::Ping {
                id: id.clone(),
                handle
            }]
        );
        // ping outstanding, not yet timed out
        assert!(monitor.tick(&registry, t6 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_answered_ping_refreshes() {
        let id = DeviceId::from("AA:BB");
        let t0 = Instant::now();
        let registry = connected_registry(&id, ConnectionHandle::new(1), t0);
        let mut monitor = monitor();
        monitor.reset(&id, t0);

        let t6 = t0 + Duration::from_secs(6);
        monitor.tick(&registry, t6);
        assert!(monitor.record_alive(&id, t6 + Duration::from_millis(100)));

        monitor.record_battery(&id, 85);

        let record = monitor.record(&id).unwrap();
        assert_eq!(record.ping_sent_at, None);
        assert_eq!(record.battery, Some(85));
        assert!(monitor.tick(&registry, t6 + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn test_unanswered_ping_is_lost() {
        let id = DeviceId::from("AA:BB");
        let t0 = Instant::now();
        let registry = connected_registry(&id, ConnectionHandle::new(1), t0);
        let mut monitor = monitor();
        monitor.reset(&id, t0);

        let t6 = t0 + Duration::from_secs(6);
        monitor.tick(&registry, t6);
        assert_eq!(
            monitor.tick(&registry, t6 + Duration::from_secs(3)),
            vec![HeartbeatAction::Lost { id }]
        );
    }

    #[test]
    fn test_records_dropped_for_disconnected_devices() {
        let id = DeviceId::from("AA:BB");
        let mut monitor = monitor();
        monitor.reset(&id, Instant::now());

        monitor.tick(&DeviceRegistry::new(), Instant::now());
        assert!(monitor.record(&id).is_none());
        assert!(!monitor.record_alive(&id, Instant::now()));
    }
}
