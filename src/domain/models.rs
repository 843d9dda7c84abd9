use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Stable hardware identifier of a peripheral (address or platform UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a live low-level link, issued by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Connection state of a tracked device.
///
/// ```text
/// Discovered ──► Connecting ──► Connected ──► Disconnecting
///     ▲              │              │               │
///     └──────────────┴──────────────┴───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
}

impl DeviceState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Discovered)
                | (Connected, Disconnecting)
                | (Connected, Discovered)
                | (Disconnecting, Discovered)
        )
    }

    /// Any state in which a link exists or is being negotiated
    pub fn is_linked(self) -> bool {
        !matches!(self, DeviceState::Discovered)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    pub service_uuids: Vec<String>,
    pub manufacturer_data: Vec<u8>,
    pub tx_power: Option<i16>,
}

/// Discovery metadata kept for every tracked device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetadata {
    pub name: Option<String>,
    pub rssi: i16,
    pub advertisement: AdvertisementData,
    pub last_seen: Instant,
}

impl DeviceMetadata {
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown",
        }
    }
}

/// A device record as held by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub metadata: DeviceMetadata,
    pub(crate) state: DeviceState,
    pub(crate) connection: Option<ConnectionHandle>,
}

impl Device {
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Present exactly when the device is `Connected`
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.state == DeviceState::Connected
    }
}

/// Raw advertisement report delivered by the radio stack
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertisement: AdvertisementData,
}

/// Filter criteria for a scan session. Unset criteria accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuids: Vec<String>,
    pub name_prefixes: Vec<String>,
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    /// A report passes when it satisfies every criterion that is set
    pub fn matches(&self, report: &DiscoveryReport) -> bool {
        if let Some(min) = self.min_rssi {
            if report.rssi < min {
                return false;
            }
        }

        if !self.service_uuids.is_empty() {
            let advertised = &report.advertisement.service_uuids;
            let found = self
                .service_uuids
                .iter()
                .any(|wanted| advertised.iter().any(|u| u.eq_ignore_ascii_case(wanted)));
            if !found {
                return false;
            }
        }

        if !self.name_prefixes.is_empty() {
            let name = report.name.as_deref().unwrap_or_default().to_lowercase();
            if !self
                .name_prefixes
                .iter()
                .any(|prefix| name.starts_with(&prefix.to_lowercase()))
            {
                return false;
            }
        }

        true
    }
}

/// Kinds of caller-visible asynchronous operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Write => "write",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// The ping was answered; carries the raw reply frame
    Alive(Vec<u8>),
    Failed(String),
    TimedOut,
}

/// Events delivered by the radio-stack binding
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Discovered(DiscoveryReport),
    ConnectResult {
        id: DeviceId,
        result: std::result::Result<ConnectionHandle, String>,
    },
    DisconnectResult {
        id: DeviceId,
        result: std::result::Result<(), String>,
    },
    /// Link dropped without being asked to
    Disconnected { id: DeviceId, reason: String },
    PingResult { id: DeviceId, outcome: PingOutcome },
    WriteResult {
        id: DeviceId,
        result: std::result::Result<(), String>,
    },
    AdapterStateChanged { powered: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Caller asked for it
    Requested,
    /// Radio stack dropped the link
    Remote(String),
    /// Disconnect confirmation never arrived
    Timeout,
    AdapterPoweredOff,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::Remote(reason) => write!(f, "remote: {}", reason),
            DisconnectReason::Timeout => f.write_str("timed out"),
            DisconnectReason::AdapterPoweredOff => f.write_str("adapter powered off"),
        }
    }
}

/// Notifications published to the event bridge subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    DeviceDiscovered {
        id: DeviceId,
        metadata: DeviceMetadata,
    },
    DeviceConnected {
        id: DeviceId,
    },
    DeviceDisconnected {
        id: DeviceId,
        reason: DisconnectReason,
    },
    ConnectionLost {
        id: DeviceId,
    },
    ConnectionFailed {
        id: DeviceId,
        reason: String,
    },
    DeviceRemoved {
        id: DeviceId,
    },
    ScanStarted,
    ScanStopped,
    AdapterStateChanged {
        powered: bool,
    },
}
