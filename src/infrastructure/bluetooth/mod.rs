//! Bluetooth Module
//!
//! Central-role connection management for BLE peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       BleManager                        │
//! │   (one lock over all state - public API for callers)    │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Heartbeat │  │  Bridge  │
//! │           │  │            │  │           │  │          │
//! │ - session │  │ - state    │  │ - pings   │  │ - events │
//! │ - filter  │  │   machine  │  │ - loss    │  │   out    │
//! │ - pruning │  │ - pending  │  │   detect  │  │          │
//! └─────┬─────┘  └─────┬──────┘  └───────────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌───────────┐  ┌────────────┐        ┌──────────┐
//! │ Registry  │  │ Correlator │        │  Radio   │ <- platform stack
//! └───────────┘  └────────────┘        └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`] - Device table and the state machine guard
//! - [`correlator`] - Pending operations matched to their radio callbacks
//! - [`scanner`] - Scan session, filtering and stale discovery pruning
//! - [`connection`] - Connect/disconnect/write orchestration
//! - [`heartbeat`] - Liveness tracking of connected devices
//! - [`bridge`] - Outbound event delivery to a single observer
//! - [`protocol`] - Peripheral command framing and reply parsing
//! - [`radio`] - The platform radio seam
//! - [`simulated`] - In-memory radio for demos and tests
//! - [`service`] - Main service coordinator

pub mod bridge;
pub mod connection;
pub mod correlator;
pub mod heartbeat;
pub mod protocol;
pub mod radio;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod simulated;

// Re-export main service for convenience
pub use service::{BleManager, Completion};
