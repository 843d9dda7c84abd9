//! BLE central-role connection manager.
//!
//! Tracks discovered peripherals, drives them through
//! `Discovered -> Connecting -> Connected -> Disconnecting`, matches every
//! asynchronous radio callback to the command that caused it and watches
//! connected links for silent loss.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    Device, DeviceId, DeviceState, DisconnectReason, ManagerEvent, RadioEvent, ScanFilter,
};
pub use domain::settings::{ManagerConfig, Settings, SettingsService};
pub use error::{ManagerError, Result};
pub use infrastructure::bluetooth::{radio::Radio, BleManager, Completion};
