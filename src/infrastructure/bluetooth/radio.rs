//! Radio Stack Binding
//!
//! The platform driver behind the manager. Every request returns as soon as
//! it has been handed to the stack; the outcome comes back later as a
//! [`RadioEvent`](crate::domain::models::RadioEvent) on the stream passed to
//! [`BleManager::run`](super::BleManager::run).
//!
//! Implementations are called with the manager's state lock held and must
//! not block or call back into the manager.

use crate::domain::models::{ConnectionHandle, DeviceId, ScanFilter};
use anyhow::Result;

pub trait Radio: Send + Sync {
    /// Begin delivering `RadioEvent::Discovered` reports
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    fn stop_scan(&self) -> Result<()>;

    /// Completes with `RadioEvent::ConnectResult`
    fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Completes with `RadioEvent::DisconnectResult`
    fn disconnect(&self, id: &DeviceId, handle: ConnectionHandle) -> Result<()>;

    /// Abort an outstanding connect attempt. No completion is expected.
    fn cancel_connect(&self, id: &DeviceId) -> Result<()>;

    /// Send a lightweight ping; completes with `RadioEvent::PingResult`
    fn ping(&self, id: &DeviceId, handle: ConnectionHandle, frame: &[u8]) -> Result<()>;

    /// Completes with `RadioEvent::WriteResult`
    fn write(&self, id: &DeviceId, handle: ConnectionHandle, payload: &[u8]) -> Result<()>;
}
