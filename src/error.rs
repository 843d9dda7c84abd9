//! Error types for the connection manager
//!
//! Every failure is handed back to the immediate caller, either as a
//! synchronous validation error or through the completion of a pending
//! operation. None of them are fatal to the manager.

use crate::domain::models::{DeviceId, DeviceState, OperationKind};
use thiserror::Error;

/// Errors surfaced by the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// Operation requested from an incompatible device state
    #[error("cannot {action} device {id} while it is {state}")]
    InvalidState {
        id: DeviceId,
        state: DeviceState,
        action: &'static str,
    },

    /// A request of the same kind is already in flight for this device
    #[error("a {kind} operation is already pending for device {id}")]
    DuplicateOperation { id: DeviceId, kind: OperationKind },

    /// Unknown device identifier
    #[error("device {0} not found")]
    NotFound(DeviceId),

    /// No hardware response within the configured bound
    #[error("{kind} operation on device {id} timed out")]
    Timeout { id: DeviceId, kind: OperationKind },

    /// The radio stack reported a failure; the reason is passed through as-is
    #[error("hardware failure: {0}")]
    HardwareFailure(String),

    /// A scan session is already active
    #[error("a scan is already in progress")]
    AlreadyScanning,

    /// The Bluetooth adapter is powered off
    #[error("bluetooth adapter is unavailable")]
    AdapterUnavailable,

    /// The manager went away before the operation resolved
    #[error("connection manager shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ManagerError::InvalidState {
            id: DeviceId::from("AA:BB"),
            state: DeviceState::Discovered,
            action: "disconnect",
        };
        assert_eq!(
            err.to_string(),
            "cannot disconnect device AA:BB while it is discovered"
        );

        let err = ManagerError::Timeout {
            id: DeviceId::from("AA:BB"),
            kind: OperationKind::Connect,
        };
        assert_eq!(err.to_string(), "connect operation on device AA:BB timed out");
    }
}
