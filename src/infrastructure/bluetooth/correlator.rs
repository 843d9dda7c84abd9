//! Callback Correlator
//!
//! Matches asynchronous radio completions to the caller that asked for
//! them. At most one operation per (device, kind) is in flight, and every
//! registered operation is resolved exactly once: by a matching radio
//! event, by the timeout sweep, or by the device going away.

use crate::domain::models::{DeviceId, OperationKind};
use crate::error::{ManagerError, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome delivered to the caller of a command
pub type OperationResult = Result<()>;

/// Caller side of a completion
pub type Responder = oneshot::Sender<OperationResult>;

/// Identifies one registered operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationToken(u64);

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

struct PendingOperation {
    token: OperationToken,
    responder: Responder,
    created_at: Instant,
}

impl PendingOperation {
    fn complete(self, id: &DeviceId, kind: OperationKind, result: OperationResult) {
        debug!(
            "Resolving {} {} for {}: {}",
            kind,
            self.token,
            id,
            match &result {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            }
        );
        if self.responder.send(result).is_err() {
            debug!("Caller of {} stopped waiting", self.token);
        }
    }
}

#[derive(Default)]
pub struct CallbackCorrelator {
    pending: HashMap<(DeviceId, OperationKind), PendingOperation>,
    next_token: u64,
}

impl CallbackCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending operation.
    ///
    /// Fails with `DuplicateOperation` if one of the same kind is already
    /// outstanding for the device; the new responder is dropped untouched.
    pub fn register(
        &mut self,
        id: &DeviceId,
        kind: OperationKind,
        responder: Responder,
        now: Instant,
    ) -> Result<OperationToken> {
        let key = (id.clone(), kind);
        if self.pending.contains_key(&key) {
            return Err(ManagerError::DuplicateOperation {
                id: id.clone(),
                kind,
            });
        }

        self.next_token += 1;
        let token = OperationToken(self.next_token);
        self.pending.insert(
            key,
            PendingOperation {
                token,
                responder,
                created_at: now,
            },
        );
        debug!("Registered {} {} for {}", kind, token, id);
        Ok(token)
    }

    /// Complete the matching pending operation.
    ///
    /// Returns `false` (and warns) when nothing was pending, which happens
    /// when the radio answers after the operation already ended.
    pub fn resolve(&mut self, id: &DeviceId, kind: OperationKind, result: OperationResult) -> bool {
        match self.pending.remove(&(id.clone(), kind)) {
            Some(op) => {
                op.complete(id, kind, result);
                true
            }
            None => {
                warn!("No pending {} operation for {}, ignoring result", kind, id);
                false
            }
        }
    }

    /// Complete every operation of a device with the same error
    pub fn resolve_all(&mut self, id: &DeviceId, error: ManagerError) -> usize {
        let kinds: Vec<OperationKind> = self
            .pending
            .keys()
            .filter(|(device, _)| device == id)
            .map(|(_, kind)| *kind)
            .collect();

        for kind in &kinds {
            if let Some(op) = self.pending.remove(&(id.clone(), *kind)) {
                op.complete(id, *kind, Err(error.clone()));
            }
        }
        kinds.len()
    }

    /// Complete everything with the same error, e.g. when the adapter goes away
    pub fn drain(&mut self, error: ManagerError) -> usize {
        let count = self.pending.len();
        for ((id, kind), op) in self.pending.drain() {
            op.complete(&id, kind, Err(error.clone()));
        }
        count
    }

    /// Fail every operation older than `timeout` with `Timeout`.
    ///
    /// Returns the expired (device, kind) pairs so the caller can roll back
    /// the state those operations left behind.
    pub fn sweep_timed_out(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(DeviceId, OperationKind)> {
        let expired: Vec<(DeviceId, OperationKind)> = self
            .pending
            .iter()
            .filter(|(_, op)| now.saturating_duration_since(op.created_at) > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for (id, kind) in &expired {
            if let Some(op) = self.pending.remove(&(id.clone(), *kind)) {
                warn!("{} operation on {} timed out", kind, id);
                op.complete(
                    id,
                    *kind,
                    Err(ManagerError::Timeout {
                        id: id.clone(),
                        kind: *kind,
                    }),
                );
            }
        }
        expired
    }

    pub fn is_pending(&self, id: &DeviceId, kind: OperationKind) -> bool {
        self.pending.contains_key(&(id.clone(), kind))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
