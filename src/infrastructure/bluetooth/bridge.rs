//! Event Bridge
//!
//! Publishes [`ManagerEvent`]s to at most one subscriber. With nobody
//! subscribed, events are dropped rather than queued.

use crate::domain::models::ManagerEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Clone, Default)]
pub struct EventBridge {
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<ManagerEvent>>>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber, replacing any previous one
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tx);
        if previous.is_some() {
            debug!("Event subscriber replaced");
        }
        rx
    }

    pub fn unsubscribe(&self) {
        if self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Event subscriber detached");
        }
    }

    pub fn is_observing(&self) -> bool {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn emit(&self, event: ManagerEvent) {
        let mut subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(tx) = subscriber.as_ref() else {
            trace!("No subscriber, dropping {:?}", event);
            return;
        };

        if tx.send(event).is_err() {
            debug!("Event subscriber went away");
            *subscriber = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_dropped_without_subscriber() {
        let bridge = EventBridge::new();
        assert!(!bridge.is_observing());
        bridge.emit(ManagerEvent::ScanStarted);

        let mut rx = bridge.subscribe();
        assert!(bridge.is_observing());
        bridge.emit(ManagerEvent::ScanStopped);

        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::ScanStopped);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bridge = EventBridge::new();
        let mut rx = bridge.subscribe();
        bridge.unsubscribe();
        bridge.emit(ManagerEvent::ScanStarted);

        assert!(!bridge.is_observing());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_clears_subscriber() {
        let bridge = EventBridge::new();
        drop(bridge.subscribe());
        bridge.emit(ManagerEvent::ScanStarted);
        assert!(!bridge.is_observing());
    }
}
