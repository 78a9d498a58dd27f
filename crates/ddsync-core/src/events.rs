//! Lifecycle events for observers of the sync engine.
//!
//! Completed batches go to the [`crate::SyncDelegate`]; everything else that
//! an observer might want to display (discovery, link changes, sync
//! progress) is broadcast as a [`SyncEvent`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ddsync_types::{PeripheralHandle, RecordKind};

use crate::session::AbortReason;

/// Events emitted by the connection manager.
///
/// All events are serializable for logging and JSON output.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A matching peripheral was seen for the first time.
    Discovered {
        handle: PeripheralHandle,
        name: String,
        rssi: Option<i16>,
    },
    /// Link established.
    Connected { handle: PeripheralHandle },
    /// Every required service and characteristic has been discovered.
    Ready { handle: PeripheralHandle },
    /// Link lost or closed.
    Disconnected {
        handle: PeripheralHandle,
        error: Option<String>,
    },
    /// A batch was started.
    SyncStarted {
        handle: PeripheralHandle,
        kind: RecordKind,
    },
    /// A batch was delivered to the delegate.
    SyncCompleted {
        handle: PeripheralHandle,
        kind: RecordKind,
        records: usize,
    },
    /// A batch was discarded.
    SyncAborted {
        handle: PeripheralHandle,
        kind: RecordKind,
        reason: AbortReason,
    },
}

impl SyncEvent {
    /// The peripheral this event concerns.
    pub fn handle(&self) -> &PeripheralHandle {
        match self {
            SyncEvent::Discovered { handle, .. }
            | SyncEvent::Connected { handle }
            | SyncEvent::Ready { handle }
            | SyncEvent::Disconnected { handle, .. }
            | SyncEvent::SyncStarted { handle, .. }
            | SyncEvent::SyncCompleted { handle, .. }
            | SyncEvent::SyncAborted { handle, .. } => handle,
        }
    }
}

/// Sender for sync events.
pub type EventSender = broadcast::Sender<SyncEvent>;

/// Receiver for sync events.
pub type EventReceiver = broadcast::Receiver<SyncEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SyncEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_without_receivers() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.receiver_count(), 0);
        dispatcher.send(SyncEvent::Connected {
            handle: PeripheralHandle::from("p-1"),
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 1);

        dispatcher.send(SyncEvent::SyncCompleted {
            handle: PeripheralHandle::from("p-1"),
            kind: RecordKind::SensorReading,
            records: 3,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.handle().as_str(), "p-1");
        assert!(matches!(event, SyncEvent::SyncCompleted { records: 3, .. }));
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::SyncAborted {
            handle: PeripheralHandle::from("p-1"),
            kind: RecordKind::Event,
            reason: AbortReason::TimedOut,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync_aborted");
        assert_eq!(json["kind"], "event");
        assert_eq!(json["reason"], "timed_out");
    }
}
