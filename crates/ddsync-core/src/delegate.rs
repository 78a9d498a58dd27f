//! Delivery of completed batches to the application.
//!
//! The manager calls exactly one delegate method per completed batch and
//! never for a partial one. Ownership of the records moves to the delegate.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use ddsync_types::{Event, PeripheralHandle, RecordKind, SensorReading};

/// Receiver of completed batches.
pub trait SyncDelegate: Send {
    /// A full batch of events was read from a peripheral.
    fn on_events_synced(&mut self, handle: &PeripheralHandle, events: Vec<Event>);

    /// A full batch of sensor readings was read from a peripheral.
    fn on_readings_synced(&mut self, handle: &PeripheralHandle, readings: Vec<SensorReading>);
}

/// A completed batch as a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncedBatch {
    /// A batch of events.
    Events {
        /// Source peripheral.
        handle: PeripheralHandle,
        /// Events in device order.
        records: Vec<Event>,
    },
    /// A batch of sensor readings.
    Readings {
        /// Source peripheral.
        handle: PeripheralHandle,
        /// Readings in device order.
        records: Vec<SensorReading>,
    },
}

impl SyncedBatch {
    /// Source peripheral.
    pub fn handle(&self) -> &PeripheralHandle {
        match self {
            SyncedBatch::Events { handle, .. } | SyncedBatch::Readings { handle, .. } => handle,
        }
    }

    /// Which kind of records the batch carries.
    pub fn kind(&self) -> RecordKind {
        match self {
            SyncedBatch::Events { .. } => RecordKind::Event,
            SyncedBatch::Readings { .. } => RecordKind::SensorReading,
        }
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        match self {
            SyncedBatch::Events { records, .. } => records.len(),
            SyncedBatch::Readings { records, .. } => records.len(),
        }
    }

    /// Whether the batch is empty. Completed batches never are.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delegate that forwards every batch over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<SyncedBatch>,
}

impl ChannelDelegate {
    /// Create a delegate and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncedBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, batch: SyncedBatch) {
        if self.tx.send(batch).is_err() {
            warn!("Batch receiver dropped, discarding completed batch");
        }
    }
}

impl SyncDelegate for ChannelDelegate {
    fn on_events_synced(&mut self, handle: &PeripheralHandle, events: Vec<Event>) {
        self.forward(SyncedBatch::Events {
            handle: handle.clone(),
            records: events,
        });
    }

    fn on_readings_synced(&mut self, handle: &PeripheralHandle, readings: Vec<SensorReading>) {
        self.forward(SyncedBatch::Readings {
            handle: handle.clone(),
            records: readings,
        });
    }
}
