//! Core BLE sync library for companion data devices.
//!
//! This crate connects to paired peripherals over Bluetooth Low Energy and
//! pulls the records they queue up: sensor readings (temperature and
//! humidity) and discrete events. Each record is read one at a time from a
//! characteristic; the device reports how many remain, and a batch is handed
//! to the application once the queue is drained.
//!
//! # Architecture
//!
//! - [`ConnectionManager`] is a synchronous state machine. It owns the
//!   [`Transport`], reacts to [`TransportEvent`]s, and tracks per-peripheral
//!   readiness and sync sessions.
//! - [`BtleTransport`] drives a real adapter through btleplug. The
//!   [`mock::Simulator`] stands in for it in tests.
//! - [`SyncClient`] runs a manager on a tokio task and exposes a cloneable
//!   [`ClientHandle`].
//! - Completed batches are delivered to a [`SyncDelegate`];
//!   [`ChannelDelegate`] forwards them over a channel.
//!
//! # Platform Differences
//!
//! - **macOS**: Peripherals are identified by a UUID assigned by
//!   CoreBluetooth. It is stable for a device on a given Mac but differs
//!   between Macs.
//! - **Linux/Windows**: Peripherals are identified by their Bluetooth MAC
//!   address (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! Paired handles stored on disk are therefore only portable between machines
//! on Linux and Windows.
//!
//! # Quick Start
//!
//! ```no_run
//! use ddsync_core::{ChannelDelegate, ConnectionManager, ManagerConfig, SyncEvent};
//! use ddsync_core::{BtleTransport, SyncClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, transport_events) = BtleTransport::new().await?;
//!     let (delegate, mut batches) = ChannelDelegate::new();
//!     let manager = ConnectionManager::new(transport, delegate, ManagerConfig::default());
//!     let (client, _task) = SyncClient::spawn(manager, transport_events);
//!
//!     let mut events = client.subscribe();
//!     client.pair("AA:BB:CC:DD:EE:FF".into()).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let SyncEvent::Ready { handle } = event {
//!             client.sync_readings(handle).await?;
//!             break;
//!         }
//!     }
//!     if let Some(batch) = batches.recv().await {
//!         println!("Synced {} {}", batch.len(), batch.kind());
//!     }
//!     Ok(())
//! }
//! ```

pub mod allow_list;
pub mod ble;
pub mod client;
pub mod delegate;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod readiness;
pub mod session;
pub mod transport;
pub mod util;

pub use ddsync_types::types;
pub use ddsync_types::uuid;

pub use allow_list::AllowList;
pub use ble::BtleTransport;
pub use client::{ClientHandle, SyncClient};
pub use delegate::{ChannelDelegate, SyncDelegate, SyncedBatch};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SyncEvent};
pub use manager::{
    ConnectionManager, DEFAULT_READ_TIMEOUT, LinkState, ManagerConfig, PeripheralSummary,
};
pub use readiness::{ReadinessStatus, ReadinessTracker};
pub use session::{
    AbortReason, RejectReason, SessionState, SessionStatus, SessionStep, SyncSession,
};
pub use transport::{RadioState, Transport, TransportEvent};
pub use util::{format_peripheral_id, peripheral_handle};

pub use ddsync_types::uuid as uuids;
pub use ddsync_types::{
    CharacteristicId, DecodeError, Envelope, Event, EventType, PeripheralHandle, Record,
    RecordKind, SensorReading, ServiceId, SyncRecord,
};
