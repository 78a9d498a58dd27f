//! Platform-agnostic types for dd-device companion sync.
//!
//! This crate holds everything that does not need a radio or a runtime:
//! GATT identifiers, record types and the JSON wire codec used by the
//! data and event characteristics.
//!
//! # Example
//!
//! ```
//! use ddsync_types::{RecordKind, codec};
//!
//! let raw = br#"{"event":{"event_id":"e-1","timestamp":"2019-08-01T12:00:00Z","event_type":1},"remaining":0}"#;
//! let (record, remaining) = codec::decode(RecordKind::Event, raw).unwrap();
//! assert_eq!(record.record_id(), "e-1");
//! assert_eq!(remaining, 0);
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use codec::{Envelope, SyncRecord};
pub use error::{DecodeError, DecodeResult};
pub use types::{
    CharacteristicId, Event, EventType, PeripheralHandle, Record, RecordKind, SensorReading,
    ServiceId,
};
pub use uuid as uuids;
