//! Wire codec for records read from a dd-device.
//!
//! Every read of the data or event characteristic returns exactly one record
//! wrapped in a JSON envelope that also carries the number of records still
//! queued on the device:
//!
//! ```text
//! {"event": {"event_id": "e-1", "timestamp": "2019-08-01T12:00:00Z", "event_type": 1}, "remaining": 2}
//! {"data": {"data_id": "d-1", "timestamp": 1564660800, "humidity": 41.5, "temperature": 22.25}, "remaining": 0}
//! ```
//!
//! Timestamps are normalized at decode time. The firmware sends either
//! RFC 3339 text or Unix seconds (as a JSON number or an all-digit string);
//! numeric timestamps are interpreted as UTC.
//!
//! # Example
//!
//! ```
//! use ddsync_types::codec::decode_reading;
//!
//! let raw = br#"{"data":{"data_id":"d-1","timestamp":1564660800,"humidity":41.5,"temperature":22.25},"remaining":0}"#;
//! let envelope = decode_reading(raw).unwrap();
//! assert_eq!(envelope.record.record_id, "d-1");
//! assert!(envelope.is_last());
//! ```

use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::{DecodeError, DecodeResult};
use crate::types::{Event, Record, RecordKind, SensorReading};
use crate::uuid::EVENT_NOTIFICATION_PREFIX;

/// One decoded record plus the device's remaining-count.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<R> {
    /// The decoded record.
    pub record: R,
    /// Records still queued on the device after this one.
    pub remaining: i64,
}

impl<R> Envelope<R> {
    /// Whether this record terminates the batch.
    ///
    /// A negative count is treated the same as zero.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.remaining <= 0
    }

    /// Convert the record into another type, keeping the remaining count.
    pub fn map<T>(self, f: impl FnOnce(R) -> T) -> Envelope<T> {
        Envelope {
            record: f(self.record),
            remaining: self.remaining,
        }
    }
}

/// Record types that can be read one-per-read from a dd-device.
///
/// Implemented for [`Event`] and [`SensorReading`]; lets the sync session be
/// generic over the record kind.
pub trait SyncRecord: Sized {
    /// The kind tag for this record type.
    const KIND: RecordKind;

    /// Decode one wire envelope.
    fn decode(raw: &[u8]) -> DecodeResult<Envelope<Self>>;
}

impl SyncRecord for Event {
    const KIND: RecordKind = RecordKind::Event;

    fn decode(raw: &[u8]) -> DecodeResult<Envelope<Self>> {
        decode_event(raw)
    }
}

impl SyncRecord for SensorReading {
    const KIND: RecordKind = RecordKind::SensorReading;

    fn decode(raw: &[u8]) -> DecodeResult<Envelope<Self>> {
        decode_reading(raw)
    }
}

// --- Wire representation ---

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Seconds(i64),
    Text(String),
}

impl WireTimestamp {
    fn normalize(self) -> DecodeResult<OffsetDateTime> {
        match self {
            WireTimestamp::Seconds(secs) => from_unix_seconds(secs, &secs.to_string()),
            WireTimestamp::Text(text) => parse_timestamp_text(&text),
        }
    }
}

#[derive(Deserialize)]
struct EventFields {
    event_id: String,
    timestamp: WireTimestamp,
    event_type: i32,
}

#[derive(Deserialize)]
struct EventEnvelope {
    event: EventFields,
    remaining: i64,
}

#[derive(Deserialize)]
struct ReadingFields {
    data_id: String,
    timestamp: WireTimestamp,
    humidity: f32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ReadingEnvelope {
    data: ReadingFields,
    remaining: i64,
}

#[derive(Serialize)]
struct EventFieldsRef<'a> {
    event_id: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    event_type: i32,
}

#[derive(Serialize)]
struct EventEnvelopeRef<'a> {
    event: EventFieldsRef<'a>,
    remaining: i64,
}

#[derive(Serialize)]
struct ReadingFieldsRef<'a> {
    data_id: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    humidity: f32,
    temperature: f32,
}

#[derive(Serialize)]
struct ReadingEnvelopeRef<'a> {
    data: ReadingFieldsRef<'a>,
    remaining: i64,
}

fn from_unix_seconds(secs: i64, raw: &str) -> DecodeResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| DecodeError::invalid_timestamp(raw, e.to_string()))
}

fn parse_timestamp_text(text: &str) -> DecodeResult<OffsetDateTime> {
    let trimmed = text.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = trimmed
            .parse()
            .map_err(|_| DecodeError::invalid_timestamp(text, "numeric timestamp out of range"))?;
        return from_unix_seconds(secs, text);
    }

    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(dt);
    }
    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Iso8601::DEFAULT) {
        return Ok(dt);
    }
    // Firmware clocks without a zone report local time as UTC.
    PrimitiveDateTime::parse(trimmed, &Iso8601::DEFAULT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| DecodeError::invalid_timestamp(text, e.to_string()))
}

fn utf8(raw: &[u8]) -> DecodeResult<&str> {
    Ok(std::str::from_utf8(raw)?)
}

// --- Public API ---

/// Decode one event envelope.
pub fn decode_event(raw: &[u8]) -> DecodeResult<Envelope<Event>> {
    let wire: EventEnvelope = serde_json::from_str(utf8(raw)?)?;
    Ok(Envelope {
        record: Event {
            record_id: wire.event.event_id,
            timestamp: wire.event.timestamp.normalize()?,
            event_type: wire.event.event_type,
        },
        remaining: wire.remaining,
    })
}

/// Decode one sensor-reading envelope.
pub fn decode_reading(raw: &[u8]) -> DecodeResult<Envelope<SensorReading>> {
    let wire: ReadingEnvelope = serde_json::from_str(utf8(raw)?)?;
    Ok(Envelope {
        record: SensorReading {
            record_id: wire.data.data_id,
            timestamp: wire.data.timestamp.normalize()?,
            humidity: wire.data.humidity,
            temperature: wire.data.temperature,
        },
        remaining: wire.remaining,
    })
}

/// Decode one envelope of the given kind.
///
/// Returns the record and the device's remaining-count.
pub fn decode(kind: RecordKind, raw: &[u8]) -> DecodeResult<(Record, i64)> {
    let envelope = match kind {
        RecordKind::Event => decode_event(raw)?.map(Record::Event),
        RecordKind::SensorReading => decode_reading(raw)?.map(Record::SensorReading),
    };
    Ok((envelope.record, envelope.remaining))
}

/// Encode an event the way the device firmware does.
pub fn encode_event(event: &Event, remaining: i64) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EventEnvelopeRef {
        event: EventFieldsRef {
            event_id: &event.record_id,
            timestamp: event.timestamp,
            event_type: event.event_type,
        },
        remaining,
    })
}

/// Encode a sensor reading the way the device firmware does.
pub fn encode_reading(reading: &SensorReading, remaining: i64) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ReadingEnvelopeRef {
        data: ReadingFieldsRef {
            data_id: &reading.record_id,
            timestamp: reading.timestamp,
            humidity: reading.humidity,
            temperature: reading.temperature,
        },
        remaining,
    })
}

/// Whether a push from the event-notify characteristic asks for an event poll.
#[must_use]
pub fn is_event_notification(raw: &[u8]) -> bool {
    raw.starts_with(EVENT_NOTIFICATION_PREFIX)
}


/// Property-based tests for the wire codec.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Decoding arbitrary bytes never panics.
        #[test]
        fn decode_never_panics(data: Vec<u8>) {
            let _ = decode(RecordKind::Event, &data);
            let _ = decode(RecordKind::SensorReading, &data);
        }

        /// Arbitrary text in the timestamp slot is rejected or normalized, never a panic.
        #[test]
        fn timestamp_text_never_panics(ts in "\\PC{0,40}") {
            let raw = serde_json::json!({
                "event": {"event_id": "e", "timestamp": ts, "event_type": 1},
                "remaining": 0
            });
            let _ = decode_event(raw.to_string().as_bytes());
        }

        /// Truncating a valid envelope anywhere short of its end is an error.
        #[test]
        fn truncated_envelope_is_rejected(cut in 0usize..80) {
            let raw = br#"{"data":{"data_id":"d-1","timestamp":1564660800,"humidity":41.5,"temperature":22.25},"remaining":0}"#;
            let cut = cut.min(raw.len() - 1);
            prop_assert!(decode_reading(&raw[..cut]).is_err());
        }

        /// Any in-range Unix timestamp survives an encode/decode pass.
        #[test]
        fn unix_seconds_normalize(secs in 0i64..4_102_444_800, remaining in -3i64..1000) {
            let event = Event {
                record_id: "e".to_string(),
                timestamp: OffsetDateTime::from_unix_timestamp(secs).unwrap(),
                event_type: 1,
            };
            let raw = encode_event(&event, remaining).unwrap();
            let envelope = decode_event(&raw).unwrap();
            prop_assert_eq!(envelope.record.timestamp.unix_timestamp(), secs);
            prop_assert_eq!(envelope.remaining, remaining);
        }
    }
}
