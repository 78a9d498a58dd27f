//! Core types for dd-device peripherals and the records they queue.

use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::uuid as ids;

/// Opaque identifier of a discovered radio peripheral.
///
/// On macOS this is the CoreBluetooth-assigned UUID; on Linux and Windows it
/// is the Bluetooth MAC address. The handle is stable for the lifetime of a
/// connection and is the key of the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Create a handle from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// GATT services exposed by a dd-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    /// Pairing.
    Pair,
    /// Unpairing.
    Unpair,
    /// Sensor readings.
    Data,
    /// Event log.
    Event,
    /// Event notifications (discovered, never gates readiness).
    EventNotify,
}

impl ServiceId {
    /// Every known service.
    pub const ALL: [ServiceId; 5] = [
        ServiceId::Pair,
        ServiceId::Unpair,
        ServiceId::Data,
        ServiceId::Event,
        ServiceId::EventNotify,
    ];

    /// Services that must be discovered before a peripheral is sync-ready.
    pub const REQUIRED: [ServiceId; 4] = [
        ServiceId::Pair,
        ServiceId::Unpair,
        ServiceId::Data,
        ServiceId::Event,
    ];

    /// The 128-bit UUID of this service.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            ServiceId::Pair => ids::PAIR_SERVICE,
            ServiceId::Unpair => ids::UNPAIR_SERVICE,
            ServiceId::Data => ids::DATA_SERVICE,
            ServiceId::Event => ids::EVENT_SERVICE,
            ServiceId::EventNotify => ids::EVENT_NOTIFY_SERVICE,
        }
    }

    /// Look up a service by UUID. Returns `None` for foreign services.
    ///
    /// ```
    /// use ddsync_types::ServiceId;
    /// use ddsync_types::uuid::DATA_SERVICE;
    ///
    /// assert_eq!(ServiceId::from_uuid(DATA_SERVICE), Some(ServiceId::Data));
    /// assert_eq!(ServiceId::from_uuid(uuid::Uuid::nil()), None);
    /// ```
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.uuid() == uuid)
    }

    /// Whether this service gates readiness.
    #[must_use]
    pub const fn is_required(self) -> bool {
        !matches!(self, ServiceId::EventNotify)
    }

    /// The characteristic carried by this service.
    #[must_use]
    pub const fn characteristic(self) -> CharacteristicId {
        match self {
            ServiceId::Pair => CharacteristicId::Pair,
            ServiceId::Unpair => CharacteristicId::Unpair,
            ServiceId::Data => CharacteristicId::Data,
            ServiceId::Event => CharacteristicId::Event,
            ServiceId::EventNotify => CharacteristicId::EventNotify,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceId::Pair => "pair",
            ServiceId::Unpair => "unpair",
            ServiceId::Data => "data",
            ServiceId::Event => "event",
            ServiceId::EventNotify => "event-notify",
        };
        write!(f, "{} service", name)
    }
}

/// GATT characteristics exposed by a dd-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacteristicId {
    /// Pairing.
    Pair,
    /// Unpairing.
    Unpair,
    /// Sensor readings, read-on-demand.
    Data,
    /// Events, read-on-demand.
    Event,
    /// Event notifications, push only.
    EventNotify,
}

impl CharacteristicId {
    /// Every known characteristic.
    pub const ALL: [CharacteristicId; 5] = [
        CharacteristicId::Pair,
        CharacteristicId::Unpair,
        CharacteristicId::Data,
        CharacteristicId::Event,
        CharacteristicId::EventNotify,
    ];

    /// Characteristics that must be discovered before a peripheral is sync-ready.
    pub const REQUIRED: [CharacteristicId; 4] = [
        CharacteristicId::Pair,
        CharacteristicId::Unpair,
        CharacteristicId::Data,
        CharacteristicId::Event,
    ];

    /// The 128-bit UUID of this characteristic.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            CharacteristicId::Pair => ids::PAIR_CHARACTERISTIC,
            CharacteristicId::Unpair => ids::UNPAIR_CHARACTERISTIC,
            CharacteristicId::Data => ids::DATA_CHARACTERISTIC,
            CharacteristicId::Event => ids::EVENT_CHARACTERISTIC,
            CharacteristicId::EventNotify => ids::EVENT_NOTIFY_CHARACTERISTIC,
        }
    }

    /// Look up a characteristic by UUID. Returns `None` for foreign characteristics.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Whether this characteristic gates readiness.
    #[must_use]
    pub const fn is_required(self) -> bool {
        !matches!(self, CharacteristicId::EventNotify)
    }

    /// The service this characteristic belongs to.
    #[must_use]
    pub const fn service(self) -> ServiceId {
        match self {
            CharacteristicId::Pair => ServiceId::Pair,
            CharacteristicId::Unpair => ServiceId::Unpair,
            CharacteristicId::Data => ServiceId::Data,
            CharacteristicId::Event => ServiceId::Event,
            CharacteristicId::EventNotify => ServiceId::EventNotify,
        }
    }

    /// The record kind read through this characteristic, if any.
    #[must_use]
    pub const fn record_kind(self) -> Option<RecordKind> {
        match self {
            CharacteristicId::Data => Some(RecordKind::SensorReading),
            CharacteristicId::Event => Some(RecordKind::Event),
            _ => None,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CharacteristicId::Pair => "pair",
            CharacteristicId::Unpair => "unpair",
            CharacteristicId::Data => "data",
            CharacteristicId::Event => "event",
            CharacteristicId::EventNotify => "event-notify",
        };
        write!(f, "{} characteristic", name)
    }
}

/// The two kinds of records a device queues for sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Device events (button presses, state changes).
    Event,
    /// Humidity/temperature samples.
    SensorReading,
}

impl RecordKind {
    /// Both record kinds.
    pub const ALL: [RecordKind; 2] = [RecordKind::Event, RecordKind::SensorReading];

    /// Characteristic that serves this kind, one record per read.
    #[must_use]
    pub const fn characteristic(self) -> CharacteristicId {
        match self {
            RecordKind::Event => CharacteristicId::Event,
            RecordKind::SensorReading => CharacteristicId::Data,
        }
    }

    /// Service that owns [`Self::characteristic`].
    #[must_use]
    pub const fn service(self) -> ServiceId {
        self.characteristic().service()
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Event => write!(f, "events"),
            RecordKind::SensorReading => write!(f, "readings"),
        }
    }
}

/// Known event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventType {
    /// Type one.
    One = 1,
    /// Type two.
    Two = 2,
    /// Device state changed.
    Changed = 3,
}

impl TryFrom<i32> for EventType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventType::One),
            2 => Ok(EventType::Two),
            3 => Ok(EventType::Changed),
            other => Err(other),
        }
    }
}

/// An event recorded by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Device-assigned identifier, unique per kind.
    pub record_id: String,
    /// When the event happened.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Raw event type code as sent by the device.
    pub event_type: i32,
}

impl Event {
    /// The event type, if the code is one this client knows.
    #[must_use]
    pub fn kind(&self) -> Option<EventType> {
        EventType::try_from(self.event_type).ok()
    }
}

/// A humidity/temperature sample recorded by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Device-assigned identifier, unique per kind.
    pub record_id: String,
    /// When the sample was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Relative humidity in percent.
    pub humidity: f32,
    /// Temperature in degrees Celsius.
    pub temperature: f32,
}

/// A decoded record of either kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// An event.
    Event(Event),
    /// A sensor reading.
    SensorReading(SensorReading),
}

impl Record {
    /// Which kind of record this is.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Event(_) => RecordKind::Event,
            Record::SensorReading(_) => RecordKind::SensorReading,
        }
    }

    /// The device-assigned record identifier.
    #[must_use]
    pub fn record_id(&self) -> &str {
        match self {
            Record::Event(e) => &e.record_id,
            Record::SensorReading(r) => &r.record_id,
        }
    }

    /// The normalized timestamp.
    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            Record::Event(e) => e.timestamp,
            Record::SensorReading(r) => r.timestamp,
        }
    }
}

impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Record::Event(event)
    }
}

impl From<SensorReading> for Record {
    fn from(reading: SensorReading) -> Self {
        Record::SensorReading(reading)
    }
}
