//! The radio boundary consumed by the connection manager.
//!
//! A [`Transport`] accepts commands and never blocks on them: every command
//! only requests an operation, and the outcome comes back later as a
//! [`TransportEvent`]. A command returns `Err` only when the request could
//! not be issued at all (unknown handle, adapter gone).
//!
//! The real implementation lives in [`crate::ble`]; tests use
//! [`crate::mock::MockTransport`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ddsync_types::{CharacteristicId, PeripheralHandle};

use crate::error::Result;

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    /// State not yet known.
    Unknown,
    /// Radio is resetting.
    Resetting,
    /// No BLE support on this host.
    Unsupported,
    /// The process may not use the radio.
    Unauthorized,
    /// Radio is off.
    PoweredOff,
    /// Radio is on and may scan.
    PoweredOn,
}

impl RadioState {
    /// Whether scanning is possible in this state.
    #[must_use]
    pub fn can_scan(self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

/// Outcome of an earlier [`Transport`] command or an unsolicited radio event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The local radio changed power state.
    RadioStateChanged(RadioState),
    /// A peripheral advertised itself.
    Advertisement {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Advertised local name, if any.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// A requested connection was established.
    Connected {
        /// Peripheral handle.
        handle: PeripheralHandle,
    },
    /// A requested connection failed.
    ConnectFailed {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// What went wrong.
        error: String,
    },
    /// The link to a peripheral went down.
    Disconnected {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Set when the link was lost rather than closed on request.
        error: Option<String>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Every service the peripheral reported, known or not.
        services: Vec<Uuid>,
    },
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// The service whose characteristics were discovered.
        service: Uuid,
        /// Every characteristic reported for the service.
        characteristics: Vec<Uuid>,
    },
    /// A characteristic value arrived, either a read response or a push.
    ValueUpdated {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// The characteristic the value belongs to.
        characteristic: Uuid,
        /// Raw value bytes.
        value: Bytes,
    },
    /// A requested read failed.
    ReadFailed {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// The characteristic that was being read.
        characteristic: CharacteristicId,
        /// What went wrong.
        error: String,
    },
}

impl TransportEvent {
    /// The peripheral this event concerns, if any.
    pub fn handle(&self) -> Option<&PeripheralHandle> {
        match self {
            TransportEvent::RadioStateChanged(_) => None,
            TransportEvent::Advertisement { handle, .. }
            | TransportEvent::Connected { handle }
            | TransportEvent::ConnectFailed { handle, .. }
            | TransportEvent::Disconnected { handle, .. }
            | TransportEvent::ServicesDiscovered { handle, .. }
            | TransportEvent::CharacteristicsDiscovered { handle, .. }
            | TransportEvent::ValueUpdated { handle, .. }
            | TransportEvent::ReadFailed { handle, .. } => Some(handle),
        }
    }
}

/// Commands the connection manager issues to the radio.
///
/// Implementations must return immediately; results are reported as
/// [`TransportEvent`]s on whatever channel the implementation was built with.
pub trait Transport: Send {
    /// Begin scanning for advertisements.
    fn start_scan(&mut self) -> Result<()>;

    /// Stop scanning.
    fn stop_scan(&mut self) -> Result<()>;

    /// Request a connection.
    fn connect(&mut self, handle: &PeripheralHandle) -> Result<()>;

    /// Request a disconnection.
    fn disconnect(&mut self, handle: &PeripheralHandle) -> Result<()>;

    /// Request service discovery.
    fn discover_services(&mut self, handle: &PeripheralHandle) -> Result<()>;

    /// Request characteristic discovery for one service.
    fn discover_characteristics(&mut self, handle: &PeripheralHandle, service: Uuid) -> Result<()>;

    /// Request one read of a characteristic.
    fn read_value(&mut self, handle: &PeripheralHandle, characteristic: CharacteristicId)
    -> Result<()>;

    /// Enable or disable notifications on a characteristic.
    fn write_notify_subscription(
        &mut self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<()>;
}
