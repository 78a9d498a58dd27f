//! Error types for ddsync-core.
//!
//! Most failures in the sync engine never reach the caller as an `Err`. The
//! transport reports connect, read and disconnect failures as events, the
//! manager logs them and aborts the affected batch, and the next trigger
//! starts over from scratch. The errors below cover the remaining cases:
//! commands that could not be issued, missing hardware and bad
//! configuration.
//!
//! ## Failure handling at a glance
//!
//! | Failure | Surfaced as | Effect |
//! |---------|-------------|--------|
//! | Connect failure | `TransportEvent::ConnectFailed` | Logged, retried on next advertisement |
//! | Disconnect with error | `TransportEvent::Disconnected` | Both batches discarded |
//! | Read failure | `TransportEvent::ReadFailed` | Batch discarded |
//! | Malformed record | [`ddsync_types::DecodeError`] | Batch discarded, link kept |
//! | Sync while not ready / in progress | `SessionStep::Rejected` | Silently ignored |
//! | Command could not be issued | [`Error`] | Logged, batch discarded |

use thiserror::Error;

use ddsync_types::{CharacteristicId, DecodeError, PeripheralHandle, ServiceId};

/// Errors that can occur in the sync engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The transport has no peripheral with this handle.
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralHandle),

    /// A required characteristic was not exposed by the peripheral.
    #[error("{characteristic} not found on peripheral {handle}")]
    CharacteristicNotFound {
        /// The peripheral that was searched.
        handle: PeripheralHandle,
        /// The characteristic that was missing.
        characteristic: CharacteristicId,
    },

    /// A required service was not exposed by the peripheral.
    #[error("{service} not found on peripheral {handle}")]
    ServiceNotFound {
        /// The peripheral that was searched.
        handle: PeripheralHandle,
        /// The service that was missing.
        service: ServiceId,
    },

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// The sync client actor is no longer running.
    #[error("Sync client channel closed")]
    ChannelClosed,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record envelope could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    /// Create an unknown peripheral error.
    pub fn unknown_peripheral(handle: &PeripheralHandle) -> Self {
        Self::UnknownPeripheral(handle.clone())
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Self {
        Self::CharacteristicNotFound {
            handle: handle.clone(),
            characteristic,
        }
    }

    /// Create a service not found error.
    pub fn service_not_found(handle: &PeripheralHandle, service: ServiceId) -> Self {
        Self::ServiceNotFound {
            handle: handle.clone(),
            service,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using ddsync-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let handle = PeripheralHandle::from("AA:BB:CC:DD:EE:FF");

        let err = Error::unknown_peripheral(&handle);
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = Error::characteristic_not_found(&handle, CharacteristicId::Data);
        assert_eq!(
            err.to_string(),
            "data characteristic not found on peripheral AA:BB:CC:DD:EE:FF"
        );

        let err = Error::service_not_found(&handle, ServiceId::EventNotify);
        assert!(err.to_string().starts_with("event-notify service"));

        let err = Error::NoAdapter;
        assert_eq!(err.to_string(), "No Bluetooth adapter available");
    }

    #[test]
    fn test_invalid_config() {
        let err = Error::invalid_config("read timeout must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: read timeout must be positive"
        );
    }

    #[test]
    fn test_decode_error_conversion() {
        let decode_err = DecodeError::invalid_timestamp("x", "bad");
        let err: Error = decode_err.into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("Invalid timestamp"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
