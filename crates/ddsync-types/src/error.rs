//! Error types for record decoding in ddsync-types.

use thiserror::Error;

/// Errors that can occur when decoding a record envelope read from a device.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in ddsync-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Payload was not valid UTF-8.
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Payload was not a well-formed envelope (truncated, missing fields, wrong types).
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp could not be normalized.
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp {
        /// The raw timestamp as received.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl DecodeError {
    /// Create an invalid timestamp error.
    pub fn invalid_timestamp(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using ddsync-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
