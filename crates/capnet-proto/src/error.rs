//! Error types for the capnet-proto crate.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Payload could not be decoded into a known message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Message decoded but carries out-of-range values.
    #[error("validation error: {0}")]
    Validation(String),
}

impl ProtoError {
    /// Returns true if the receiving party should drop the message and keep waiting.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Validation(_))
    }
}
