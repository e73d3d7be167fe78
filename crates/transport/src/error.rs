//! Error types for transports.

use std::io;

use thiserror::Error;

/// Errors raised by a transport while sending, connecting, or closing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the socket, typically before any protocol traffic
    /// (e.g. an unsupported path was requested).
    #[error("Socket closed by server ({reason})")]
    ClosedByServer {
        /// Close reason reported by the peer.
        reason: String,
    },

    /// Failed to establish the underlying connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The target address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No publish subject could be determined for a frame.
    #[error("Could not get subject for frame with correlation id {0}")]
    NoSubject(u64),

    /// The encoded frame does not fit the medium.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Size of the encoded frame.
        size: usize,
        /// Maximum accepted by the medium.
        max: usize,
    },

    /// Frame encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Anything else reported by the medium.
    #[error("{0}")]
    Other(String),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
