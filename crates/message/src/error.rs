//! Error types for message connections.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_transport::{CodecError, TransportError};
use thiserror::Error;

/// Result type alias for message connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An expected, application-declared failure.
///
/// Anomalies cross the wire with their structured `info` intact and are
/// re-raised as [`Error::Anomaly`] on the requesting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Human-readable message.
    pub message: String,
    /// Structured auxiliary information.
    pub info: serde_json::Value,
}

impl Anomaly {
    /// Create an anomaly without auxiliary info.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            info: serde_json::Value::Null,
        }
    }

    /// Create an anomaly carrying structured info.
    pub fn with_info(message: impl Into<String>, info: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            info,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Anomaly {}

/// Errors surfaced to the caller of a request.
#[derive(Debug, Error)]
pub enum Error {
    /// The responder's handler declared an anomaly.
    #[error("Anomaly: {0}")]
    Anomaly(Anomaly),

    /// The responder's handler failed; only the message crosses the wire.
    #[error("{message}")]
    Remote {
        /// Failure message reported by the responder.
        message: String,
    },

    /// No frame arrived before the response deadline.
    #[error("Deadline exceeded: no response within {0:?}")]
    Timeout(Duration),

    /// The transport failed or was closed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be converted to or from its wire value.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A multi-value response ended without producing any value.
    #[error("Response stream ended without a value")]
    EmptyResponse,

    /// The response queue was dropped before a terminal frame arrived.
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<ciborium::value::Error> for Error {
    fn from(err: ciborium::value::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// A failure raised by a receive handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Expected failure, sent back as an anomaly frame.
    #[error("{0}")]
    Anomaly(Anomaly),

    /// Any other failure, sent back as an error frame.
    #[error("{0}")]
    Failure(String),
}

impl HandlerError {
    /// Create a generic failure from anything displayable.
    pub fn failure(message: impl fmt::Display) -> Self {
        Self::Failure(message.to_string())
    }
}

impl From<Anomaly> for HandlerError {
    fn from(anomaly: Anomaly) -> Self {
        Self::Anomaly(anomaly)
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Anomaly(anomaly) => Self::Anomaly(anomaly),
            other => Self::Failure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_message_only() {
        let err = Error::Remote {
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_handler_error_from_request_error() {
        let anomaly = Anomaly::with_info("nope", serde_json::json!({ "code": 7 }));
        let err: HandlerError = Error::Anomaly(anomaly.clone()).into();
        assert_eq!(err, HandlerError::Anomaly(anomaly));

        let err: HandlerError = Error::Timeout(Duration::from_millis(10)).into();
        assert!(matches!(err, HandlerError::Failure(msg) if msg.contains("Deadline exceeded")));
    }

    #[test]
    fn test_closed_by_server_passes_through() {
        let err: Error = TransportError::ClosedByServer {
            reason: "unsupported path: /x".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Socket closed by server (unsupported path: /x)");
    }
}
