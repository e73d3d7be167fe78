//! The unit exchanged over a transport.

use crate::error::CodecError;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dynamic payload value carried by a frame.
pub type Value = ciborium::Value;

/// Identifier of the connection instance that emitted a frame.
pub type SourceId = Uuid;

/// Type of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    /// Request (or fire-and-forget message).
    Send = 1,
    /// Single terminal response.
    Response = 2,
    /// One value of a multi-value response.
    Multi = 3,
    /// End of a multi-value response.
    End = 4,
    /// Expected, application-declared failure.
    Anomaly = 5,
    /// Unexpected failure inside the responder's handler.
    Error = 6,
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        frame_type as Self
    }
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(FrameType::Send),
            2 => Ok(FrameType::Response),
            3 => Ok(FrameType::Multi),
            4 => Ok(FrameType::End),
            5 => Ok(FrameType::Anomaly),
            6 => Ok(FrameType::Error),
            _ => Err(CodecError::DeserializationFailed(format!(
                "Unknown frame type: {value:#x}"
            ))),
        }
    }
}

/// A frame on the wire: `{ t, c, p, s }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Type of this frame.
    #[serde(rename = "t")]
    pub frame_type: FrameType,
    /// Correlation id of the request this frame belongs to.
    #[serde(rename = "c")]
    pub correlation_id: u64,
    /// Frame payload.
    #[serde(rename = "p")]
    pub payload: Value,
    /// Connection instance that emitted the frame.
    #[serde(rename = "s")]
    pub source: SourceId,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(
        frame_type: FrameType,
        correlation_id: u64,
        payload: Value,
        source: SourceId,
    ) -> Self {
        Self {
            frame_type,
            correlation_id,
            payload,
            source,
        }
    }

    /// Create a request frame.
    #[must_use]
    pub const fn send(correlation_id: u64, payload: Value, source: SourceId) -> Self {
        Self::new(FrameType::Send, correlation_id, payload, source)
    }

    /// Create a single-response frame.
    #[must_use]
    pub const fn response(correlation_id: u64, payload: Value, source: SourceId) -> Self {
        Self::new(FrameType::Response, correlation_id, payload, source)
    }

    /// Create one value of a multi-value response.
    #[must_use]
    pub const fn multi(correlation_id: u64, payload: Value, source: SourceId) -> Self {
        Self::new(FrameType::Multi, correlation_id, payload, source)
    }

    /// Create the end marker of a multi-value response. Its payload is an
    /// empty map.
    #[must_use]
    pub const fn end(correlation_id: u64, source: SourceId) -> Self {
        Self::new(FrameType::End, correlation_id, Value::Map(Vec::new()), source)
    }

    /// Create an anomaly frame.
    #[must_use]
    pub const fn anomaly(correlation_id: u64, payload: Value, source: SourceId) -> Self {
        Self::new(FrameType::Anomaly, correlation_id, payload, source)
    }

    /// Create an error frame.
    #[must_use]
    pub const fn error(correlation_id: u64, payload: Value, source: SourceId) -> Self {
        Self::new(FrameType::Error, correlation_id, payload, source)
    }

    /// Whether this frame ends the exchange for its correlation id.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::Response | FrameType::End | FrameType::Anomaly | FrameType::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_codes() {
        for code in 1..=6u8 {
            let frame_type = FrameType::try_from(code).unwrap();
            assert_eq!(u8::from(frame_type), code);
        }
        assert!(FrameType::try_from(0).is_err());
        assert!(FrameType::try_from(7).is_err());
    }

    #[test]
    fn test_terminal_frames() {
        let source = Uuid::new_v4();
        assert!(!Frame::send(1, Value::Null, source).is_terminal());
        assert!(!Frame::multi(1, Value::Null, source).is_terminal());
        assert!(Frame::response(1, Value::Null, source).is_terminal());
        assert!(Frame::end(1, source).is_terminal());
        assert!(Frame::anomaly(1, Value::Null, source).is_terminal());
        assert!(Frame::error(1, Value::Null, source).is_terminal());
    }

    #[test]
    fn test_end_payload_is_empty_map() {
        let frame = Frame::end(7, Uuid::new_v4());
        assert_eq!(frame.payload, Value::Map(Vec::new()));
        assert_eq!(frame.frame_type, FrameType::End);
    }
}
