//! Frame serialization.
//!
//! CBOR (via ciborium) is the binary encoding used by the socket transports;
//! JSON is available for text-oriented media.

use crate::error::CodecError;
use crate::frame::Frame;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FrameEncoding {
    /// Binary CBOR.
    #[default]
    Cbor,
    /// UTF-8 JSON text.
    Json,
}

impl FrameEncoding {
    /// Whether the encoding produces opaque binary payloads.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::Cbor)
    }

    /// Encode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized.
    pub fn encode_frame(self, frame: &Frame) -> Result<Bytes, CodecError> {
        match self {
            Self::Cbor => encode(frame),
            Self::Json => serde_json::to_vec(frame)
                .map(Bytes::from)
                .map_err(|e| CodecError::SerializationFailed(e.to_string())),
        }
    }

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a valid frame.
    pub fn decode_frame(self, data: &[u8]) -> Result<Frame, CodecError> {
        match self {
            Self::Cbor => decode(data),
            Self::Json => serde_json::from_slice(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
        }
    }
}

/// Encode a value into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(msg, &mut vec)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a value.
///
/// # Errors
///
/// Returns an error if the data is invalid or cannot be deserialized.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(data).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, Value};
    use uuid::Uuid;

    fn sample_frame() -> Frame {
        Frame::multi(
            42,
            Value::Map(vec![(
                Value::Text("name".to_string()),
                Value::Text("test".to_string()),
            )]),
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_cbor_frame() {
        let frame = sample_frame();
        let encoded = FrameEncoding::Cbor.encode_frame(&frame).unwrap();
        let decoded = FrameEncoding::Cbor.decode_frame(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_json_wire_shape() {
        let frame = Frame::send(9, Value::Text("hello".to_string()), Uuid::nil());
        let encoded = FrameEncoding::Json.encode_frame(&frame).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["t"], 1);
        assert_eq!(json["c"], 9);
        assert_eq!(json["p"], "hello");
        assert_eq!(json["s"], Uuid::nil().to_string());

        let decoded = FrameEncoding::Json.decode_frame(&encoded).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Send);
        assert_eq!(decoded.payload, Value::Text("hello".to_string()));
    }

    #[test]
    fn test_decode_error() {
        let bad_data = vec![0xFF, 0xFF, 0xFF];
        assert!(FrameEncoding::Cbor.decode_frame(&bad_data).is_err());
        assert!(FrameEncoding::Json.decode_frame(&bad_data).is_err());
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let json = br#"{"t":9,"c":1,"p":null,"s":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(FrameEncoding::Json.decode_frame(json).is_err());
    }
}
