//! Error types for chunked pub/sub delivery.

use tether_transport::TransportError;
use thiserror::Error;

/// Errors raised while fragmenting or reassembling a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The frame needs more fragments than the one-byte count can express.
    #[error("Frame of {size} bytes needs {count} chunks (max 255)")]
    TooManyChunks {
        /// Encoded frame size.
        size: usize,
        /// Fragments that would be needed.
        count: usize,
    },

    /// The medium's max payload cannot even hold a chunk header.
    #[error("Max payload {max_payload} is too small for a chunk header of {header_len} bytes")]
    PayloadTooSmall {
        /// Max payload of the medium.
        max_payload: usize,
        /// Size of the chunk header.
        header_len: usize,
    },

    /// A fragment could not be parsed.
    #[error("Malformed chunk: {0}")]
    Malformed(String),

    /// Fragments of one group disagree on the total count.
    #[error("Chunk group declared {expected} chunks, fragment declares {actual}")]
    InconsistentTotal {
        /// Count declared by the first fragment seen.
        expected: usize,
        /// Count declared by this fragment.
        actual: usize,
    },
}

impl From<ChunkError> for TransportError {
    fn from(err: ChunkError) -> Self {
        Self::Other(err.to_string())
    }
}
