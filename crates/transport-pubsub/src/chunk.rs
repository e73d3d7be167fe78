//! Fragmentation of oversized frames and their reassembly on arrival.
//!
//! Wire shape of one fragment:
//!
//! ```text
//! [CHUNK_PREFIX][16-byte group id][index: u8][count: u8][body...]
//! ```
//!
//! The group id is independent of the frame's correlation id, so two large
//! frames in flight at the same time never share a reassembly buffer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ChunkError;

/// Marker that starts every fragment.
pub const CHUNK_PREFIX: &[u8] = b"@tether/message/chunk";

/// Bytes taken by the fragment header.
pub const HEADER_LEN: usize = CHUNK_PREFIX.len() + 16 + 1 + 1;

/// Largest number of fragments a single frame may be split into.
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// Whether `data` starts with the fragment marker.
#[must_use]
pub fn is_chunk(data: &[u8]) -> bool {
    data.starts_with(CHUNK_PREFIX)
}

/// Parsed fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Fragment group this piece belongs to.
    pub group: Uuid,
    /// Position of this piece.
    pub index: u8,
    /// Total pieces in the group.
    pub count: u8,
}

impl ChunkHeader {
    /// Parse the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Malformed`] if the marker is missing, the header
    /// is truncated, or the index is out of range.
    pub fn parse(data: &[u8]) -> Result<Self, ChunkError> {
        if data.len() < HEADER_LEN {
            return Err(ChunkError::Malformed(format!(
                "{} bytes is shorter than the {HEADER_LEN} byte header",
                data.len()
            )));
        }
        if !is_chunk(data) {
            return Err(ChunkError::Malformed("missing chunk prefix".to_string()));
        }

        let offset = CHUNK_PREFIX.len();
        let group = Uuid::from_slice(&data[offset..offset + 16])
            .map_err(|e| ChunkError::Malformed(e.to_string()))?;
        let index = data[offset + 16];
        let count = data[offset + 17];

        if count == 0 || index >= count {
            return Err(ChunkError::Malformed(format!(
                "index {index} out of range for {count} chunks"
            )));
        }

        Ok(Self {
            group,
            index,
            count,
        })
    }
}

/// Split `data` into fragments no larger than `max_payload` each.
///
/// # Errors
///
/// Returns an error if `max_payload` cannot hold a header plus at least one
/// body byte, or if more than [`MAX_CHUNKS`] fragments would be needed.
pub fn split(data: &[u8], max_payload: usize) -> Result<Vec<Bytes>, ChunkError> {
    if max_payload <= HEADER_LEN {
        return Err(ChunkError::PayloadTooSmall {
            max_payload,
            header_len: HEADER_LEN,
        });
    }

    let body_len = max_payload - HEADER_LEN;
    let count = data.len().div_ceil(body_len);
    let count_byte = u8::try_from(count).map_err(|_| ChunkError::TooManyChunks {
        size: data.len(),
        count,
    })?;

    let group = Uuid::new_v4();
    data.chunks(body_len)
        .enumerate()
        .map(|(index, body)| {
            let index = u8::try_from(index).map_err(|_| ChunkError::TooManyChunks {
                size: data.len(),
                count,
            })?;
            let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
            buf.put_slice(CHUNK_PREFIX);
            buf.put_slice(group.as_bytes());
            buf.put_u8(index);
            buf.put_u8(count_byte);
            buf.put_slice(body);
            Ok(buf.freeze())
        })
        .collect()
}

#[derive(Debug)]
struct PartialGroup {
    parts: Vec<Option<Bytes>>,
    filled: usize,
    started: Instant,
}

/// Buffers fragments by group until every index has arrived.
#[derive(Debug)]
pub struct ChunkAssembler {
    ttl: Duration,
    groups: HashMap<Uuid, PartialGroup>,
}

impl ChunkAssembler {
    /// Create an assembler that drops incomplete groups older than `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            groups: HashMap::new(),
        }
    }

    /// Number of groups still waiting for fragments.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Accept one fragment, returning the reassembled bytes once the group
    /// is complete.
    ///
    /// A repeated index overwrites the earlier body.
    ///
    /// # Errors
    ///
    /// Returns an error if the fragment is malformed or disagrees with the
    /// count declared by earlier fragments of its group.
    pub fn accept(&mut self, data: &Bytes) -> Result<Option<Bytes>, ChunkError> {
        self.sweep();

        let header = ChunkHeader::parse(data)?;
        let count = usize::from(header.count);

        let group = self
            .groups
            .entry(header.group)
            .or_insert_with(|| PartialGroup {
                parts: vec![None; count],
                filled: 0,
                started: Instant::now(),
            });

        if group.parts.len() != count {
            return Err(ChunkError::InconsistentTotal {
                expected: group.parts.len(),
                actual: count,
            });
        }

        let slot = &mut group.parts[usize::from(header.index)];
        if slot.is_none() {
            group.filled += 1;
        }
        *slot = Some(data.slice(HEADER_LEN..));

        if group.filled < count {
            return Ok(None);
        }

        let Some(group) = self.groups.remove(&header.group) else {
            return Ok(None);
        };
        let size = group.parts.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for part in group.parts.iter().flatten() {
            buf.put_slice(part);
        }
        debug!(
            "Reassembled {} bytes from {} chunks (group {})",
            size, count, header.group
        );
        Ok(Some(buf.freeze()))
    }

    /// Drop groups that have been waiting longer than the TTL.
    pub fn sweep(&mut self) {
        let ttl = self.ttl;
        self.groups.retain(|group_id, group| {
            let alive = group.started.elapsed() < ttl;
            if !alive {
                warn!(
                    "Dropping incomplete chunk group {} ({}/{} received)",
                    group_id,
                    group.filled,
                    group.parts.len()
                );
            }
            alive
        });
    }
}
