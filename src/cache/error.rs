use thiserror::Error;

use super::ChunkId;

/// Failures surfaced by the read cache.
///
/// A full chunk is not an error here: `Chunk::reserve` returns `None` and the
/// read cache rolls over to a fresh chunk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The allocator could not produce a chunk: the budget is exhausted and
    /// every retired chunk is still leased, the request exceeds the budget,
    /// or the system allocator failed. Callers may retry later.
    #[error("revision cache exhausted: cannot provide {requested} bytes ({reason})")]
    ResourceExhausted {
        requested: usize,
        reason: &'static str,
    },

    /// The position was minted under an older incarnation of the chunk, or
    /// the chunk was discarded or freed (`found: None`). Re-fetch from the
    /// authoritative store.
    #[error("stale read cache position in chunk {chunk}: minted at version {expected}, chunk is at {found:?}")]
    StaleReference {
        chunk: ChunkId,
        expected: u64,
        found: Option<u64>,
    },

    /// The version matches but no well-formed record starts at the offset.
    #[error("no revision at offset {offset} of chunk {chunk}")]
    InvalidPosition { chunk: ChunkId, offset: usize },
}

impl CacheError {
    pub fn is_stale(&self) -> bool {
        matches!(self, CacheError::StaleReference { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, CacheError::ResourceExhausted { .. })
    }
}
