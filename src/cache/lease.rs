//! # Positions and Leases
//!
//! `ReadCachePosition` is what callers store next to their own metadata. It
//! holds only a `Weak` chunk handle, so it never keeps memory alive.
//!
//! `Protector` is the scoped read handle. It owns exactly one increment of the
//! chunk's reference count and gives it back on drop, on every exit path.
//!
//! ```text
//! let protector = position.lease()?;   // refs += 1, version checked
//! parse(protector.body());             // zero-copy view into the chunk
//! drop(protector);                     // refs -= 1 (maybe hands chunk back)
//! ```

use std::sync::{Arc, Weak};

use super::chunk::Chunk;
use super::{CacheError, ChunkId};
use crate::revision::body_of;

/// Weak locator of a cached revision: chunk, offset, and the chunk version the
/// revision was written under.
#[derive(Clone)]
pub struct ReadCachePosition {
    chunk: Weak<Chunk>,
    chunk_id: ChunkId,
    offset: usize,
    version: u64,
}

impl ReadCachePosition {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Leases the revision this position points at.
    pub fn lease(&self) -> Result<Protector, CacheError> {
        Protector::lease(self)
    }
}

impl std::fmt::Debug for ReadCachePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCachePosition")
            .field("chunk", &self.chunk_id)
            .field("offset", &self.offset)
            .field("version", &self.version)
            .finish()
    }
}

impl PartialEq for ReadCachePosition {
    fn eq(&self, other: &Self) -> bool {
        self.chunk_id == other.chunk_id
            && self.offset == other.offset
            && self.version == other.version
    }
}

impl Eq for ReadCachePosition {}

pub struct Protector {
    chunk: Arc<Chunk>,
    offset: usize,
    len: usize,
    version: u64,
}

impl Protector {
    fn lease(position: &ReadCachePosition) -> Result<Self, CacheError> {
        let stale = |found| CacheError::StaleReference {
            chunk: position.chunk_id,
            expected: position.version,
            found,
        };

        let chunk = position.chunk.upgrade().ok_or_else(|| stale(None))?;
        // A discarded chunk reports `found: None`, like a freed one.
        chunk.try_acquire(position.version).map_err(stale)?;

        // From here on the chunk cannot be recycled until `protector` drops.
        let mut protector = Self {
            chunk,
            offset: position.offset,
            len: 0,
            version: position.version,
        };

        // SAFETY: the version matched while we hold a reference, so the record
        // at `offset` is the one written when the position was minted.
        protector.len = unsafe { protector.chunk.record_len(position.offset) }.ok_or(
            CacheError::InvalidPosition {
                chunk: position.chunk_id,
                offset: position.offset,
            },
        )?;
        Ok(protector)
    }

    /// Wraps a freshly reserved range. The caller has already added the
    /// reference this protector will release, and must finish writing the
    /// range before exposing the data.
    pub(crate) fn reserved(chunk: Arc<Chunk>, offset: usize, len: usize) -> Self {
        let version = chunk.version();
        Self {
            chunk,
            offset,
            len,
            version,
        }
    }

    pub(crate) fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Framed length of the leased revision.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The framed revision bytes, prefix included.
    pub fn data(&self) -> &[u8] {
        // SAFETY: we hold a reference, so the chunk is neither freed nor
        // recycled, and the record was completely written before this
        // protector was handed out.
        unsafe { self.chunk.slice(self.offset, self.len) }
    }

    /// The revision body without its length prefix.
    pub fn body(&self) -> &[u8] {
        body_of(self.data())
    }

    /// A position that can be stored and leased again later.
    pub fn position(&self) -> ReadCachePosition {
        ReadCachePosition {
            chunk: Arc::downgrade(&self.chunk),
            chunk_id: self.chunk.id(),
            offset: self.offset,
            version: self.version,
        }
    }
}

impl AsRef<[u8]> for Protector {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Clone for Protector {
    fn clone(&self) -> Self {
        // Our own reference keeps the chunk from being recycled meanwhile.
        self.chunk.acquire_reference();
        Self {
            chunk: Arc::clone(&self.chunk),
            offset: self.offset,
            len: self.len,
            version: self.version,
        }
    }
}

impl std::fmt::Debug for Protector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protector")
            .field("chunk", &self.chunk.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("version", &self.version)
            .finish()
    }
}

impl Drop for Protector {
    fn drop(&mut self) {
        self.chunk.release_reference();
    }
}
