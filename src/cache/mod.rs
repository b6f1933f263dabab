//! # Chunked Revision Cache
//!
//! This module implements the in-memory revision cache: serialized document
//! revisions are appended into shared, fixed-capacity byte arenas ("chunks"),
//! and readers access them in place through scoped leases.
//!
//! ## Components
//!
//! ```text
//! ReadCache (one per collection)
//! ├── Mutex<Option<OpenChunk>>    the single chunk open for writing
//! └── ChunkAllocator (shared by all collections)
//!     ├── tagged chunks           open / retired, grouped by collection
//!     ├── retired queue           eviction order, oldest first
//!     ├── free lists              recycled chunks bucketed by size class
//!     └── pending                 discarded chunks still under lease
//! ```
//!
//! ## Write Path
//!
//! 1. Under the collection mutex: reserve `len` bytes in the open chunk with
//!    an atomic cursor bump (O(1), no copying)
//! 2. Outside the mutex: copy the revision into the reserved range
//! 3. Hand back a [`Protector`] whose [`ReadCachePosition`] can be stored
//!
//! When the open chunk is full, it is retired to the allocator ("used") and a
//! new one is ordered by a single writer while the others wait. The allocator
//! is never called with a collection mutex held.
//!
//! ## Read Path
//!
//! A [`ReadCachePosition`] is a weak `(chunk, offset, version)` locator. Leasing
//! it bumps the chunk's reference count, then checks the version. A mismatch
//! means the chunk has been recycled since the position was minted and the
//! lease fails with [`CacheError::StaleReference`]; it never hands out a pointer
//! into recycled memory.
//!
//! ## Reclamation
//!
//! ```text
//! ordered ──> open ──(full)──> retired ──(evicted, R = 0)──> recycled ──> reused
//!               │                 │
//!               │(forced close)   │(collection removed)
//!               v                 v
//!           discarded ──(R = 0)──> recycled
//! ```
//!
//! A chunk is recycled only when its reference count is zero. Recycling bumps
//! the version and resets the cursor, invalidating every position minted under
//! the previous version. A discarded chunk that is still leased is parked as
//! pending; whichever lease drops the last reference hands it back. Pending
//! chunks accept no new leases, so they only drain.
//!
//! ## Thread Safety
//!
//! - Reference counts, versions and cursors are atomics; leasing never blocks
//! - `ReadCache` uses a `parking_lot::Mutex` and `Condvar` for the open-chunk
//!   slot only
//! - `ChunkAllocator` uses one `parking_lot::Mutex` for its registry

mod allocator;
mod chunk;
mod error;
mod lease;
mod read_cache;
mod stats;

pub use allocator::ChunkAllocator;
pub use chunk::{Chunk, OpenChunk};
pub use error::CacheError;
pub use lease::{Protector, ReadCachePosition};
pub use read_cache::ReadCache;
pub use stats::AllocatorStats;

/// Identifies the collection a read cache belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(u64);

impl CollectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Process-unique identity of a chunk's memory. Survives recycling; the
/// version tells incarnations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u64);

impl ChunkId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "k{}", self.0)
    }
}
