//! # Revision Cache Configuration Constants
//!
//! This module centralizes the numeric configuration of the revision cache.
//! Constants that depend on each other are co-located and their relationships
//! are enforced with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! MIN_CHUNK_SIZE (64 bytes)
//!       │
//!       ├─> DEFAULT_CHUNK_SIZE (must be >=, and <= MAX_CHUNK_SIZE)
//!       │
//!       └─> MIN_BUDGET_FLOOR (must hold at least one default chunk)
//!
//! MAX_CHUNK_SIZE (1 GiB)
//!       │
//!       └─> Chunk offsets are stored as usize, but positions are
//!           handed to callers that persist them next to index entries,
//!           so a single chunk must stay addressable with 32 bits.
//!
//! DEFAULT_MAX_CHUNK_ROLLOVERS (4)
//!       │
//!       └─> Bounds the "chunk full, order another one" loop inside
//!           ReadCache::insert_and_lease. Must be >= 1.
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{DEFAULT_CHUNK_SIZE, MIN_BUDGET_FLOOR};
//! ```

// ============================================================================
// CHUNK SIZING
// ============================================================================

/// Smallest chunk a collection may be configured with.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Default chunk capacity for a collection's read cache (64KB).
/// Large enough to hold dozens of typical document revisions while keeping
/// the granularity of eviction small.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk the allocator will manufacture (1GB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 1024;

/// Alignment of chunk buffers. Revisions are byte-addressed, the alignment only
/// keeps the buffer start friendly to memcpy.
pub const CHUNK_ALIGN: usize = 16;

const _: () = assert!(
    MIN_CHUNK_SIZE <= DEFAULT_CHUNK_SIZE && DEFAULT_CHUNK_SIZE <= MAX_CHUNK_SIZE,
    "DEFAULT_CHUNK_SIZE must lie within [MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]"
);

const _: () = assert!(
    MAX_CHUNK_SIZE <= u32::MAX as usize,
    "chunk offsets must fit in 32 bits"
);

const _: () = assert!(CHUNK_ALIGN.is_power_of_two(), "CHUNK_ALIGN must be a power of two");

// ============================================================================
// RECYCLING
// ============================================================================

/// Maximum number of recycled chunks kept per size class.
/// Surplus chunks are freed immediately instead of being parked.
pub const FREE_LIST_LIMIT: usize = 16;

/// Number of rollovers `insert_and_lease` attempts before reporting
/// resource exhaustion.
pub const DEFAULT_MAX_CHUNK_ROLLOVERS: usize = 4;

const _: () = assert!(
    DEFAULT_MAX_CHUNK_ROLLOVERS >= 1,
    "insert_and_lease needs at least one attempt"
);

// ============================================================================
// MEMORY BUDGET
// ============================================================================

/// Default memory budget as percentage of system RAM.
pub const DEFAULT_BUDGET_PERCENT: usize = 10;

/// Minimum memory budget floor in bytes (64KB).
pub const MIN_BUDGET_FLOOR: usize = 64 * 1024;

const _: () = assert!(
    MIN_BUDGET_FLOOR >= DEFAULT_CHUNK_SIZE,
    "MIN_BUDGET_FLOOR must hold at least one default-sized chunk"
);
