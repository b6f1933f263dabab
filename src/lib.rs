//! # revcache - Chunked Revision Cache
//!
//! revcache is the in-memory read cache of a multi-version document store.
//! Serialized document revisions are appended into shared fixed-capacity
//! arenas ("chunks") and read back in place through scoped leases. It
//! prioritizes:
//!
//! - **Zero-copy reads**: a lease is a slice into the chunk, nothing is copied
//! - **Short critical sections**: writers hold a mutex only to claim an offset
//! - **Safe reuse**: stale positions are detected by version, never misread
//!
//! ## Quick Start
//!
//! ```ignore
//! use revcache::{CacheConfig, CollectionId, RevisionBytes};
//!
//! let config = CacheConfig::builder()
//!     .chunk_size(64 * 1024)
//!     .memory_budget(256 * 1024 * 1024)
//!     .build()?;
//!
//! let allocator = config.allocator();
//! let users = allocator.read_cache(CollectionId::new(1), &config);
//!
//! let position = users
//!     .insert_and_lease(&RevisionBytes::encode(b"{\"name\":\"alice\"}"))?
//!     .position();
//!
//! match users.read_and_lease(&position) {
//!     Ok(lease) => parse(lease.body()),
//!     Err(e) if e.is_stale() => refetch_from_storage(),
//!     Err(e) => return Err(e.into()),
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  ReadCache (one per collection)      │
//! │  insert_and_lease / read_and_lease   │
//! ├─────────────────────────────────────┤
//! │  Protector / ReadCachePosition       │
//! ├─────────────────────────────────────┤
//! │  ChunkAllocator (shared, injected)   │
//! │  reuse, eviction, deferred release   │
//! ├─────────────────────────────────────┤
//! │  Chunk (atomic cursor, refs, version)│
//! ├─────────────────────────────────────┤
//! │  MemoryBudget (global byte limit)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! The cache is a volatile accelerator, never the source of truth. A
//! `StaleReference` tells the caller to fall back to the authoritative store.
//!
//! ## Module Overview
//!
//! - [`cache`]: chunks, leases, the per-collection read cache and the allocator
//! - [`config`]: constants and the `CacheConfig` builder
//! - [`memory`]: the global memory budget
//! - [`revision`]: length-prefixed revision framing
//! - [`encoding`]: the varint codec behind the framing

pub mod cache;
pub mod config;
pub mod encoding;
pub mod memory;
pub mod revision;

pub use cache::{
    AllocatorStats, CacheError, Chunk, ChunkAllocator, ChunkId, CollectionId, OpenChunk,
    Protector, ReadCache, ReadCachePosition,
};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use memory::MemoryBudget;
pub use revision::RevisionBytes;
