//! # Cache Configuration Builder
//!
//! `CacheConfigBuilder` collects the runtime settings of the revision cache
//! and validates them once, in `build()`.
//!
//! ## Configuration Options
//!
//! | Option         | Default              | Description                                |
//! |----------------|----------------------|--------------------------------------------|
//! | chunk_size     | 64KB                 | Preferred capacity of a collection's chunk |
//! | memory_budget  | 10% of RAM (64KB+)   | Global byte budget for all chunks          |
//! | max_rollovers  | 4                    | Chunk rollovers per insert before failing  |
//!
//! ## Usage
//!
//! ```ignore
//! let config = CacheConfig::builder()
//!     .chunk_size(16 * 1024)
//!     .memory_budget(8 * 1024 * 1024)
//!     .build()?;
//!
//! let allocator = config.allocator();
//! let cache = allocator.read_cache(CollectionId::new(7), &config);
//! ```

use std::sync::Arc;

use eyre::{ensure, Result};

use super::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNK_ROLLOVERS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::cache::ChunkAllocator;
use crate::memory::MemoryBudget;

/// Validated settings shared by the allocator and every collection cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    chunk_size: usize,
    memory_budget: Option<usize>,
    max_rollovers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_budget: None,
            max_rollovers: DEFAULT_MAX_CHUNK_ROLLOVERS,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Explicit budget in bytes, `None` when the budget is auto-detected.
    pub fn memory_budget(&self) -> Option<usize> {
        self.memory_budget
    }

    pub fn max_rollovers(&self) -> usize {
        self.max_rollovers
    }

    /// Creates the budget described by this configuration.
    pub fn budget(&self) -> Arc<MemoryBudget> {
        let budget = match self.memory_budget {
            Some(limit) => MemoryBudget::with_limit(limit),
            None => MemoryBudget::auto_detect(),
        };
        Arc::new(budget)
    }

    /// Creates a fresh allocator charged against this configuration's budget.
    pub fn allocator(&self) -> ChunkAllocator {
        ChunkAllocator::new(self.budget())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    chunk_size: Option<usize>,
    memory_budget: Option<usize>,
    max_rollovers: Option<usize>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferred capacity, in bytes, of the chunks a collection writes into.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    /// Global budget, in bytes, for all chunks of all collections.
    ///
    /// Values below `MIN_BUDGET_FLOOR` are raised to the floor.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Number of chunk rollovers a single insert may trigger before it gives
    /// up with `ResourceExhausted`.
    pub fn max_rollovers(mut self, attempts: usize) -> Self {
        self.max_rollovers = Some(attempts);
        self
    }

    pub fn build(self) -> Result<CacheConfig> {
        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        ensure!(
            (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size),
            "chunk size {} must lie within [{}, {}]",
            chunk_size,
            MIN_CHUNK_SIZE,
            MAX_CHUNK_SIZE
        );

        let max_rollovers = self.max_rollovers.unwrap_or(DEFAULT_MAX_CHUNK_ROLLOVERS);
        ensure!(max_rollovers >= 1, "max_rollovers must be at least 1");

        Ok(CacheConfig {
            chunk_size,
            memory_budget: self.memory_budget,
            max_rollovers,
        })
    }
}
