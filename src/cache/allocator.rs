//! # Chunk Allocator
//!
//! Process-wide factory, recycler and evictor of chunks, shared by every
//! collection's `ReadCache`. It is an ordinary value: construct one, clone the
//! handle into each cache. Nothing here is a global.
//!
//! ## Registry
//!
//! ```text
//! AllocatorState
//! ├── tagged:      ChunkId -> (chunk, owner, Open | Retired)
//! ├── collections: CollectionId -> {ChunkId}
//! ├── retired:     VecDeque<ChunkId>          oldest retirement first
//! ├── free:        size class -> [Arc<Chunk>] recycled, owned by nobody
//! └── pending:     ChunkId -> Arc<Chunk>      discarded, still leased
//! ```
//!
//! ## Ordering a Chunk
//!
//! 1. Reuse a recycled chunk from the free lists whose capacity lies within
//!    `[needed, 2 * needed]`
//! 2. Otherwise charge the budget and allocate fresh memory
//! 3. Over budget: free parked chunks that do not fit, then evict the oldest
//!    retired chunk nobody references. A victim that fits is reused directly,
//!    any other victim is freed and the budget retried
//! 4. Nothing left to evict: `ResourceExhausted`
//!
//! Retired chunks under lease are skipped during the scan, never waited on.
//!
//! ## Deferred Release
//!
//! Discarding a chunk (forced close, collection removal) flags it and tries to
//! recycle it immediately. If a lease still holds it, it is parked in
//! `pending`; the lease that drops the last reference calls back into
//! [`ChunkReclaimer::reclaim`]. The flag is set before the recycle attempt, so
//! either the attempt sees zero references or the last releaser sees the flag.
//!
//! There is no deadline on pending chunks: a lease held forever keeps its chunk
//! (and its budget charge) alive forever.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::chunk::{Chunk, ChunkReclaimer, OpenChunk};
use super::read_cache::ReadCache;
use super::stats::AllocatorStats;
use super::{CacheError, ChunkId, CollectionId};
use crate::config::{CacheConfig, FREE_LIST_LIMIT, MAX_CHUNK_SIZE};
use crate::memory::MemoryBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Open,
    Retired,
}

struct Tagged {
    chunk: Arc<Chunk>,
    owner: CollectionId,
    state: ChunkState,
}

#[derive(Default)]
struct AllocatorState {
    tagged: HashMap<ChunkId, Tagged>,
    collections: HashMap<CollectionId, HashSet<ChunkId>>,
    retired: VecDeque<ChunkId>,
    free: BTreeMap<usize, Vec<Arc<Chunk>>>,
    pending: HashMap<ChunkId, Arc<Chunk>>,
}

impl AllocatorState {
    fn tag(&mut self, owner: CollectionId, chunk: Arc<Chunk>) {
        let id = chunk.id();
        self.collections.entry(owner).or_default().insert(id);
        self.tagged.insert(
            id,
            Tagged {
                chunk,
                owner,
                state: ChunkState::Open,
            },
        );
    }

    fn untag(&mut self, id: ChunkId) -> Option<Tagged> {
        let tagged = self.tagged.remove(&id)?;
        if let Some(ids) = self.collections.get_mut(&tagged.owner) {
            ids.remove(&id);
            if ids.is_empty() {
                self.collections.remove(&tagged.owner);
            }
        }
        Some(tagged)
    }

    fn take_free(&mut self, needed: usize) -> Option<Arc<Chunk>> {
        let class = size_class(needed);
        let upper = class.saturating_mul(2);

        for bucket in self.free.range_mut(class..=upper).map(|(_, bucket)| bucket) {
            if let Some(idx) = bucket.iter().position(|c| fits(c.capacity(), needed)) {
                return Some(bucket.swap_remove(idx));
            }
        }
        None
    }

    fn pop_any_free(&mut self) -> Option<Arc<Chunk>> {
        while let Some(mut entry) = self.free.last_entry() {
            let chunk = entry.get_mut().pop();
            if entry.get().is_empty() {
                entry.remove();
            }
            if chunk.is_some() {
                return chunk;
            }
        }
        None
    }

    fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

/// Recycled chunks are bucketed by the next power of two of their capacity.
fn size_class(capacity: usize) -> usize {
    capacity.max(1).next_power_of_two()
}

fn fits(capacity: usize, needed: usize) -> bool {
    capacity >= needed && capacity <= needed.saturating_mul(2)
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    evicted: AtomicU64,
    freed: AtomicU64,
    deferred: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct AllocatorShared {
    state: Mutex<AllocatorState>,
    budget: Arc<MemoryBudget>,
    next_chunk_id: AtomicU64,
    counters: Counters,
    self_ref: Weak<AllocatorShared>,
}

impl AllocatorShared {
    fn exhausted(&self, requested: usize, reason: &'static str) -> CacheError {
        tracing::warn!(
            requested,
            budget = %self.budget.stats(),
            reason,
            "revision cache cannot provide a chunk"
        );
        CacheError::ResourceExhausted { requested, reason }
    }

    fn manufacture(
        &self,
        state: &mut AllocatorState,
        capacity: usize,
    ) -> Result<Arc<Chunk>, CacheError> {
        loop {
            if self.budget.allocate(capacity).is_ok() {
                return self.allocate_chunk(capacity);
            }

            if let Some(parked) = state.pop_any_free() {
                Counters::bump(&self.counters.freed);
                drop(parked);
                continue;
            }

            match self.evict_one(state) {
                Some(victim) if fits(victim.capacity(), capacity) => return Ok(victim),
                Some(victim) => {
                    Counters::bump(&self.counters.freed);
                    drop(victim);
                }
                None => {
                    return Err(self.exhausted(
                        capacity,
                        "memory budget exhausted and every retired chunk is leased",
                    ))
                }
            }
        }
    }

    fn allocate_chunk(&self, capacity: usize) -> Result<Arc<Chunk>, CacheError> {
        let id = ChunkId::new(self.next_chunk_id.fetch_add(1, Ordering::Relaxed));
        let home: Weak<dyn ChunkReclaimer> = self.self_ref.clone();

        match Chunk::allocate(id, capacity, Arc::clone(&self.budget), home) {
            Some(chunk) => {
                Counters::bump(&self.counters.created);
                tracing::debug!(chunk = %id, capacity, "allocated chunk");
                Ok(Arc::new(chunk))
            }
            None => {
                self.budget.release(capacity);
                Err(self.exhausted(capacity, "system allocator failed"))
            }
        }
    }

    /// Recycles the oldest retired chunk that nobody references.
    fn evict_one(&self, state: &mut AllocatorState) -> Option<Arc<Chunk>> {
        let mut idx = 0;
        while idx < state.retired.len() {
            let id = state.retired[idx];
            let candidate = match state.tagged.get(&id) {
                Some(t) if t.state == ChunkState::Retired => &t.chunk,
                _ => {
                    state.retired.remove(idx);
                    continue;
                }
            };

            if !candidate.recycle() {
                idx += 1;
                continue;
            }

            state.retired.remove(idx);
            let victim = state.untag(id)?;
            Counters::bump(&self.counters.evicted);
            tracing::debug!(
                chunk = %id,
                collection = %victim.owner,
                capacity = victim.chunk.capacity(),
                "evicted retired chunk"
            );
            return Some(victim.chunk);
        }
        None
    }

    /// Parks a recycled chunk for reuse, or frees it if its class is full.
    fn park(&self, state: &mut AllocatorState, chunk: Arc<Chunk>) {
        let bucket = state.free.entry(size_class(chunk.capacity())).or_default();
        if bucket.len() < FREE_LIST_LIMIT {
            bucket.push(chunk);
        } else {
            Counters::bump(&self.counters.freed);
        }
    }

    /// Releases a chunk nobody owns any more. Recycles it now if unreferenced,
    /// otherwise defers until the last lease is dropped.
    fn discard(&self, state: &mut AllocatorState, chunk: Arc<Chunk>) {
        chunk.mark_pending_release();
        if chunk.recycle() {
            Counters::bump(&self.counters.recycled);
            self.park(state, chunk);
        } else {
            Counters::bump(&self.counters.deferred);
            tracing::debug!(
                chunk = %chunk.id(),
                refs = chunk.ref_count(),
                "deferring release of leased chunk"
            );
            state.pending.insert(chunk.id(), chunk);
        }
    }

    fn sweep_pending(&self, state: &mut AllocatorState) -> usize {
        let ready: SmallVec<[ChunkId; 8]> = state
            .pending
            .iter()
            .filter(|(_, chunk)| chunk.ref_count() == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut reclaimed = 0;
        for id in ready {
            if !state.pending.get(&id).is_some_and(|chunk| chunk.recycle()) {
                continue;
            }
            if let Some(chunk) = state.pending.remove(&id) {
                Counters::bump(&self.counters.recycled);
                self.park(state, chunk);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl ChunkReclaimer for AllocatorShared {
    fn reclaim(&self, chunk: &Arc<Chunk>) {
        let mut state = self.state.lock();
        if !state.pending.contains_key(&chunk.id()) || !chunk.is_pending_release() {
            return;
        }

        if chunk.recycle() {
            state.pending.remove(&chunk.id());
            Counters::bump(&self.counters.recycled);
            tracing::debug!(chunk = %chunk.id(), "reclaimed chunk after last lease");
            self.park(&mut state, Arc::clone(chunk));
        }
    }
}

/// Shared handle to the process-wide chunk pool.
#[derive(Clone)]
pub struct ChunkAllocator {
    shared: Arc<AllocatorShared>,
}

impl ChunkAllocator {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        let shared = Arc::new_cyclic(|self_ref| AllocatorShared {
            state: Mutex::new(AllocatorState::default()),
            budget,
            next_chunk_id: AtomicU64::new(1),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        });
        Self { shared }
    }

    pub fn with_limit(bytes: usize) -> Self {
        Self::new(Arc::new(MemoryBudget::with_limit(bytes)))
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.shared.budget
    }

    /// Bytes currently charged against the budget, including chunks kept
    /// alive only by leases.
    pub fn memory_usage(&self) -> usize {
        self.shared.budget.used()
    }

    /// Creates the read cache of `collection`, backed by this allocator.
    pub fn read_cache(&self, collection: CollectionId, config: &CacheConfig) -> ReadCache {
        ReadCache::new(self.clone(), collection, config)
    }

    /// Returns a chunk open for writing, tagged to `owner`, with capacity of at
    /// least `min_size` (`preferred_size` when that is enough).
    ///
    /// The returned [`OpenChunk`] owns the writer's reference; hand it back
    /// with [`return_used`](Self::return_used) or
    /// [`return_unused`](Self::return_unused).
    pub fn order_chunk(
        &self,
        owner: CollectionId,
        min_size: usize,
        preferred_size: usize,
    ) -> Result<OpenChunk, CacheError> {
        let shared = &*self.shared;
        let capacity = preferred_size.max(min_size).max(1);

        if capacity > MAX_CHUNK_SIZE || capacity > shared.budget.total_limit() {
            return Err(shared.exhausted(capacity, "chunk exceeds the memory budget"));
        }

        let mut state = shared.state.lock();
        shared.sweep_pending(&mut state);

        let chunk = match state.take_free(capacity) {
            Some(chunk) => {
                Counters::bump(&shared.counters.reused);
                tracing::debug!(
                    chunk = %chunk.id(),
                    collection = %owner,
                    capacity = chunk.capacity(),
                    "reusing recycled chunk"
                );
                chunk
            }
            None => shared.manufacture(&mut state, capacity)?,
        };

        state.tag(owner, Arc::clone(&chunk));
        Ok(OpenChunk::new(chunk))
    }

    /// Retires a chunk that filled up. It stays tagged to `owner`, so its
    /// positions remain readable, and joins the back of the eviction queue.
    pub fn return_used(&self, owner: CollectionId, open: OpenChunk) {
        {
            let mut state = self.shared.state.lock();
            if let Some(tagged) = state.tagged.get_mut(&open.id()) {
                if tagged.owner == owner && tagged.state == ChunkState::Open {
                    tagged.state = ChunkState::Retired;
                    state.retired.push_back(open.id());
                }
            }
        }
        drop(open);
    }

    /// Untags a chunk from its collection immediately, whatever it holds. It
    /// is recycled as soon as no lease references it.
    pub fn return_unused(&self, open: OpenChunk) {
        {
            let mut state = self.shared.state.lock();
            if let Some(tagged) = state.untag(open.id()) {
                let id = tagged.chunk.id();
                state.retired.retain(|retired| *retired != id);

                tagged.chunk.mark_pending_release();
                if tagged.chunk.ref_count() > 1 {
                    Counters::bump(&self.shared.counters.deferred);
                    tracing::debug!(chunk = %id, "deferring release of leased chunk");
                }
                state.pending.insert(id, tagged.chunk);
            }
        }
        // The writer reference goes last, outside the lock: if it was the only
        // one, dropping it hands the now-pending chunk back through `reclaim`.
        drop(open);
    }

    /// Releases every chunk tagged to `owner`. Leased chunks are freed or
    /// recycled when their last lease goes away.
    pub fn remove_collection(&self, owner: CollectionId) {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let Some(ids) = state.collections.remove(&owner) else {
            return;
        };

        let chunks: SmallVec<[Arc<Chunk>; 8]> = ids
            .into_iter()
            .filter_map(|id| state.tagged.remove(&id).map(|t| t.chunk))
            .collect();

        let AllocatorState {
            tagged, retired, ..
        } = &mut *state;
        retired.retain(|id| tagged.contains_key(id));

        let count = chunks.len();
        let pending_before = state.pending.len();
        for chunk in chunks {
            shared.discard(&mut state, chunk);
        }
        tracing::debug!(
            collection = %owner,
            chunks = count,
            deferred = state.pending.len() - pending_before,
            "removed collection from revision cache"
        );
    }

    /// Recycles every retired chunk nobody references, as memory pressure
    /// would. Returns the number of chunks evicted.
    pub fn evict_unreferenced(&self) -> usize {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let mut evicted = 0;
        while let Some(victim) = shared.evict_one(&mut state) {
            shared.park(&mut state, victim);
            evicted += 1;
        }
        evicted
    }

    /// Recycles pending chunks whose leases are all gone.
    pub fn reclaim_pending(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.sweep_pending(&mut state)
    }

    /// Frees all parked chunks. Returns the capacity released.
    pub fn trim(&self) -> usize {
        let parked: Vec<Arc<Chunk>> = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.free)
                .into_values()
                .flatten()
                .collect()
        };

        let bytes = parked.iter().map(|c| c.capacity()).sum();
        self.shared
            .counters
            .freed
            .fetch_add(parked.len() as u64, Ordering::Relaxed);
        drop(parked);
        tracing::debug!(bytes, "trimmed parked chunks");
        bytes
    }

    pub fn stats(&self) -> AllocatorStats {
        let shared = &*self.shared;
        let counters = &shared.counters;
        let state = shared.state.lock();

        let open_chunks = state
            .tagged
            .values()
            .filter(|t| t.state == ChunkState::Open)
            .count();

        AllocatorStats {
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            recycled: counters.recycled.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            freed: counters.freed.load(Ordering::Relaxed),
            deferred: counters.deferred.load(Ordering::Relaxed),
            open_chunks,
            retired_chunks: state.tagged.len() - open_chunks,
            free_chunks: state.free_count(),
            pending_chunks: state.pending.len(),
            collections: state.collections.len(),
            memory: shared.budget.stats(),
        }
    }
}

impl std::fmt::Debug for ChunkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}
