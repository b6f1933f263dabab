//! # Per-Collection Read Cache
//!
//! The writer-facing entry point of one collection. It owns at most one open
//! chunk and serializes only the choice of `(chunk, offset)` for each insert;
//! the byte copy runs outside the mutex, in parallel with other writers.
//!
//! ```text
//! insert_and_lease(rev)
//!   lock ─> reserve(len) on open chunk ─> unlock ─> copy ─> Protector
//!               │ full                     │ none open
//!               v                          v
//!   unlock ─> return_used(full)     mark opening ─> unlock ─> order_chunk
//!               │                                               │
//!               │                          lock ─> install ─> notify waiters
//!               └──────────── retry (bounded) ──────────────────┘
//! ```
//!
//! Opening is single-flight: while one writer orders a chunk, the others that
//! find no open chunk wait on a condition variable instead of ordering their
//! own. Only one chunk is ordered per rollover, so a racing writer never
//! evicts another collection's chunk for a spare it would hand straight back.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::chunk::{Chunk, OpenChunk};
use super::{CacheError, ChunkAllocator, CollectionId, Protector, ReadCachePosition};
use crate::config::CacheConfig;
use crate::revision::RevisionBytes;

enum Slot<'a> {
    Reserved(Arc<Chunk>, usize),
    Full(OpenChunk),
    Empty(Opening<'a>),
}

#[derive(Default)]
struct WriteSlot {
    chunk: Option<OpenChunk>,
    opening: bool,
}

pub struct ReadCache {
    collection: CollectionId,
    allocator: ChunkAllocator,
    chunk_size: usize,
    max_rollovers: usize,
    slot: Mutex<WriteSlot>,
    opened: Condvar,
    #[cfg(test)]
    after_open: Option<fn(&ReadCache)>,
}

impl ReadCache {
    pub fn new(allocator: ChunkAllocator, collection: CollectionId, config: &CacheConfig) -> Self {
        Self {
            collection,
            allocator,
            chunk_size: config.chunk_size(),
            max_rollovers: config.max_rollovers(),
            slot: Mutex::new(WriteSlot::default()),
            opened: Condvar::new(),
            #[cfg(test)]
            after_open: None,
        }
    }

    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn allocator(&self) -> &ChunkAllocator {
        &self.allocator
    }

    pub fn has_open_chunk(&self) -> bool {
        self.slot.lock().chunk.is_some()
    }

    /// Appends `revision` to the collection's open chunk and returns a lease
    /// on the copy. Store `protector.position()` to read it again later.
    ///
    /// Fails with `ResourceExhausted` when the allocator cannot provide a
    /// chunk, or when the open chunk filled up more than `max_rollovers`
    /// times during this one call.
    pub fn insert_and_lease(&self, revision: &RevisionBytes) -> Result<Protector, CacheError> {
        let len = revision.len();
        let (mut rollovers, mut opened) = (0, 0);

        loop {
            match self.reserve(len) {
                Slot::Reserved(chunk, offset) => {
                    let protector = Protector::reserved(chunk, offset, len);
                    // SAFETY: `reserve` handed out this exact range on the
                    // current version, and `protector` holds the reference
                    // that keeps the chunk from being recycled.
                    unsafe { protector.chunk().write(offset, revision.as_bytes()) };
                    return Ok(protector);
                }
                Slot::Full(chunk) => {
                    rollovers += 1;
                    tracing::trace!(
                        collection = %self.collection,
                        chunk = %chunk.id(),
                        used = chunk.used(),
                        len,
                        "rolling over full chunk"
                    );
                    self.allocator.return_used(self.collection, chunk);

                    if rollovers > self.max_rollovers {
                        return Err(self.give_up(len, rollovers));
                    }
                }
                Slot::Empty(opening) => {
                    // Every open after the first means another writer filled
                    // or closed the chunk we just installed.
                    opened += 1;
                    if opened > self.max_rollovers + 1 {
                        drop(opening);
                        return Err(self.give_up(len, opened));
                    }
                    self.open_chunk(opening, len)?;
                }
            }
        }
    }

    /// Leases a previously inserted revision. Never touches the write mutex.
    pub fn read_and_lease(&self, position: &ReadCachePosition) -> Result<Protector, CacheError> {
        position.lease()
    }

    /// Retires the open chunk regardless of how full it is. Leases already
    /// taken on it stay valid, but its positions can no longer be leased. The
    /// chunk is recycled once the last lease is dropped.
    pub fn close_write_chunk(&self) {
        let closed = self.slot.lock().chunk.take();
        if let Some(chunk) = closed {
            self.allocator.return_unused(chunk);
        }
    }

    /// Releases every chunk of this collection. Safe to call repeatedly, and
    /// never panics: teardown failures are logged and swallowed.
    pub fn clear(&self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.close_write_chunk();
            self.allocator.remove_collection(self.collection);
        }));

        if outcome.is_err() {
            tracing::warn!(
                collection = %self.collection,
                "panic while clearing revision cache, ignoring"
            );
        }
    }

    fn give_up(&self, len: usize, attempts: usize) -> CacheError {
        tracing::warn!(
            collection = %self.collection,
            attempts,
            len,
            "insert gave up after repeated chunk rollovers"
        );
        CacheError::ResourceExhausted {
            requested: len,
            reason: "chunk rollover limit reached",
        }
    }

    /// Reserves `len` bytes on the open chunk. With no chunk open, waits for
    /// the writer already opening one, or claims the opening itself.
    fn reserve(&self, len: usize) -> Slot<'_> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(open) = slot.chunk.take() {
                let Some(offset) = open.reserve(len) else {
                    return Slot::Full(open);
                };
                // The slot carries the writer reference, so the chunk cannot
                // be recycled between the reservation and this increment.
                open.acquire_reference();
                let reserved = Arc::clone(open.chunk());
                slot.chunk = Some(open);
                return Slot::Reserved(reserved, offset);
            }

            if !slot.opening {
                slot.opening = true;
                return Slot::Empty(Opening {
                    cache: self,
                    fresh: None,
                });
            }
            self.opened.wait(&mut slot);
        }
    }

    fn open_chunk(&self, mut opening: Opening<'_>, len: usize) -> Result<(), CacheError> {
        let fresh = self
            .allocator
            .order_chunk(self.collection, len, self.chunk_size)?;
        opening.fresh = Some(fresh);
        drop(opening);

        #[cfg(test)]
        if let Some(hook) = self.after_open {
            hook(self);
        }
        Ok(())
    }
}

/// Claim on the single in-flight open of a cache. Dropping it installs the
/// ordered chunk, if any, and wakes the writers waiting in `reserve`. It is
/// released on every path, errors and unwinding included.
struct Opening<'a> {
    cache: &'a ReadCache,
    fresh: Option<OpenChunk>,
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        let cache = self.cache;
        let spare = {
            let mut slot = cache.slot.lock();
            slot.opening = false;
            match self.fresh.take() {
                Some(fresh) if slot.chunk.is_none() => {
                    slot.chunk = Some(fresh);
                    None
                }
                other => other,
            }
        };
        cache.opened.notify_all();

        if let Some(spare) = spare {
            cache.allocator.return_unused(spare);
        }
    }
}

impl std::fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("ReadCache")
            .field("collection", &self.collection)
            .field("chunk_size", &self.chunk_size)
            .field("open", &slot.chunk.as_ref().map(|c| c.id()))
            .field("opening", &slot.opening)
            .finish()
    }
}

impl Drop for ReadCache {
    fn drop(&mut self) {
        self.clear();
    }
}
