//! # Arena Chunk
//!
//! A chunk is a fixed-capacity byte buffer shared by many revisions. It carries
//! three atomics:
//!
//! ```text
//! Chunk {
//!     cursor:  AtomicUsize,  // next free byte, 0 <= cursor <= capacity
//!     refs:    AtomicU32,    // writer + outstanding leases, high bit = recycling
//!     version: AtomicU64,    // bumped once per recycle
//! }
//! ```
//!
//! ## Reservation
//!
//! `reserve(len)` claims `[cursor, cursor + len)` with a CAS loop. It never
//! advances the cursor past `capacity`; a reservation that does not fit
//! returns `None` and leaves the cursor untouched. Concurrent reservations
//! receive disjoint ranges, so copies into them need no further
//! synchronization.
//!
//! ## Recycling Protocol
//!
//! Recycling claims the reference count with `CAS(0 -> RECYCLING)`. A lease
//! increments first and checks afterwards:
//!
//! 1. previous count has `RECYCLING` set: undo, the chunk is being recycled
//! 2. version differs from the position's: undo, the position is stale
//! 3. chunk has been discarded: undo, it only waits for its existing leases
//!
//! Once a lease's increment lands without the flag, the recycler's CAS cannot
//! succeed until the lease is released, so the memory the lease reads cannot
//! be reused underneath it.
//!
//! ## Writer Reference
//!
//! The allocator hands chunks out wrapped in an [`OpenChunk`]. The wrapper owns
//! the writer's reference and cannot be cloned, so a chunk is returned to the
//! allocator at most once and its count cannot underflow.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::ChunkId;
use crate::config::CHUNK_ALIGN;
use crate::encoding::{peek_varint, varint_width};
use crate::memory::MemoryBudget;

const RECYCLING: u32 = 1 << 31;
const REF_MASK: u32 = !RECYCLING;

/// Receives discarded chunks whose last lease has been released.
pub(crate) trait ChunkReclaimer: Send + Sync {
    fn reclaim(&self, chunk: &Arc<Chunk>);
}

pub struct Chunk {
    id: ChunkId,
    data: NonNull<u8>,
    layout: Layout,
    cursor: AtomicUsize,
    refs: AtomicU32,
    version: AtomicU64,
    pending_release: AtomicBool,
    home: Weak<dyn ChunkReclaimer>,
    budget: Arc<MemoryBudget>,
}

// SAFETY: the buffer is only written through ranges handed out by `reserve`,
// which are disjoint, and only read through records whose writers completed
// before their positions were published. All bookkeeping is atomic.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocates a zeroed buffer of `capacity` bytes.
    ///
    /// The caller must already have charged `capacity` to `budget`; the charge
    /// is released when the chunk is dropped. Returns `None` if the system
    /// allocator fails, in which case the caller still owns the charge.
    pub(crate) fn allocate(
        id: ChunkId,
        capacity: usize,
        budget: Arc<MemoryBudget>,
        home: Weak<dyn ChunkReclaimer>,
    ) -> Option<Self> {
        let layout = Layout::from_size_align(capacity.max(1), CHUNK_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        let data = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        Some(Self {
            id,
            data,
            layout,
            cursor: AtomicUsize::new(0),
            refs: AtomicU32::new(0),
            version: AtomicU64::new(0),
            pending_release: AtomicBool::new(false),
            home,
            budget,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire) & REF_MASK
    }

    /// Claims `len` bytes and returns their start offset, or `None` if the
    /// chunk cannot hold them.
    pub fn reserve(&self, len: usize) -> Option<usize> {
        let capacity = self.capacity();
        let mut current = self.cursor.load(Ordering::Acquire);

        loop {
            let end = current.checked_add(len).filter(|&end| end <= capacity)?;

            match self.cursor.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Copies `bytes` to `offset`.
    ///
    /// # Safety
    ///
    /// `[offset, offset + bytes.len())` must have been returned by `reserve`
    /// on the current incarnation of this chunk, must not have been written
    /// before, and the caller must hold a reference that keeps the chunk from
    /// being recycled until the copy completes.
    pub(crate) unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(offset), bytes.len());
    }

    /// Returns `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The range must lie within a record whose writer has completed, and the
    /// caller must hold a reference for the lifetime of the returned slice.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity());
        std::slice::from_raw_parts(self.data.as_ptr().add(offset), len)
    }

    /// Framed length of the record at `offset`, read from its own prefix.
    ///
    /// Only bytes that belong to the record are touched: the marker byte
    /// first, then the rest of the prefix it announces.
    ///
    /// # Safety
    ///
    /// A record written under the current version must start at `offset`
    /// (the caller verified the version while holding a reference).
    pub(crate) unsafe fn record_len(&self, offset: usize) -> Option<usize> {
        let written = self.used();
        if offset >= written {
            return None;
        }

        let width = varint_width(*self.data.as_ptr().add(offset))?;
        if offset + width > written {
            return None;
        }

        let (body_len, header_len) = peek_varint(self.slice(offset, width))?;
        let total = usize::try_from(body_len).ok()?.checked_add(header_len)?;
        (offset.checked_add(total)? <= written).then_some(total)
    }

    /// Adds a reference without checking the version. Only valid while the
    /// caller already knows the chunk cannot be recycled (it is open, or the
    /// caller holds another reference).
    pub(crate) fn acquire_reference(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Adds a reference if the chunk is still at `expected` version and has
    /// not been discarded.
    ///
    /// On failure undoes the increment and returns the version found, or
    /// `None` for a discarded chunk.
    pub(crate) fn try_acquire(self: &Arc<Self>, expected: u64) -> Result<(), Option<u64>> {
        let prev = self.refs.fetch_add(1, Ordering::SeqCst);
        if prev & RECYCLING != 0 {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            return Err(Some(self.version()));
        }

        let current = self.version.load(Ordering::SeqCst);
        if current != expected {
            self.release_reference();
            return Err(Some(current));
        }

        // A discarded chunk must drain. If the lease it was waiting on went
        // away meanwhile, this release is the last one and reclaims it.
        if self.is_pending_release() {
            self.release_reference();
            return Err(None);
        }
        Ok(())
    }

    /// Drops one reference. If this was the last one and the chunk has been
    /// discarded, hands the chunk back to its allocator.
    pub(crate) fn release_reference(self: &Arc<Self>) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev & REF_MASK > 0, "release on unreferenced chunk");

        if prev & REF_MASK == 1 && self.pending_release.load(Ordering::SeqCst) {
            if let Some(home) = self.home.upgrade() {
                home.reclaim(self);
            }
        }
    }

    pub(crate) fn mark_pending_release(&self) {
        self.pending_release.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_pending_release(&self) -> bool {
        self.pending_release.load(Ordering::SeqCst)
    }

    /// Bumps the version and resets the cursor, if and only if nothing
    /// references the chunk. Every position minted before becomes stale.
    pub(crate) fn recycle(&self) -> bool {
        if self
            .refs
            .compare_exchange(0, RECYCLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.version.fetch_add(1, Ordering::SeqCst);
        self.cursor.store(0, Ordering::Release);
        self.pending_release.store(false, Ordering::SeqCst);
        self.refs.fetch_sub(RECYCLING, Ordering::SeqCst);
        true
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("refs", &self.ref_count())
            .field("version", &self.version())
            .finish()
    }
}

/// A chunk handed out for writing. Owns the writer's reference, which is
/// released exactly once: when the chunk is returned to the allocator or the
/// wrapper is dropped.
///
/// ```compile_fail
/// fn twice(open: revcache::OpenChunk) {
///     let _copy = open.clone();
/// }
/// ```
pub struct OpenChunk {
    chunk: Arc<Chunk>,
}

impl OpenChunk {
    pub(crate) fn new(chunk: Arc<Chunk>) -> Self {
        chunk.acquire_reference();
        Self { chunk }
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

impl Deref for OpenChunk {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl std::fmt::Debug for OpenChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OpenChunk").field(&*self.chunk).finish()
    }
}

impl Drop for OpenChunk {
    fn drop(&mut self) {
        self.chunk.release_reference();
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: data was allocated in `allocate` with this exact layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
        self.budget.release(self.layout.size());
        tracing::debug!(chunk = %self.id, capacity = self.layout.size(), "freed chunk memory");
    }
}
