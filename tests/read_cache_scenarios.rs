//! # Read Cache Integration Tests
//!
//! End-to-end behavior of the per-collection read cache on top of a shared
//! chunk allocator.
//!
//! ## Test Coverage
//!
//! 1. Rollover
//!    - Inserts share a chunk until it is full
//!    - Leases stay valid across the rollover
//!
//! 2. Concurrent Inserts
//!    - Disjoint offsets from many writer threads
//!    - Chunk count matches the packed layout
//!
//! 3. Stale Positions
//!    - Recycled chunks reject old positions
//!    - Readers racing eviction see bytes or staleness, never garbage
//!
//! 4. Backpressure
//!    - Budget exhausted with every chunk leased fails fast
//!
//! 5. Teardown
//!    - Leases outlive `clear()`
//!    - Cleared chunks refuse new leases while they drain
//!    - `clear()` is idempotent
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test read_cache_scenarios --release -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use revcache::config::MIN_BUDGET_FLOOR;
use revcache::{
    CacheConfig, CacheError, ChunkAllocator, CollectionId, ReadCache, ReadCachePosition,
    RevisionBytes,
};

const USERS: CollectionId = CollectionId::new(1);
const ORDERS: CollectionId = CollectionId::new(2);

fn config(chunk_size: usize, budget: usize) -> CacheConfig {
    CacheConfig::builder()
        .chunk_size(chunk_size)
        .memory_budget(budget)
        .build()
        .unwrap()
}

/// A body whose framed length (one-byte prefix included) is `framed`, tagged
/// so that every record has distinct content.
fn tagged_body(framed: usize, tag: u32) -> Vec<u8> {
    assert!(framed <= 241, "keep the prefix at one byte");
    let mut body = vec![(tag % 251) as u8; framed - 1];
    body[..4].copy_from_slice(&tag.to_le_bytes());
    body
}

// ============================================================================
// Rollover
// ============================================================================

#[test]
fn test_three_inserts_roll_over_into_second_chunk() {
    let config = config(250, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    let revisions: Vec<RevisionBytes> = (0..3)
        .map(|i| RevisionBytes::encode(&tagged_body(100, i)))
        .collect();
    assert!(revisions.iter().all(|r| r.len() == 100));

    let positions: Vec<ReadCachePosition> = revisions
        .iter()
        .map(|r| cache.insert_and_lease(r).unwrap().position())
        .collect();

    assert_eq!(positions[0].chunk_id(), positions[1].chunk_id());
    assert_eq!(positions[1].offset(), 100);
    assert_ne!(positions[1].chunk_id(), positions[2].chunk_id());
    assert_eq!(positions[2].offset(), 0);

    let stats = allocator.stats();
    assert_eq!(stats.retired_chunks, 1);
    assert_eq!(stats.open_chunks, 1);

    for (position, revision) in positions.iter().zip(&revisions) {
        let lease = cache.read_and_lease(position).unwrap();
        assert_eq!(lease.data(), revision.as_bytes());
        assert_eq!(lease.body(), revision.body());
    }
}

#[test]
fn test_rollover_keeps_writer_lease_readable() {
    let config = config(250, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    let first = cache
        .insert_and_lease(&RevisionBytes::encode(&tagged_body(200, 1)))
        .unwrap();
    let second = cache
        .insert_and_lease(&RevisionBytes::encode(&tagged_body(200, 2)))
        .unwrap();

    assert_ne!(first.chunk_id(), second.chunk_id());
    assert_eq!(first.body(), &tagged_body(200, 1)[..]);

    // The retired chunk is leased, so pressure cannot take it.
    assert_eq!(allocator.evict_unreferenced(), 0);
    drop(first);
    assert_eq!(allocator.evict_unreferenced(), 1);
}

// ============================================================================
// Concurrent Inserts
// ============================================================================

#[test]
fn test_concurrent_inserts_pack_chunks_without_overlap() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 125;
    const RECORD: usize = 50;
    const CHUNK: usize = 4096;

    let config = config(CHUNK, 16 * 1024 * 1024);
    let allocator = config.allocator();
    let cache = Arc::new(allocator.read_cache(USERS, &config));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|i| {
                        let tag = (t * PER_THREAD + i) as u32;
                        let rev = RevisionBytes::encode(&tagged_body(RECORD, tag));
                        let lease = cache.insert_and_lease(&rev).unwrap();
                        (lease.position(), rev)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let inserted: Vec<(ReadCachePosition, RevisionBytes)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(inserted.len(), THREADS * PER_THREAD);

    let mut ranges = HashSet::new();
    let mut chunks = HashSet::new();
    for (position, _) in &inserted {
        assert_eq!(position.offset() % RECORD, 0);
        assert!(
            ranges.insert((position.chunk_id(), position.version(), position.offset())),
            "duplicate reservation at {:?}",
            position
        );
        chunks.insert((position.chunk_id(), position.version()));
    }

    let expected_chunks = (THREADS * PER_THREAD).div_ceil(CHUNK / RECORD);
    assert_eq!(chunks.len(), expected_chunks);

    // One open per rollover: no writer ordered a spare chunk and handed it back.
    let stats = allocator.stats();
    assert_eq!(stats.created, expected_chunks as u64);
    assert_eq!(stats.recycled, 0);
    assert_eq!(stats.free_chunks, 0);

    for (position, rev) in &inserted {
        let lease = cache.read_and_lease(position).unwrap();
        assert_eq!(lease.data(), rev.as_bytes());
    }
}

#[test]
fn test_collections_write_independently() {
    let config = config(1024, 4 * 1024 * 1024);
    let allocator = config.allocator();
    let users = Arc::new(allocator.read_cache(USERS, &config));
    let orders = Arc::new(allocator.read_cache(ORDERS, &config));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [Arc::clone(&users), Arc::clone(&orders)]
        .into_iter()
        .enumerate()
        .map(|(n, cache)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..200u32)
                    .map(|i| {
                        let rev = RevisionBytes::encode(&tagged_body(64, i + n as u32 * 1000));
                        (cache.insert_and_lease(&rev).unwrap().position(), rev)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let written: Vec<Vec<_>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let user_chunks: HashSet<_> = written[0].iter().map(|(p, _)| p.chunk_id()).collect();
    let order_chunks: HashSet<_> = written[1].iter().map(|(p, _)| p.chunk_id()).collect();
    assert!(user_chunks.is_disjoint(&order_chunks));

    for (position, rev) in written.iter().flatten() {
        assert_eq!(position.lease().unwrap().data(), rev.as_bytes());
    }
    assert_eq!(allocator.stats().collections, 2);
}

// ============================================================================
// Stale Positions
// ============================================================================

#[test]
fn test_recycled_chunk_rejects_old_position() {
    let config = config(256, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    let old = cache
        .insert_and_lease(&RevisionBytes::encode(b"version one"))
        .unwrap()
        .position();

    // Roll over so the first chunk is retired, then force it out.
    cache
        .insert_and_lease(&RevisionBytes::encode(&[9u8; 250]))
        .unwrap();
    assert_eq!(allocator.evict_unreferenced(), 1);

    let err = cache.read_and_lease(&old).unwrap_err();
    assert!(err.is_stale());
    assert!(matches!(
        err,
        CacheError::StaleReference { expected: 0, found: Some(1), .. }
    ));
}

#[test]
fn test_recycled_chunk_reused_by_another_collection() {
    let config = config(256, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let users = allocator.read_cache(USERS, &config);
    let orders = allocator.read_cache(ORDERS, &config);

    let old = users
        .insert_and_lease(&RevisionBytes::encode(b"user"))
        .unwrap()
        .position();
    users.close_write_chunk();

    let fresh = orders
        .insert_and_lease(&RevisionBytes::encode(b"order"))
        .unwrap();
    assert_eq!(fresh.chunk_id(), old.chunk_id());
    assert_eq!(fresh.offset(), old.offset());
    assert_ne!(fresh.version(), old.version());

    assert!(users.read_and_lease(&old).unwrap_err().is_stale());
    assert_eq!(fresh.body(), b"order");
}

#[test]
fn test_readers_racing_eviction_never_see_foreign_bytes() {
    const WRITERS: usize = 2;
    const READERS: usize = 4;
    const INSERTS: u32 = 2000;

    // Small budget: writers constantly evict each other's retired chunks.
    let config = config(1024, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = Arc::new(allocator.read_cache(USERS, &config));
    let published: Arc<Mutex<Vec<(ReadCachePosition, RevisionBytes)>>> = Arc::default();
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(WRITERS + READERS));

    let writers: Vec<_> = (0..WRITERS as u32)
        .map(|w| {
            let cache = Arc::clone(&cache);
            let published = Arc::clone(&published);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..INSERTS {
                    let rev = RevisionBytes::encode(&tagged_body(100, w * INSERTS + i));
                    let position = cache.insert_and_lease(&rev).unwrap().position();
                    published.lock().unwrap().push((position, rev));
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|r| {
            let published = Arc::clone(&published);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let (mut hits, mut stale) = (0usize, 0usize);
                let mut cursor = r;
                while !done.load(Ordering::Acquire) {
                    let entry = {
                        let published = published.lock().unwrap();
                        if published.is_empty() {
                            None
                        } else {
                            Some(published[cursor % published.len()].clone())
                        }
                    };
                    cursor = cursor.wrapping_mul(31).wrapping_add(7);

                    let Some((position, rev)) = entry else {
                        thread::yield_now();
                        continue;
                    };
                    match position.lease() {
                        Ok(lease) => {
                            assert_eq!(lease.data(), rev.as_bytes());
                            hits += 1;
                        }
                        Err(e) => {
                            assert!(e.is_stale(), "unexpected error: {}", e);
                            stale += 1;
                        }
                    }
                }
                (hits, stale)
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let (hits, stale) = readers
        .into_iter()
        .map(|r| r.join().unwrap())
        .fold((0, 0), |(h, s), (rh, rs)| (h + rh, s + rs));
    println!("reads: {} hits, {} stale", hits, stale);

    assert!(allocator.stats().evicted > 0);
    assert!(allocator.memory_usage() <= MIN_BUDGET_FLOOR);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_budget_exhausted_with_all_chunks_leased() {
    const CHUNK: usize = 16 * 1024;

    let config = config(CHUNK, 64 * 1024);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);
    let body = vec![0xC3u8; 16_000];
    let rev = RevisionBytes::encode(&body);

    let held: Vec<_> = (0..4).map(|_| cache.insert_and_lease(&rev).unwrap()).collect();
    let distinct: HashSet<_> = held.iter().map(|l| l.chunk_id()).collect();
    assert_eq!(distinct.len(), 4);
    assert_eq!(allocator.memory_usage(), 64 * 1024);

    let err = cache.insert_and_lease(&rev).unwrap_err();
    assert!(err.is_exhausted(), "expected exhaustion, got {}", err);

    drop(held);
    let lease = cache.insert_and_lease(&rev).unwrap();
    assert_eq!(lease.body(), &body[..]);
    assert!(allocator.stats().evicted >= 1);
}

#[test]
fn test_oversized_revision_is_rejected() {
    let config = config(1024, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    let huge = vec![0u8; MIN_BUDGET_FLOOR + 1];
    let err = cache
        .insert_and_lease(&RevisionBytes::encode(&huge))
        .unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(allocator.memory_usage(), 0);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_lease_outlives_clear() {
    let config = config(1024, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    let lease = cache
        .insert_and_lease(&RevisionBytes::encode(b"still here"))
        .unwrap();
    let position = lease.position();
    cache.clear();

    let stats = allocator.stats();
    assert_eq!(stats.pending_chunks, 1);
    assert_eq!(lease.body(), b"still here");
    assert!(matches!(
        position.lease().unwrap_err(),
        CacheError::StaleReference { found: None, .. }
    ));

    drop(lease);
    let stats = allocator.stats();
    assert_eq!(stats.pending_chunks, 0);
    assert_eq!(stats.free_chunks, 1);
    assert!(position.lease().unwrap_err().is_stale());
}

#[test]
fn test_clear_twice_is_harmless() {
    let config = config(512, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let cache = allocator.read_cache(USERS, &config);

    for i in 0..20 {
        cache
            .insert_and_lease(&RevisionBytes::encode(&tagged_body(100, i)))
            .unwrap();
    }
    let usage = allocator.memory_usage();

    cache.clear();
    cache.clear();

    let stats = allocator.stats();
    assert_eq!(stats.open_chunks + stats.retired_chunks + stats.pending_chunks, 0);
    assert_eq!(allocator.memory_usage(), usage);
    assert_eq!(allocator.trim(), usage);
    assert_eq!(allocator.memory_usage(), 0);
}

#[test]
fn test_allocator_outlived_by_lease() {
    let config = config(1024, MIN_BUDGET_FLOOR);
    let allocator = config.allocator();
    let budget = Arc::clone(allocator.budget());
    let cache: ReadCache = allocator.read_cache(USERS, &config);

    let lease = cache
        .insert_and_lease(&RevisionBytes::encode(b"orphan"))
        .unwrap();
    drop(cache);
    drop(allocator);

    assert_eq!(lease.body(), b"orphan");
    drop(lease);
    assert_eq!(budget.used(), 0);
}

#[test]
fn test_shared_allocator_handle_is_cheap_to_clone() {
    let allocator = ChunkAllocator::with_limit(MIN_BUDGET_FLOOR);
    let config = config(1024, MIN_BUDGET_FLOOR);
    let clone = allocator.clone();

    let cache = clone.read_cache(ORDERS, &config);
    cache.insert_and_lease(&RevisionBytes::encode(b"x")).unwrap();
    assert_eq!(allocator.stats().open_chunks, 1);
}

#[test]
fn test_full_budget_chunk_returned_once_is_reordered() {
    let allocator = ChunkAllocator::with_limit(MIN_BUDGET_FLOOR);

    let open = allocator.order_chunk(USERS, 64, MIN_BUDGET_FLOOR).unwrap();
    open.reserve(open.remaining()).unwrap();
    let chunk = Arc::clone(open.chunk());
    allocator.return_used(USERS, open);
    assert_eq!(chunk.ref_count(), 0);

    let again = allocator.order_chunk(ORDERS, 64, MIN_BUDGET_FLOOR).unwrap();
    assert_eq!(again.id(), chunk.id());
    assert_eq!(again.version(), 1);
    assert_eq!(allocator.stats().evicted, 1);

    allocator.return_unused(again);
    assert_eq!(chunk.ref_count(), 0);
    assert_eq!(allocator.stats().free_chunks, 1);
}
