use crate::memory::BudgetStats;

/// Point-in-time view of the allocator. Counters are cumulative since
/// construction; gauges reflect the registry when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    pub created: u64,
    pub reused: u64,
    pub recycled: u64,
    pub evicted: u64,
    pub freed: u64,
    pub deferred: u64,

    pub open_chunks: usize,
    pub retired_chunks: usize,
    pub free_chunks: usize,
    pub pending_chunks: usize,
    pub collections: usize,

    pub memory: BudgetStats,
}

impl AllocatorStats {
    /// Chunks the allocator currently holds memory for. Pending chunks are
    /// included; chunks kept alive only by a stray `Arc` are not.
    pub fn live_chunks(&self) -> usize {
        self.open_chunks + self.retired_chunks + self.free_chunks + self.pending_chunks
    }

    /// Share of chunk requests served from recycled memory.
    pub fn reuse_ratio(&self) -> f64 {
        let served = self.created + self.reused;
        if served == 0 {
            return 0.0;
        }
        self.reused as f64 / served as f64
    }
}

impl std::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} open:{} retired:{} free:{} pending:{} created:{} reused:{} evicted:{}",
            self.memory,
            self.open_chunks,
            self.retired_chunks,
            self.free_chunks,
            self.pending_chunks,
            self.created,
            self.reused,
            self.evicted,
        )
    }
}
