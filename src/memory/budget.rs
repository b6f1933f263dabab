//! # Memory Budget Implementation
//!
//! This module implements the byte budget every chunk is charged against.
//!
//! ## Design Principles
//!
//! 1. **Hard Limits**: Allocations that would exceed the budget fail immediately
//! 2. **Charge on manufacture, credit on free**: a chunk is charged when the
//!    allocator creates it and credited when its memory is actually released,
//!    which may be long after the allocator let go of it (a lease can keep a
//!    retired chunk alive)
//! 3. **Thread Safety**: All counters use atomics for lock-free operation
//!
//! ## Memory Accounting
//!
//! Tracked memory is chunk capacity only. Registry bookkeeping (hash maps,
//! queues, `Arc` headers) is small and untracked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use sysinfo::System;

use crate::config::{DEFAULT_BUDGET_PERCENT, MIN_BUDGET_FLOOR};

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetStats {
    pub total_limit: usize,
    pub used: usize,
    pub peak: usize,
}

impl BudgetStats {
    pub fn available(&self) -> usize {
        self.total_limit.saturating_sub(self.used)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.total_limit == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total_limit as f64) * 100.0
    }
}

impl std::fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunks:{}/{},peak:{}", self.used, self.total_limit, self.peak)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryError {
    pub requested: usize,
    pub available: usize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory budget exceeded: requested {} bytes but only {} available",
            self.requested, self.available
        )
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug)]
pub struct MemoryBudget {
    total_limit: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryBudget {
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        Self::with_limit((total_memory / 100).saturating_mul(DEFAULT_BUDGET_PERCENT))
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            total_limit: limit.max(MIN_BUDGET_FLOOR),
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn total_limit(&self) -> usize {
        self.total_limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.total_limit.saturating_sub(self.used())
    }

    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.available() >= bytes
    }

    pub fn allocate(&self, bytes: usize) -> Result<(), MemoryError> {
        if bytes == 0 {
            return Ok(());
        }

        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let new_used = match current.checked_add(bytes) {
                Some(n) if n <= self.total_limit => n,
                _ => {
                    return Err(MemoryError {
                        requested: bytes,
                        available: self.total_limit.saturating_sub(current),
                    })
                }
            };

            match self.used.compare_exchange_weak(
                current,
                new_used,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(new_used, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }

        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let new_value = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            total_limit: self.total_limit,
            used: self.used(),
            peak: self.peak.load(Ordering::Acquire),
        }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::auto_detect()
    }
}
