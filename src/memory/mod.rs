//! # Memory Budget Management
//!
//! Every chunk the allocator manufactures is charged against a single,
//! process-wide byte budget. The budget is an explicitly constructed object
//! shared through `Arc`, never an implicit global.
//!
//! ## Enforcement Model
//!
//! Hard limits: a charge that would exceed the budget is refused and the
//! allocator turns to recycling or eviction instead. If neither helps, the
//! caller sees `ResourceExhausted`.
//!
//! ## Configuration
//!
//! ```rust,ignore
//! // Auto-detect (10% of system RAM, 64KB floor)
//! let budget = MemoryBudget::auto_detect();
//!
//! // Explicit limit
//! let budget = MemoryBudget::with_limit(16 * 1024 * 1024); // 16 MB
//! ```

mod budget;

pub use budget::{BudgetStats, MemoryBudget, MemoryError};
