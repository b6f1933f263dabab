//! # Revision Cache Configuration
//!
//! Numeric constants live in [`constants`]; runtime settings for a cache are
//! collected through [`CacheConfig::builder`].
//!
//! ## Module Organization
//!
//! - [`constants`]: Numeric configuration values with dependency documentation
//! - `builder`: `CacheConfig` and `CacheConfigBuilder`

mod builder;
pub mod constants;

pub use builder::{CacheConfig, CacheConfigBuilder};
pub use constants::*;
