//! Multi-tenant backend core: one lazily created storage pool per tenant,
//! idle eviction and coordinated shutdown, plus a cache-aside layer for
//! idempotent reads.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod pool;
mod util;
