//! Two-tier cache
//!
//! - **L1**: process-local DashMap with per-entry absolute expiry.
//!   Readable without I/O; never shared across processes.
//! - **L2**: shared Redis tier with TTLs, atomic counters for rate
//!   limits, and set-if-absent markers for consumed nonces.
//!
//! Reads go L1 → L2 → loader, with concurrent misses for one key
//! collapsed into a single loader invocation (single-flight).
//! Invalidation deletes from L2 first, then L1, so a concurrent reader
//! that repopulates does so from the store, not from a stale L2 entry.
//!
//! Losing L2 never blocks writes: the cache degrades to L1 plus the
//! store, and rate limiting falls back to process-local counters.

pub mod keys;
pub mod l1;
pub mod l2;
pub mod layered;

pub use l1::{spawn_cleanup_task, L1Cache, L1Stats};
pub use l2::L2Cache;
pub use layered::{CacheStats, LayeredCache};
