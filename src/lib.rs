//! Podium - real-time scoreboard service
//!
//! Maintains per-identity integer counters, exposes the top-K ranking,
//! accepts authenticated increment requests that are forgery-resistant
//! and replay-safe, and pushes ranking updates to all subscribed
//! WebSocket observers.
//!
//! # Architecture
//!
//! ```text
//! client ──► ActionVerifier ──► ScoreEngine ──► ScoreStore (transaction)
//!                                   │
//!                                   ├──► LayeredCache (invalidate + refill)
//!                                   └──► Broadcaster ──► subscribers
//! ```
//!
//! Reads go through the cache: L1 (process-local) → L2 (shared) → store,
//! with single-flight collapsing of concurrent misses.

pub mod actions;
pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod routes;
pub mod server;
pub mod store;

pub use error::{PodiumError, Result};
