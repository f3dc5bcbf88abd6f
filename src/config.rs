//! Configuration for Podium
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Podium - real-time scoreboard service
#[derive(Parser, Debug, Clone)]
#[command(name = "podium")]
#[command(about = "Real-time scoreboard service with authenticated increments")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "podium")]
    pub mongodb_db: String,

    /// Redis URL for the shared cache tier (optional; L1-only without it)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// JWT secret for bearer token signing (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Secret for action-token MACs (falls back to JWT_SECRET)
    #[arg(long, env = "ACTION_SECRET")]
    pub action_secret: Option<String>,

    /// Size of the ranking surface
    #[arg(long, env = "TOP_K", default_value = "10")]
    pub top_k: usize,

    /// Maximum accepted score increment per action
    #[arg(long, env = "MAX_INCREMENT", default_value = "1000")]
    pub max_increment: u64,

    /// Action-token freshness window in seconds
    #[arg(long, env = "FRESHNESS_WINDOW_SECS", default_value = "300")]
    pub freshness_window_secs: u64,

    /// Grace added to the freshness window for nonce markers
    #[arg(long, env = "NONCE_GRACE_SECS", default_value = "60")]
    pub nonce_grace_secs: u64,

    /// Max score updates per identity per window
    #[arg(long, env = "SCORE_RATE_MAX", default_value = "10")]
    pub score_rate_max: u64,

    /// Score rate-limit window in seconds
    #[arg(long, env = "SCORE_RATE_WINDOW_SECS", default_value = "60")]
    pub score_rate_window_secs: u64,

    /// Max authentication attempts per source address per window
    #[arg(long, env = "AUTH_RATE_MAX", default_value = "20")]
    pub auth_rate_max: u64,

    /// Authentication rate-limit window in seconds
    #[arg(long, env = "AUTH_RATE_WINDOW_SECS", default_value = "60")]
    pub auth_rate_window_secs: u64,

    /// Max administrative operations per identity per window
    #[arg(long, env = "ADMIN_RATE_MAX", default_value = "30")]
    pub admin_rate_max: u64,

    /// Administrative rate-limit window in seconds
    #[arg(long, env = "ADMIN_RATE_WINDOW_SECS", default_value = "60")]
    pub admin_rate_window_secs: u64,

    /// Shared-tier TTL for the top-K ranking, in seconds
    #[arg(long, env = "TOP_TTL_SECS", default_value = "30")]
    pub top_ttl_secs: u64,

    /// Process-local TTL for the top-K ranking, in milliseconds.
    /// Must stay at or below the shared-tier TTL so staleness after a
    /// concurrent invalidate is bounded by one L1 expiry.
    #[arg(long, env = "TOP_L1_TTL_MS", default_value = "1000")]
    pub top_l1_ttl_ms: u64,

    /// TTL for per-identity score entries, in seconds
    #[arg(long, env = "SCORE_TTL_SECS", default_value = "300")]
    pub score_ttl_secs: u64,

    /// TTL for the cached identity count, in seconds
    #[arg(long, env = "TOTAL_TTL_SECS", default_value = "60")]
    pub total_ttl_secs: u64,

    /// Outbound buffer capacity per WebSocket subscriber
    #[arg(long, env = "SUBSCRIBER_BUFFER", default_value = "64")]
    pub subscriber_buffer: usize,

    /// Store operation deadline in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "2000")]
    pub store_timeout_ms: u64,

    /// Shared-cache operation deadline in milliseconds
    #[arg(long, env = "L2_TIMEOUT_MS", default_value = "500")]
    pub l2_timeout_ms: u64,

    /// Per-subscriber write deadline in milliseconds
    #[arg(long, env = "SUBSCRIBER_WRITE_TIMEOUT_MS", default_value = "100")]
    pub subscriber_write_timeout_ms: u64,

    /// Enable development mode (memory-only store allowed, insecure default secret)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> String {
        if self.dev_mode {
            self.jwt_secret
                .clone()
                .unwrap_or_else(|| "dev-only-insecure-secret-not-for-production".to_string())
        } else {
            self.jwt_secret
                .clone()
                .expect("JWT_SECRET is required in production mode")
        }
    }

    /// Get effective action-MAC secret (falls back to the JWT secret)
    pub fn action_secret(&self) -> String {
        self.action_secret.clone().unwrap_or_else(|| self.jwt_secret())
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn nonce_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs + self.nonce_grace_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }

    pub fn subscriber_write_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_write_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match &self.jwt_secret {
                None => return Err("JWT_SECRET is required in production mode".to_string()),
                Some(s) if s.len() < 32 => {
                    return Err("JWT_SECRET must be at least 32 characters".to_string())
                }
                _ => {}
            }
        }

        if self.top_k == 0 {
            return Err("TOP_K must be at least 1".to_string());
        }

        if self.max_increment == 0 {
            return Err("MAX_INCREMENT must be at least 1".to_string());
        }

        if self.top_l1_ttl_ms > self.top_ttl_secs * 1000 {
            return Err("TOP_L1_TTL_MS must not exceed TOP_TTL_SECS".to_string());
        }

        Ok(())
    }
}
