//! Action token issue and verification
//!
//! An action token is a single-use increment authorization:
//! `{ nonce, increment, issued_at, mac }` where the MAC binds the first
//! three fields under the server secret (HMAC-SHA256). Verification
//! short-circuits in a fixed order: shape, MAC, freshness, rate limit,
//! then a best-effort duplicate probe against the shared cache. The
//! store's unique nonce index remains the duplicate authority.

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{keys, LayeredCache};
use crate::error::{PodiumError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Single-use increment authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionToken {
    pub nonce: String,
    pub increment: u64,
    /// Issue time, Unix milliseconds
    pub issued_at: i64,
    /// Hex-encoded HMAC-SHA256 over nonce, increment, issued_at
    pub mac: String,
}

/// Per-scope rate-limit configuration
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub score_max: u64,
    pub score_window: Duration,
    pub auth_max: u64,
    pub auth_window: Duration,
    pub admin_max: u64,
    pub admin_window: Duration,
}

/// Issues and verifies action tokens; owns the `rl:*` and
/// `nonce:seen:*` cache keys.
pub struct ActionVerifier {
    secret: Vec<u8>,
    max_increment: u64,
    freshness_window: Duration,
    nonce_marker_ttl: Duration,
    cache: Arc<LayeredCache>,
    limits: RateLimits,
}

impl ActionVerifier {
    pub fn new(
        secret: &str,
        max_increment: u64,
        freshness_window: Duration,
        nonce_marker_ttl: Duration,
        cache: Arc<LayeredCache>,
        limits: RateLimits,
    ) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            max_increment,
            freshness_window,
            nonce_marker_ttl,
            cache,
            limits,
        }
    }

    /// Issue a fresh token for an authenticated identity.
    ///
    /// No state is written at issuance; only acceptances reach the
    /// action log.
    pub fn issue(&self, _identity: &str, increment: u64) -> Result<ActionToken> {
        self.check_increment_bounds(increment)?;

        let mut entropy = [0u8; 16];
        rand::thread_rng().fill(&mut entropy[..]);
        let nonce = hex::encode(entropy);

        let issued_at = chrono::Utc::now().timestamp_millis();
        let mac = self.compute_mac(&nonce, increment, issued_at);

        Ok(ActionToken {
            nonce,
            increment,
            issued_at,
            mac,
        })
    }

    /// Verify a presented token. Checks run in order and stop at the
    /// first failure; nothing is mutated except the rate counter.
    pub async fn verify(&self, identity: &str, token: &ActionToken) -> Result<()> {
        // 1. Shape
        if token.nonce.is_empty() || token.mac.is_empty() {
            return Err(PodiumError::MissingFields("nonce, mac".into()));
        }
        self.check_increment_bounds(token.increment)?;

        // 2. MAC, constant-time
        if !self.verify_mac(token) {
            return Err(PodiumError::InvalidActionHash("MAC mismatch".into()));
        }

        // 3. Freshness
        let now = chrono::Utc::now().timestamp_millis();
        let age = (now - token.issued_at).unsigned_abs();
        if age > self.freshness_window.as_millis() as u64 {
            return Err(PodiumError::InvalidActionHash("action token expired".into()));
        }

        // 4. Rate limit
        self.cache
            .check_rate(
                &keys::rate_key("score", identity),
                self.limits.score_max,
                self.limits.score_window,
            )
            .await?;

        // 5. Duplicate fast path (optimization only)
        if self.cache.nonce_seen(&keys::nonce_key(&token.nonce)).await {
            return Err(PodiumError::DuplicateAction);
        }

        Ok(())
    }

    /// Record a consumed nonce in the shared cache after commit
    pub async fn mark_consumed(&self, nonce: &str) {
        self.cache
            .mark_nonce(&keys::nonce_key(nonce), self.nonce_marker_ttl)
            .await;
    }

    /// Rate limit for authentication attempts, keyed by source address
    pub async fn check_auth_rate(&self, addr: &str) -> Result<()> {
        self.cache
            .check_rate(
                &keys::rate_key("auth", addr),
                self.limits.auth_max,
                self.limits.auth_window,
            )
            .await
    }

    /// Rate limit for administrative operations, keyed by identity
    pub async fn check_admin_rate(&self, identity: &str) -> Result<()> {
        self.cache
            .check_rate(
                &keys::rate_key("admin", identity),
                self.limits.admin_max,
                self.limits.admin_window,
            )
            .await
    }

    fn check_increment_bounds(&self, increment: u64) -> Result<()> {
        if increment == 0 || increment > self.max_increment {
            return Err(PodiumError::InvalidIncrement(format!(
                "increment must be between 1 and {}",
                self.max_increment
            )));
        }
        Ok(())
    }

    fn compute_mac(&self, nonce: &str, increment: u64, issued_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(nonce.as_bytes());
        mac.update(b":");
        mac.update(increment.to_string().as_bytes());
        mac.update(b":");
        mac.update(issued_at.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_mac(&self, token: &ActionToken) -> bool {
        let expected = match hex::decode(&token.mac) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(token.nonce.as_bytes());
        mac.update(b":");
        mac.update(token.increment.to_string().as_bytes());
        mac.update(b":");
        mac.update(token.issued_at.to_string().as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}
