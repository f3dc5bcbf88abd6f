//! Shared cache tier over Redis
//!
//! Provides TTL'd values, atomic windowed counters for rate limits, and
//! set-if-absent markers for consumed nonces. Every call carries the L2
//! deadline; a timeout is reported as `BackendUnavailable` and callers
//! degrade to L1 plus the store.

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::time::Duration;
use tracing::info;

use crate::error::{PodiumError, Result};

/// Shared cache tier
pub struct L2Cache {
    manager: ConnectionManager,
    timeout: Duration,
    rate_script: Script,
}

impl L2Cache {
    /// Connect to Redis with a bounded connection timeout
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500));

        let client = redis::Client::open(redis_url)
            .map_err(|e| PodiumError::BackendUnavailable(format!("Invalid Redis URL: {e}")))?;
        let manager = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(|e| PodiumError::BackendUnavailable(format!("Redis connect failed: {e}")))?;

        info!("Connected to Redis at {}", redis_url);

        // INCR and EXPIRE must be one atomic step so a counter can never
        // survive its window
        let rate_script = Script::new(
            r#"
            local count = redis.call("INCR", KEYS[1])
            if count == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            local ttl = redis.call("TTL", KEYS[1])
            return {count, ttl}
        "#,
        );

        Ok(Self {
            manager,
            timeout,
            rate_script,
        })
    }

    async fn deadline<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(PodiumError::from),
            Err(_) => Err(PodiumError::BackendUnavailable(
                "shared cache deadline exceeded".into(),
            )),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.deadline(async move { con.get::<_, Option<String>>(key).await })
            .await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        let value = value.to_string();
        let secs = ttl.as_secs().max(1);
        self.deadline(async move { con.set_ex::<_, _, ()>(key, value, secs).await })
            .await
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.deadline(async move { con.del::<_, ()>(key).await })
            .await
    }

    /// Atomically bump a windowed counter.
    ///
    /// Returns `(count, remaining_secs)` where `remaining_secs` is the
    /// time until the window resets.
    pub async fn incr_window(&self, key: &str, window: Duration) -> Result<(u64, u64)> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        let window_secs = window.as_secs().max(1);
        let script = &self.rate_script;
        let (count, ttl): (i64, i64) = self
            .deadline(async move {
                let result: (i64, i64) = script
                    .key(&key)
                    .arg(window_secs)
                    .invoke_async(&mut con)
                    .await?;
                Ok(result)
            })
            .await?;
        Ok((count.max(0) as u64, ttl.max(0) as u64))
    }

    /// Set a marker key if absent; no-op if it already exists
    pub async fn set_marker(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        let secs = ttl.as_secs().max(1);
        self.deadline(async move {
            redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(secs)
                .query_async::<Option<String>>(&mut con)
                .await
        })
        .await?;
        Ok(())
    }

    /// Existence probe
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let key = key.to_string();
        self.deadline(async move { con.exists::<_, bool>(key).await })
            .await
    }

    /// Liveness probe for health reporting
    pub async fn ping(&self) -> bool {
        let mut con = self.manager.clone();
        self.deadline(async move {
            redis::cmd("PING").query_async::<String>(&mut con).await
        })
        .await
        .is_ok()
    }
}
