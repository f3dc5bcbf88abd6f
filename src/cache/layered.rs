//! Layered cache facade
//!
//! Combines the L1 and optional L2 tiers behind one read/write contract
//! and owns the single-flight registry that collapses concurrent misses
//! for the same key into one loader invocation.

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{L1Cache, L1Stats, L2Cache};
use crate::error::{PodiumError, Result};

/// Combined cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub l1: L1Stats,
    pub l1_hit_rate: f64,
    pub l2_attached: bool,
    pub in_flight: usize,
}

enum Flight {
    Leader(broadcast::Sender<std::result::Result<String, String>>),
    Waiter(broadcast::Receiver<std::result::Result<String, String>>),
}

/// Removes the in-flight entry even if the leader is cancelled mid-load,
/// so later misses elect a fresh leader instead of waiting forever.
struct FlightGuard<'a> {
    registry: &'a DashMap<String, broadcast::Sender<std::result::Result<String, String>>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

/// Two-tier cache with single-flight loading
pub struct LayeredCache {
    l1: L1Cache,
    l2: Option<L2Cache>,
    in_flight: DashMap<String, broadcast::Sender<std::result::Result<String, String>>>,
    /// Process-local rate counters used when L2 is unavailable
    rate_fallback: DashMap<String, (u64, Instant)>,
}

impl LayeredCache {
    pub fn new(l2: Option<L2Cache>) -> Self {
        Self {
            l1: L1Cache::new(),
            l2,
            in_flight: DashMap::new(),
            rate_fallback: DashMap::new(),
        }
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    /// Read through the tiers, loading on miss under single-flight.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        l1_ttl: Duration,
        l2_ttl: Duration,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(json) = self.l1.get(key) {
            return decode(&json);
        }

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(json)) => {
                    self.l1.set(key, json.clone(), l1_ttl);
                    return decode(&json);
                }
                Ok(None) => {}
                Err(e) => {
                    // L2 down: degrade to loader path
                    debug!(key = key, error = %e, "L2 read failed, falling through");
                }
            }
        }

        let flight = {
            use dashmap::mapref::entry::Entry;
            match self.in_flight.entry(key.to_string()) {
                Entry::Occupied(e) => Flight::Waiter(e.get().subscribe()),
                Entry::Vacant(v) => {
                    let (tx, _) = broadcast::channel(1);
                    v.insert(tx.clone());
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Waiter(mut rx) => match rx.recv().await {
                Ok(Ok(json)) => decode(&json),
                Ok(Err(msg)) => Err(PodiumError::BackendUnavailable(msg)),
                // Leader was cancelled; load without coalescing
                Err(_) => self.load_and_fill(key, l1_ttl, l2_ttl, loader).await.map(|(v, _)| v),
            },
            Flight::Leader(tx) => {
                let guard = FlightGuard {
                    registry: &self.in_flight,
                    key: key.to_string(),
                };
                let result = self.load_and_fill(key, l1_ttl, l2_ttl, loader).await;
                drop(guard);
                match result {
                    Ok((value, json)) => {
                        let _ = tx.send(Ok(json));
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    async fn load_and_fill<T, F, Fut>(
        &self,
        key: &str,
        l1_ttl: Duration,
        l2_ttl: Duration,
        loader: F,
    ) -> Result<(T, String)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = loader().await?;
        let json = serde_json::to_string(&value)?;

        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set(key, &json, l2_ttl).await {
                warn!(key = key, error = %e, "L2 populate failed");
            }
        }
        self.l1.set(key, json.clone(), l1_ttl);

        Ok((value, json))
    }

    /// Write a value directly to both tiers (L2 first, then L1)
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        l1_ttl: Duration,
        l2_ttl: Duration,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        if let Some(l2) = &self.l2 {
            l2.set(key, &json, l2_ttl).await?;
        }
        self.l1.set(key, json, l1_ttl);
        Ok(())
    }

    /// Delete keys from L2 first, then L1.
    ///
    /// The order matters: a reader that missed L1 and is about to
    /// repopulate must observe the L2 deletion and go to the store.
    /// L1 removal always runs; the first L2 failure is reported after
    /// all keys are processed.
    pub async fn invalidate(&self, keys: &[&str]) -> Result<()> {
        let mut first_err = None;
        for key in keys {
            if let Some(l2) = &self.l2 {
                if let Err(e) = l2.del(key).await {
                    warn!(key = key, error = %e, "L2 invalidation failed");
                    first_err.get_or_insert(e);
                }
            }
            self.l1.remove(key);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Atomic increment-and-check against a windowed limit.
    ///
    /// Uses the shared counter when L2 is attached; otherwise a
    /// process-local window (resets on restart).
    pub async fn check_rate(&self, key: &str, max: u64, window: Duration) -> Result<()> {
        if let Some(l2) = &self.l2 {
            match l2.incr_window(key, window).await {
                Ok((count, remaining)) => {
                    if count > max {
                        return Err(PodiumError::RateLimited {
                            retry_after_secs: remaining.max(1),
                        });
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(key = key, error = %e, "L2 rate counter failed, using local window");
                }
            }
        }

        let now = Instant::now();
        let mut entry = self
            .rate_fallback
            .entry(key.to_string())
            .or_insert((0, now + window));
        if now >= entry.1 {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        if entry.0 > max {
            let retry = entry.1.saturating_duration_since(now).as_secs().max(1);
            return Err(PodiumError::RateLimited {
                retry_after_secs: retry,
            });
        }
        Ok(())
    }

    /// Mark a nonce as consumed in L2. Best-effort: failures are logged,
    /// the store's unique index remains the authority.
    pub async fn mark_nonce(&self, key: &str, ttl: Duration) {
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set_marker(key, ttl).await {
                warn!(key = key, error = %e, "Nonce marker write failed");
            }
        }
    }

    /// Fast-path duplicate probe. Best-effort: any L2 problem reads as
    /// "not seen" and the store transaction decides.
    pub async fn nonce_seen(&self, key: &str) -> bool {
        match &self.l2 {
            Some(l2) => l2.exists(key).await.unwrap_or(false),
            None => false,
        }
    }

    /// Drop every L1 entry. L2 entries expire on their own TTLs; derived
    /// keys the engine knows about are invalidated explicitly.
    pub fn clear_local(&self) -> usize {
        let count = self.l1.stats().entries;
        self.l1.clear();
        count
    }

    pub fn cleanup_expired(&self) -> usize {
        self.l1.cleanup_expired()
    }

    pub async fn l2_healthy(&self) -> Option<bool> {
        match &self.l2 {
            Some(l2) => Some(l2.ping().await),
            None => None,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1.stats();
        let l1_hit_rate = l1.hit_rate();
        CacheStats {
            l1,
            l1_hit_rate,
            l2_attached: self.l2.is_some(),
            in_flight: self.in_flight.len(),
        }
    }
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| PodiumError::Internal(format!("Cache decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn l1_only() -> Arc<LayeredCache> {
        Arc::new(LayeredCache::new(None))
    }

    #[tokio::test]
    async fn test_get_or_load_populates_l1() {
        let cache = l1_only();

        let value: u64 = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                Ok(42u64)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // Second read is a pure L1 hit; the loader must not run
        let value: u64 = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                panic!("loader must not be invoked on a warm key")
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_misses() {
        let cache = l1_only();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(
                        "hot",
                        Duration::from_secs(10),
                        Duration::from_secs(30),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7u64)
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        // All misses collapse into one loader run (a cancelled-leader
        // fallback could add a second; never one per caller)
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = l1_only();

        let v: u64 = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                Ok(1u64)
            })
            .await
            .unwrap();
        assert_eq!(v, 1);

        cache.invalidate(&["k"]).await.unwrap();

        let v: u64 = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                Ok(2u64)
            })
            .await
            .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_loader_error_propagates() {
        let cache = l1_only();
        let result: Result<u64> = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                Err(PodiumError::BackendUnavailable("store down".into()))
            })
            .await;
        assert!(matches!(result, Err(PodiumError::BackendUnavailable(_))));

        // Failure must not poison the key
        let v: u64 = cache
            .get_or_load("k", Duration::from_secs(10), Duration::from_secs(30), || async {
                Ok(3u64)
            })
            .await
            .unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn test_local_rate_window() {
        let cache = l1_only();
        let window = Duration::from_secs(60);

        for _ in 0..10 {
            cache.check_rate("rl:score:alice", 10, window).await.unwrap();
        }
        let err = cache
            .check_rate("rl:score:alice", 10, window)
            .await
            .unwrap_err();
        match err {
            PodiumError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {other}"),
        }

        // Another subject is unaffected
        cache.check_rate("rl:score:bob", 10, window).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonce_fast_path_without_l2_is_permissive() {
        let cache = l1_only();
        cache.mark_nonce("nonce:seen:x", Duration::from_secs(60)).await;
        // Without L2 the fast path never claims "seen"; the store decides
        assert!(!cache.nonce_seen("nonce:seen:x").await);
    }

    #[tokio::test]
    async fn test_set_then_read_back() {
        let cache = l1_only();
        cache
            .set("k", &vec![1u64, 2, 3], Duration::from_secs(5), Duration::from_secs(30))
            .await
            .unwrap();
        let v: Vec<u64> = cache
            .get_or_load("k", Duration::from_secs(5), Duration::from_secs(30), || async {
                panic!("value was just written")
            })
            .await
            .unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_clear_local() {
        let cache = l1_only();
        cache
            .set("k", &1u64, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cache.clear_local(), 1);
        assert_eq!(cache.stats().l1.entries, 0);
    }
}
