//! Process-local cache tier
//!
//! DashMap of JSON-encoded values with per-entry absolute expiry and
//! atomic hit/miss counters. All operations are O(1); a background task
//! sweeps expired entries.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct L1Entry {
    value: String,
    expires_at: Instant,
}

/// Statistics for the local tier
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct L1Stats {
    pub entries: usize,
    pub memory_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl L1Stats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Process-local cache with per-entry expiry
pub struct L1Cache {
    entries: DashMap<String, L1Entry>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl L1Cache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get an unexpired value. O(1).
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            let size = entry.value.len() as u64;
            drop(entry);
            self.entries.remove(key);
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with a TTL. O(1).
    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        let size = value.len() as u64;
        let entry = L1Entry {
            value,
            expires_at: Instant::now() + ttl,
        };

        if let Some((_, old)) = self.entries.remove(key) {
            self.total_bytes
                .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }

        self.entries.insert(key.to_string(), entry);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Remove a key. O(1).
    pub fn remove(&self, key: &str) -> bool {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.total_bytes
                .fetch_sub(entry.value.len() as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Sweep expired entries; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| now >= e.expires_at)
            .map(|e| (e.key().clone(), e.value.len() as u64))
            .collect();

        let mut freed = 0u64;
        for (key, size) in &expired {
            if self.entries.remove(key).is_some() {
                freed += size;
            }
        }
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        self.evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        if !expired.is_empty() {
            debug!(expired = expired.len(), "L1 cleanup removed expired entries");
        }
        expired.len()
    }

    pub fn stats(&self) -> L1Stats {
        L1Stats {
            entries: self.entries.len(),
            memory_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that periodically sweeps expired entries
pub fn spawn_cleanup_task(cache: Arc<crate::cache::LayeredCache>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            cache.cleanup_expired();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let cache = L1Cache::new();
        assert!(cache.get("k").is_none());

        cache.set("k", "v".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        assert!(cache.remove("k"));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = L1Cache::new();
        cache.set("k", "v".into(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_stats_track_bytes_and_hits() {
        let cache = L1Cache::new();
        cache.set("a", "12345".into(), Duration::from_secs(60));
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.memory_bytes, 5);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = L1Cache::new();
        cache.set("old", "x".into(), Duration::from_millis(0));
        cache.set("new", "y".into(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_overwrite_updates_bytes() {
        let cache = L1Cache::new();
        cache.set("k", "aaaa".into(), Duration::from_secs(60));
        cache.set("k", "bb".into(), Duration::from_secs(60));
        assert_eq!(cache.stats().memory_bytes, 2);
    }
}
