//! Score engine
//!
//! The write path: admit an action, mutate the store, fix up the cache,
//! emit a ranking event. Also serves the cached read paths for the
//! top-K view and per-identity rank queries.
//!
//! Ordering guarantees kept here:
//! - the cache is refilled synchronously before `apply` returns, so a
//!   caller that immediately reads the scoreboard sees its own write;
//! - the broadcast is handed the already-refilled ranking, strictly
//!   after the store commit;
//! - post-commit fix-up runs on a spawned task, so a client that
//!   disconnects mid-request cannot strand a committed write with a
//!   stale cache.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::actions::{ActionToken, ActionVerifier};
use crate::broadcast::{Broadcaster, ScoreboardRow, ServerMessage};
use crate::cache::{keys, LayeredCache};
use crate::error::{PodiumError, Result};
use crate::identity::IdentityService;
use crate::store::{ActionRecord, RankedEntry, ScoreRecord, ScoreStore};

/// Engine tuning derived from configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub top_k: usize,
    /// L1 TTL for ranking and score entries; kept small so staleness
    /// after a concurrent invalidate is bounded tightly
    pub l1_ttl: Duration,
    pub top_l2_ttl: Duration,
    pub score_l2_ttl: Duration,
    pub total_ttl: Duration,
}

/// Result of an accepted increment
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyOutcome {
    pub identity: String,
    pub new_score: u64,
    pub rank: u64,
}

/// Per-identity rank query result
#[derive(Debug, Clone)]
pub struct UserRank {
    pub identity: String,
    pub score: u64,
    pub rank: u64,
    pub total: u64,
}

/// Write path and cached read paths
pub struct ScoreEngine {
    store: Arc<ScoreStore>,
    cache: Arc<LayeredCache>,
    verifier: Arc<ActionVerifier>,
    broadcaster: Arc<Broadcaster>,
    identity: Arc<IdentityService>,
    config: EngineConfig,
}

impl ScoreEngine {
    pub fn new(
        store: Arc<ScoreStore>,
        cache: Arc<LayeredCache>,
        verifier: Arc<ActionVerifier>,
        broadcaster: Arc<Broadcaster>,
        identity: Arc<IdentityService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            verifier,
            broadcaster,
            identity,
            config,
        }
    }

    /// Admit an action and apply its increment.
    ///
    /// On `DuplicateAction` from the store nothing is invalidated. Any
    /// failure after the commit leaves the write authoritative: cache
    /// invalidation is attempted, refill may be skipped, and the
    /// broadcast still goes out so subscribers reconcile.
    pub async fn apply(
        self: &Arc<Self>,
        identity: &str,
        token: &ActionToken,
        source_address: Option<String>,
    ) -> Result<ApplyOutcome> {
        self.verifier.verify(identity, token).await?;

        let entry = ActionRecord {
            nonce: token.nonce.clone(),
            identity: identity.to_string(),
            increment: token.increment,
            issued_at: token.issued_at,
            accepted_at: chrono::Utc::now().timestamp_millis(),
            source_address,
        };

        let (new_score, _commit_ts) = self.store.increment(entry).await?;

        // Committed. Run the fix-up on its own task so cancellation of
        // this request cannot skip it; awaiting the handle returns the
        // caller's rank for the response.
        let engine = Arc::clone(self);
        let identity_owned = identity.to_string();
        let nonce = token.nonce.clone();
        let rank = tokio::spawn(async move { engine.finish_commit(&identity_owned, &nonce).await })
            .await
            .map_err(|e| PodiumError::Internal(format!("post-commit task failed: {e}")))?;

        Ok(ApplyOutcome {
            identity: identity.to_string(),
            new_score,
            rank,
        })
    }

    /// Post-commit fix-up: nonce marker, invalidation, synchronous
    /// refill, rank computation, broadcast. The write already committed,
    /// so cache problems degrade here rather than roll anything back.
    async fn finish_commit(&self, identity: &str, nonce: &str) -> u64 {
        self.verifier.mark_consumed(nonce).await;

        let top_key = keys::top_key(self.config.top_k);
        let score_key = keys::score_key(identity);
        if let Err(e) = self.cache.invalidate(&[&top_key, &score_key]).await {
            warn!(identity = identity, error = %e, "Cache invalidation degraded (L2 unreachable)");
        }

        let ranking = self.store.get_top_k(self.config.top_k);
        if let Err(e) = self
            .cache
            .set(&top_key, &ranking, self.config.l1_ttl, self.config.top_l2_ttl)
            .await
        {
            warn!(error = %e, "Ranking refill skipped");
        }

        let rank = ranking
            .iter()
            .find(|r| r.identity == identity)
            .map(|r| r.rank)
            .or_else(|| self.store.rank_of(identity))
            .unwrap_or_else(|| self.store.count_identities().max(1));

        self.broadcast_ranking(ranking);
        rank
    }

    /// Emit the given ranking to every subscriber
    fn broadcast_ranking(&self, ranking: Vec<RankedEntry>) {
        let scoreboard: Vec<ScoreboardRow> = ranking
            .into_iter()
            .map(|r| ScoreboardRow {
                rank: r.rank,
                username: self
                    .identity
                    .username_of(&r.identity)
                    .unwrap_or_else(|| r.identity.clone()),
                identity: r.identity,
                score: r.score,
                last_updated: ms_to_rfc3339(r.last_updated),
            })
            .collect();

        let delivered = self.broadcaster.emit(ServerMessage::ScoreboardUpdate {
            scoreboard,
            total_users: self.store.count_identities(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        });
        debug!(delivered = delivered, "Ranking update fanned out");
    }

    /// Broadcast the current ranking outside the write path (used after
    /// registration so subscribers' total_users stays fresh).
    pub fn broadcast_current(&self) {
        let ranking = self.store.get_top_k(self.config.top_k);
        self.broadcast_ranking(ranking);
    }

    /// Post-registration fix-up: the population changed, so the cached
    /// count and any negative score entry for the new identity must go,
    /// then subscribers get a refreshed snapshot.
    pub async fn on_identity_created(&self, identity: &str) {
        let total_key = keys::total_key();
        let score_key = keys::score_key(identity);
        if let Err(e) = self.cache.invalidate(&[&total_key, &score_key]).await {
            warn!(identity = identity, error = %e, "Post-registration invalidation degraded");
        }
        self.broadcast_current();
    }

    /// Top-k ranking. The configured K is served through the cache with
    /// a single-flight loader; any other k bypasses the cache.
    pub async fn top(&self, k: usize) -> Result<Vec<RankedEntry>> {
        if k != self.config.top_k {
            return Ok(self.store.get_top_k(k));
        }

        let store = Arc::clone(&self.store);
        self.cache
            .get_or_load(
                &keys::top_key(k),
                self.config.l1_ttl,
                self.config.top_l2_ttl,
                move || async move { Ok(store.get_top_k(k)) },
            )
            .await
    }

    /// Score, rank, and population for one identity
    pub async fn user_rank(&self, identity: &str) -> Result<UserRank> {
        let store = Arc::clone(&self.store);
        let id = identity.to_string();
        let record: Option<ScoreRecord> = self
            .cache
            .get_or_load(
                &keys::score_key(identity),
                self.config.l1_ttl,
                self.config.score_l2_ttl,
                move || async move { Ok(store.get_score(&id)) },
            )
            .await?;
        let record = record.ok_or_else(|| PodiumError::UserNotFound(identity.to_string()))?;

        let rank = self
            .store
            .rank_of(identity)
            .ok_or_else(|| PodiumError::UserNotFound(identity.to_string()))?;

        let total = self.total_identities().await?;

        Ok(UserRank {
            identity: identity.to_string(),
            score: record.score,
            rank,
            total,
        })
    }

    /// Identity count through the cache (coarse TTL)
    pub async fn total_identities(&self) -> Result<u64> {
        let store = Arc::clone(&self.store);
        self.cache
            .get_or_load(
                &keys::total_key(),
                self.config.l1_ttl,
                self.config.total_ttl,
                move || async move { Ok(store.count_identities()) },
            )
            .await
    }

    /// Preload the derived views. Returns how many entries were cached.
    pub async fn warm(&self) -> Result<u64> {
        let ranking = self.store.get_top_k(self.config.top_k);
        let mut cached = 0u64;

        self.cache
            .set(
                &keys::top_key(self.config.top_k),
                &ranking,
                self.config.l1_ttl,
                self.config.top_l2_ttl,
            )
            .await?;
        cached += 1;

        for row in &ranking {
            if let Some(record) = self.store.get_score(&row.identity) {
                self.cache
                    .set(
                        &keys::score_key(&row.identity),
                        &Some(record),
                        self.config.l1_ttl,
                        self.config.score_l2_ttl,
                    )
                    .await?;
                cached += 1;
            }
        }

        self.cache
            .set(
                &keys::total_key(),
                &self.store.count_identities(),
                self.config.l1_ttl,
                self.config.total_ttl,
            )
            .await?;
        cached += 1;

        Ok(cached)
    }

    /// Drop the derived views from both tiers. Returns the number of L1
    /// entries removed.
    pub async fn clear_cache(&self) -> Result<u64> {
        let top_key = keys::top_key(self.config.top_k);
        let total_key = keys::total_key();
        if let Err(e) = self.cache.invalidate(&[&top_key, &total_key]).await {
            warn!(error = %e, "L2 clear degraded");
        }
        Ok(self.cache.clear_local() as u64)
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }
}

/// Render a commit timestamp for the wire
pub fn ms_to_rfc3339(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RateLimits;
    use crate::auth::JwtValidator;
    use crate::broadcast::Broadcaster;

    fn rate_limits() -> RateLimits {
        RateLimits {
            score_max: 100,
            score_window: Duration::from_secs(60),
            auth_max: 100,
            auth_window: Duration::from_secs(60),
            admin_max: 100,
            admin_window: Duration::from_secs(60),
        }
    }

    async fn engine() -> (Arc<ScoreEngine>, Arc<Broadcaster>, Arc<IdentityService>) {
        let cache = Arc::new(LayeredCache::new(None));
        let store = Arc::new(ScoreStore::memory_only(Duration::from_secs(2)));
        let verifier = Arc::new(ActionVerifier::new(
            "engine-test-secret",
            1000,
            Duration::from_secs(300),
            Duration::from_secs(360),
            Arc::clone(&cache),
            rate_limits(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(64));
        let jwt = JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            3600,
        )
        .unwrap();
        let identity = Arc::new(IdentityService::memory_only(jwt, Duration::from_secs(2)));

        let engine = Arc::new(ScoreEngine::new(
            Arc::clone(&store),
            cache,
            Arc::clone(&verifier),
            Arc::clone(&broadcaster),
            Arc::clone(&identity),
            EngineConfig {
                top_k: 10,
                l1_ttl: Duration::from_secs(1),
                top_l2_ttl: Duration::from_secs(30),
                score_l2_ttl: Duration::from_secs(300),
                total_ttl: Duration::from_secs(60),
            },
        ));
        (engine, broadcaster, identity)
    }

    async fn provision(engine: &Arc<ScoreEngine>, identity: &Arc<IdentityService>, name: &str) -> String {
        let (_, user) = identity
            .register(name, &format!("{name}@example.com"), "a-strong-password")
            .await
            .unwrap();
        engine.store.create_identity(&user.identity).await.unwrap();
        user.identity
    }

    #[tokio::test]
    async fn test_apply_returns_score_and_rank() {
        let (engine, _, identity) = engine().await;
        let alice = provision(&engine, &identity, "alice").await;

        let token = engine.verifier.issue(&alice, 50).unwrap();
        let outcome = engine.apply(&alice, &token, None).await.unwrap();

        assert_eq!(outcome.new_score, 50);
        assert_eq!(outcome.rank, 1);
    }

    #[tokio::test]
    async fn test_duplicate_apply_rejected() {
        let (engine, _, identity) = engine().await;
        let alice = provision(&engine, &identity, "alice").await;

        let token = engine.verifier.issue(&alice, 50).unwrap();
        engine.apply(&alice, &token, None).await.unwrap();

        let err = engine.apply(&alice, &token, None).await.unwrap_err();
        assert!(matches!(err, PodiumError::DuplicateAction));

        // Score unchanged after the replay
        let rank = engine.user_rank(&alice).await.unwrap();
        assert_eq!(rank.score, 50);
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let (engine, _, identity) = engine().await;
        let alice = provision(&engine, &identity, "alice").await;
        let bob = provision(&engine, &identity, "bob").await;

        // Warm the cache with the pre-write ranking
        let top = engine.top(10).await.unwrap();
        assert!(top.iter().all(|r| r.score == 0));

        let token = engine.verifier.issue(&alice, 70).unwrap();
        engine.apply(&alice, &token, None).await.unwrap();

        // The very next read must reflect the write
        let top = engine.top(10).await.unwrap();
        assert_eq!(top[0].identity, alice);
        assert_eq!(top[0].score, 70);

        let token = engine.verifier.issue(&bob, 90).unwrap();
        engine.apply(&bob, &token, None).await.unwrap();

        let top = engine.top(10).await.unwrap();
        assert_eq!(top[0].identity, bob);
    }

    #[tokio::test]
    async fn test_broadcast_after_apply_matches_scoreboard() {
        let (engine, broadcaster, identity) = engine().await;
        let carol = provision(&engine, &identity, "carol").await;

        let (_, mut rx) = broadcaster.subscribe();
        rx.recv().await.unwrap(); // greeting

        let token = engine.verifier.issue(&carol, 30).unwrap();
        engine.apply(&carol, &token, None).await.unwrap();

        let msg = rx.recv().await.unwrap();
        match msg.as_ref() {
            ServerMessage::ScoreboardUpdate {
                scoreboard,
                total_users,
                ..
            } => {
                assert_eq!(*total_users, 1);
                assert_eq!(scoreboard[0].username, "carol");
                assert_eq!(scoreboard[0].score, 30);

                let top = engine.top(10).await.unwrap();
                assert_eq!(top[0].score, scoreboard[0].score);
            }
            other => panic!("expected scoreboard_update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_user_rank_outside_top_k() {
        let (engine, _, identity) = engine().await;

        // Fill the top-10 with higher scores, then one below the cut
        for i in 0..10 {
            let id = provision(&engine, &identity, &format!("user{i}")).await;
            let token = engine.verifier.issue(&id, 100 + i).unwrap();
            engine.apply(&id, &token, None).await.unwrap();
        }
        let low = provision(&engine, &identity, "low").await;
        let token = engine.verifier.issue(&low, 5).unwrap();
        engine.apply(&low, &token, None).await.unwrap();

        let rank = engine.user_rank(&low).await.unwrap();
        assert_eq!(rank.rank, 11);
        assert_eq!(rank.total, 11);
        assert_eq!(rank.score, 5);

        let top = engine.top(10).await.unwrap();
        assert_eq!(top.len(), 10);
        assert!(top.iter().all(|r| r.identity != low));
    }

    #[tokio::test]
    async fn test_unknown_identity_404() {
        let (engine, _, _) = engine().await;
        let err = engine.user_rank("nobody").await.unwrap_err();
        assert!(matches!(err, PodiumError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_nonstandard_k_bypasses_cache() {
        let (engine, _, identity) = engine().await;
        let alice = provision(&engine, &identity, "alice").await;
        let token = engine.verifier.issue(&alice, 10).unwrap();
        engine.apply(&alice, &token, None).await.unwrap();

        let top3 = engine.top(3).await.unwrap();
        assert_eq!(top3.len(), 1);
        assert!(top3.len() <= 3);
    }

    #[tokio::test]
    async fn test_warm_and_clear() {
        let (engine, _, identity) = engine().await;
        let alice = provision(&engine, &identity, "alice").await;
        let token = engine.verifier.issue(&alice, 10).unwrap();
        engine.apply(&alice, &token, None).await.unwrap();

        let cached = engine.warm().await.unwrap();
        assert!(cached >= 3);

        let cleared = engine.clear_cache().await.unwrap();
        assert!(cleared >= 1);
    }
}
