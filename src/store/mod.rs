//! Score store
//!
//! Durable mapping `identity → (score, last_updated)` plus the
//! append-only action log keyed by nonce.
//!
//! The store keeps a full in-process projection in DashMaps (fast reads,
//! read-after-write) and writes through to MongoDB when a backend is
//! attached. In memory-only mode (dev, tests) the same API is served
//! entirely from the maps.
//!
//! Atomicity: the nonce reservation is an atomic map insert and the
//! per-identity mutex serializes increments for one identity. With
//! MongoDB attached, the action-log insert and score update run in one
//! multi-document transaction, and the unique nonce index remains the
//! duplicate authority across restarts.

use bson::doc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::{is_duplicate_key, MongoClient, MongoCollection};
use crate::db::schemas::{
    ActionLogDoc, ScoreDoc, ACTION_LOG_COLLECTION, SCORE_COLLECTION,
};
use crate::error::{PodiumError, Result};

/// Current score state for one identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreRecord {
    pub identity: String,
    pub score: u64,
    /// Commit time of the last accepted write (Unix milliseconds, monotonic)
    pub last_updated: i64,
}

/// One row of the top-K ranking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankedEntry {
    pub rank: u64,
    pub identity: String,
    pub score: u64,
    pub last_updated: i64,
}

/// Accepted action payload inserted into the log alongside the increment
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub nonce: String,
    pub identity: String,
    pub increment: u64,
    pub issued_at: i64,
    pub accepted_at: i64,
    pub source_address: Option<String>,
}

struct MongoBackend {
    client: MongoClient,
    scores: MongoCollection<ScoreDoc>,
    actions: MongoCollection<ActionLogDoc>,
}

/// Score and action-log store
pub struct ScoreStore {
    scores: DashMap<String, ScoreRecord>,
    /// Nonces consumed in-process; reservation here is the atomic gate
    nonces: DashMap<String, ()>,
    /// Per-identity write serialization
    identity_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Logical commit clock, strictly increasing
    clock: AtomicI64,
    backend: Option<MongoBackend>,
    timeout: Duration,
}

impl ScoreStore {
    /// Create a memory-only store (dev mode and tests)
    pub fn memory_only(timeout: Duration) -> Self {
        Self {
            scores: DashMap::new(),
            nonces: DashMap::new(),
            identity_locks: DashMap::new(),
            clock: AtomicI64::new(0),
            backend: None,
            timeout,
        }
    }

    /// Create a MongoDB-backed store and load the in-process projection.
    ///
    /// `nonce_horizon` bounds how far back consumed nonces are preloaded;
    /// older nonces are still caught by the unique index on insert.
    pub async fn with_mongo(
        client: MongoClient,
        timeout: Duration,
        nonce_horizon: Duration,
    ) -> Result<Self> {
        let scores_coll = client.collection::<ScoreDoc>(SCORE_COLLECTION).await?;
        let actions_coll = client.collection::<ActionLogDoc>(ACTION_LOG_COLLECTION).await?;

        let store = Self {
            scores: DashMap::new(),
            nonces: DashMap::new(),
            identity_locks: DashMap::new(),
            clock: AtomicI64::new(0),
            backend: Some(MongoBackend {
                client,
                scores: scores_coll,
                actions: actions_coll,
            }),
            timeout,
        };

        store.load(nonce_horizon).await?;
        Ok(store)
    }

    async fn load(&self, nonce_horizon: Duration) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };

        let docs = backend.scores.find_all().await?;
        let mut max_ts = 0i64;
        for doc in docs {
            max_ts = max_ts.max(doc.last_updated);
            self.scores.insert(
                doc.identity.clone(),
                ScoreRecord {
                    identity: doc.identity,
                    score: doc.score.max(0) as u64,
                    last_updated: doc.last_updated,
                },
            );
        }
        // Resume the commit clock past everything already persisted
        self.clock.fetch_max(max_ts, Ordering::SeqCst);

        let horizon = chrono::Utc::now().timestamp_millis() - nonce_horizon.as_millis() as i64;
        use futures_util::TryStreamExt;
        let cursor = backend
            .actions
            .inner()
            .find(doc! { "accepted_at": { "$gte": horizon } })
            .await?;
        let recent: Vec<ActionLogDoc> = cursor.try_collect().await?;
        let nonce_count = recent.len();
        for action in recent {
            self.nonces.insert(action.nonce, ());
        }

        info!(
            identities = self.scores.len(),
            recent_nonces = nonce_count,
            "Score store loaded from MongoDB"
        );
        Ok(())
    }

    /// Whether a durable backend is attached
    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    /// Next commit timestamp: wall clock forced strictly past the
    /// previous commit so same-millisecond commits stay ordered.
    fn next_commit_ts(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        loop {
            let prev = self.clock.load(Ordering::SeqCst);
            let next = now.max(prev + 1);
            if self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    fn identity_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        self.identity_locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn deadline<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PodiumError::BackendUnavailable("store deadline exceeded".into()))?
    }

    /// Initialize a zero ScoreRecord for an identity. Idempotent.
    pub async fn create_identity(&self, identity: &str) -> Result<()> {
        let created_at = self.next_commit_ts();
        let mut inserted = false;
        self.scores.entry(identity.to_string()).or_insert_with(|| {
            inserted = true;
            ScoreRecord {
                identity: identity.to_string(),
                score: 0,
                last_updated: created_at,
            }
        });

        if let Some(backend) = &self.backend {
            let identity = identity.to_string();
            self.deadline(async {
                backend
                    .scores
                    .inner()
                    .update_one(
                        doc! { "identity": &identity },
                        doc! { "$setOnInsert": {
                            "identity": &identity,
                            "score": 0i64,
                            "last_updated": created_at,
                        }},
                    )
                    .upsert(true)
                    .await?;
                Ok(())
            })
            .await?;
        }

        if inserted {
            info!(identity = identity, "Identity provisioned with zero score");
        }
        Ok(())
    }

    /// Apply one increment and append the action-log entry, atomically.
    ///
    /// Returns the new score and the commit timestamp. Fails with
    /// `DuplicateAction` if the nonce was already consumed and
    /// `UserNotFound` if the identity has no record.
    pub async fn increment(&self, entry: ActionRecord) -> Result<(u64, i64)> {
        let lock = self.identity_lock(&entry.identity);
        let _guard = lock.lock().await;

        let current = self
            .scores
            .get(&entry.identity)
            .map(|r| r.value().clone())
            .ok_or_else(|| PodiumError::UserNotFound(entry.identity.clone()))?;

        // Atomic reservation; the loser of a concurrent race sees Some
        if self.nonces.insert(entry.nonce.clone(), ()).is_some() {
            return Err(PodiumError::DuplicateAction);
        }

        let commit_ts = self.next_commit_ts();
        let new_score = current.score + entry.increment;

        if let Some(backend) = &self.backend {
            let result = self
                .deadline(Self::commit_transaction(backend, &entry, new_score, commit_ts))
                .await;
            match result {
                Ok(()) => {}
                Err(PodiumError::DuplicateAction) => {
                    // Another process consumed this nonce; keep the reservation
                    return Err(PodiumError::DuplicateAction);
                }
                Err(e) => {
                    // Nothing committed: release the reservation for retries
                    self.nonces.remove(&entry.nonce);
                    return Err(e);
                }
            }
        }

        self.scores.insert(
            entry.identity.clone(),
            ScoreRecord {
                identity: entry.identity.clone(),
                score: new_score,
                last_updated: commit_ts,
            },
        );

        Ok((new_score, commit_ts))
    }

    /// One MongoDB transaction binding the log insert and the score update
    async fn commit_transaction(
        backend: &MongoBackend,
        entry: &ActionRecord,
        new_score: u64,
        commit_ts: i64,
    ) -> Result<()> {
        let action_doc = ActionLogDoc {
            nonce: entry.nonce.clone(),
            identity: entry.identity.clone(),
            increment: entry.increment as i64,
            issued_at: entry.issued_at,
            accepted_at: entry.accepted_at,
            source_address: entry.source_address.clone(),
        };

        let mut session = backend.client.inner().start_session().await?;
        session.start_transaction().await?;

        let applied = async {
            backend
                .actions
                .inner()
                .insert_one(&action_doc)
                .session(&mut session)
                .await?;
            backend
                .scores
                .inner()
                .update_one(
                    doc! { "identity": &entry.identity },
                    doc! { "$set": { "score": new_score as i64, "last_updated": commit_ts } },
                )
                .session(&mut session)
                .await?;
            Ok::<(), mongodb::error::Error>(())
        }
        .await;

        match applied {
            Ok(()) => {
                session.commit_transaction().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(error = %abort_err, "Transaction abort failed");
                }
                if is_duplicate_key(&e) {
                    Err(PodiumError::DuplicateAction)
                } else {
                    Err(PodiumError::from(e))
                }
            }
        }
    }

    /// Current record for one identity
    pub fn get_score(&self, identity: &str) -> Option<ScoreRecord> {
        self.scores.get(identity).map(|r| r.value().clone())
    }

    /// Top-k ranking ordered by `(score DESC, last_updated ASC)`.
    /// Reflects every commit that completed before the call.
    pub fn get_top_k(&self, k: usize) -> Vec<RankedEntry> {
        let mut records: Vec<ScoreRecord> =
            self.scores.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.last_updated.cmp(&b.last_updated))
        });
        records.truncate(k);
        records
            .into_iter()
            .enumerate()
            .map(|(i, r)| RankedEntry {
                rank: (i + 1) as u64,
                identity: r.identity,
                score: r.score,
                last_updated: r.last_updated,
            })
            .collect()
    }

    /// Rank of one identity: 1 + |{ better }| where better means a higher
    /// score, or the same score with an earlier commit.
    pub fn rank_of(&self, identity: &str) -> Option<u64> {
        let target = self.get_score(identity)?;
        let better = self
            .scores
            .iter()
            .filter(|r| {
                r.score > target.score
                    || (r.score == target.score && r.last_updated < target.last_updated)
            })
            .count();
        Some(better as u64 + 1)
    }

    /// Existence probe for a nonce, without side effects
    pub async fn has_nonce(&self, nonce: &str) -> Result<bool> {
        if self.nonces.contains_key(nonce) {
            return Ok(true);
        }
        if let Some(backend) = &self.backend {
            let count = self
                .deadline(async { backend.actions.count(doc! { "nonce": nonce }).await })
                .await?;
            return Ok(count > 0);
        }
        Ok(false)
    }

    /// Number of provisioned identities
    pub fn count_identities(&self) -> u64 {
        self.scores.len() as u64
    }
}
