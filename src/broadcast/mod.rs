//! Ranking broadcast fan-out
//!
//! Maintains the set of live WebSocket subscribers. Every subscriber
//! owns a bounded outbound buffer; `emit` builds a message once and
//! enqueues a shared reference into each buffer without ever blocking
//! on the network. A full buffer classifies the subscriber as slow and
//! evicts it; the other subscribers are unaffected.
//!
//! The subscriber map is only touched for O(1) add/remove/snapshot
//! operations; delivery to the network happens in per-connection
//! worker tasks that drain the buffers.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One row of the ranking as sent over the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreboardRow {
    pub rank: u64,
    pub identity: String,
    pub username: String,
    pub score: u64,
    pub last_updated: String,
}

/// Message sent from server to subscribers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full ranking snapshot after an accepted write
    ScoreboardUpdate {
        scoreboard: Vec<ScoreboardRow>,
        total_users: u64,
        last_updated: String,
    },
    /// Proof-of-life on connect and disconnect
    ConnectionStatus {
        status: String,
        subscriber_id: String,
        timestamp: String,
    },
    /// Per-subscriber error reply (malformed frame etc.)
    Error { error: String, timestamp: String },
    /// Reply to a client-level `ping` message
    Pong { timestamp: String },
}

pub type SubscriberId = Uuid;

struct SubscriberHandle {
    tx: mpsc::Sender<Arc<ServerMessage>>,
    last_seen: Instant,
}

/// Subscriber registry and fan-out
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, SubscriberHandle>,
    buffer_capacity: usize,
    emitted: AtomicU64,
    evicted: AtomicU64,
}

impl Broadcaster {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer_capacity,
            emitted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. Returns its id and the receiving end of
    /// its outbound buffer; a `connection_status{connected}` message is
    /// already enqueued as proof-of-life.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Arc<ServerMessage>>) {
        let id = Uuid::new_v4();
        // One slot beyond the configured capacity is reserved for the
        // greeting, so the full update budget stays `buffer_capacity`
        let (tx, rx) = mpsc::channel(self.buffer_capacity + 1);

        let hello = Arc::new(ServerMessage::ConnectionStatus {
            status: "connected".to_string(),
            subscriber_id: id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        let _ = tx.try_send(hello);

        self.subscribers.insert(
            id,
            SubscriberHandle {
                tx,
                last_seen: Instant::now(),
            },
        );

        info!(subscriber = %id, total = self.subscribers.len(), "Subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber and close its buffer
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            info!(subscriber = %id, total = self.subscribers.len(), "Subscriber removed");
        }
        removed
    }

    /// Enqueue a message into every subscriber's buffer.
    ///
    /// The message is built once and shared. A full buffer means the
    /// subscriber is slow: it is evicted and its connection closes when
    /// the delivery worker observes the closed buffer. Never blocks.
    pub fn emit(&self, message: ServerMessage) -> usize {
        let shared = Arc::new(message);
        self.emitted.fetch_add(1, Ordering::Relaxed);

        let mut slow: Vec<SubscriberId> = Vec::new();
        let mut delivered = 0usize;

        for entry in self.subscribers.iter() {
            match entry.tx.try_send(Arc::clone(&shared)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %entry.key(), "Outbound buffer full, evicting slow subscriber");
                    slow.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %entry.key(), "Buffer closed, removing subscriber");
                    slow.push(*entry.key());
                }
            }
        }

        // Removal happens outside the iteration to keep map operations O(1)
        for id in slow {
            if self.subscribers.remove(&id).is_some() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        delivered
    }

    /// Enqueue a message to a single subscriber (error replies, status)
    pub fn send_to(&self, id: &SubscriberId, message: ServerMessage) -> bool {
        let Some(entry) = self.subscribers.get(id) else {
            return false;
        };
        match entry.tx.try_send(Arc::new(message)) {
            Ok(()) => true,
            Err(_) => {
                drop(entry);
                if self.subscribers.remove(id).is_some() {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// Record subscriber activity (any inbound frame)
    pub fn touch(&self, id: &SubscriberId) {
        if let Some(mut entry) = self.subscribers.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(n: u64) -> ServerMessage {
        ServerMessage::ScoreboardUpdate {
            scoreboard: vec![ScoreboardRow {
                rank: 1,
                identity: "alice".into(),
                username: "alice".into(),
                score: n,
                last_updated: "2026-01-01T00:00:00Z".into(),
            }],
            total_users: 1,
            last_updated: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_receives_connection_status() {
        let b = Broadcaster::new(64);
        let (id, mut rx) = b.subscribe();

        let first = rx.recv().await.unwrap();
        match first.as_ref() {
            ServerMessage::ConnectionStatus {
                status,
                subscriber_id,
                ..
            } => {
                assert_eq!(status, "connected");
                assert_eq!(subscriber_id, &id.to_string());
            }
            other => panic!("expected connection_status, got {other:?}"),
        }
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers_in_order() {
        let b = Broadcaster::new(64);
        let (_, mut rx_a) = b.subscribe();
        let (_, mut rx_b) = b.subscribe();
        // Drain greetings
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        for n in 0..5 {
            assert_eq!(b.emit(update(n)), 2);
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for n in 0..5 {
                let msg = rx.recv().await.unwrap();
                match msg.as_ref() {
                    ServerMessage::ScoreboardUpdate { scoreboard, .. } => {
                        assert_eq!(scoreboard[0].score, n);
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_evicted_others_unaffected() {
        let capacity = 8;
        let b = Broadcaster::new(capacity);
        let (slow_id, mut slow_rx) = b.subscribe();
        let (_, mut fast_rx) = b.subscribe();
        // Both read their greetings; then the slow one stalls
        slow_rx.recv().await.unwrap();
        fast_rx.recv().await.unwrap();

        // A stalled subscriber absorbs exactly `capacity` undelivered updates
        for _ in 0..capacity {
            b.emit(update(0));
        }
        assert_eq!(b.subscriber_count(), 2);

        // The next one overflows its buffer and evicts it
        b.emit(update(99));
        assert_eq!(b.subscriber_count(), 1);
        assert!(!b.subscribers.contains_key(&slow_id));
        assert_eq!(b.evicted_count(), 1);

        // The fast subscriber got every update
        let mut received = 0;
        while let Ok(msg) = fast_rx.try_recv() {
            match msg.as_ref() {
                ServerMessage::ScoreboardUpdate { .. } => received += 1,
                _ => {}
            }
        }
        assert_eq!(received, capacity + 1);

        drop(slow_rx);
    }

    #[tokio::test]
    async fn test_greeting_does_not_consume_update_budget() {
        let capacity = 4;
        let b = Broadcaster::new(capacity);
        // Never reads anything, greeting included
        let (_, rx) = b.subscribe();

        for _ in 0..capacity {
            b.emit(update(0));
        }
        assert_eq!(b.subscriber_count(), 1);

        b.emit(update(1));
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(b.evicted_count(), 1);

        drop(rx);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_buffer() {
        let b = Broadcaster::new(4);
        let (id, mut rx) = b.subscribe();
        rx.recv().await.unwrap();

        assert!(b.unsubscribe(&id));
        assert!(!b.unsubscribe(&id));
        assert_eq!(b.subscriber_count(), 0);

        // Sender dropped: the worker sees end-of-stream
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_single_subscriber() {
        let b = Broadcaster::new(4);
        let (id_a, mut rx_a) = b.subscribe();
        let (_, mut rx_b) = b.subscribe();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        assert!(b.send_to(
            &id_a,
            ServerMessage::Error {
                error: "bad frame".into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }
        ));

        let msg = rx_a.recv().await.unwrap();
        assert!(matches!(msg.as_ref(), ServerMessage::Error { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_message_wire_format() {
        let msg = update(50);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"scoreboard_update\""));
        assert!(json.contains("\"total_users\":1"));
        assert!(json.contains("\"score\":50"));

        let pong = ServerMessage::Pong {
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&pong).unwrap();
        assert!(json.contains("\"type\":\"pong\""));
    }
}
