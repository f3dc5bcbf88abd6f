//! End-to-end flows against the in-memory store with the cache in
//! L1-only mode: registration, authenticated increments, replay
//! rejection, tie-breaks, rate limiting, and broadcast fan-out.

use std::sync::Arc;
use std::time::Duration;

use podium::actions::{ActionVerifier, RateLimits};
use podium::auth::JwtValidator;
use podium::broadcast::{Broadcaster, ServerMessage};
use podium::cache::LayeredCache;
use podium::engine::{EngineConfig, ScoreEngine};
use podium::error::PodiumError;
use podium::identity::IdentityService;
use podium::store::ScoreStore;

struct Service {
    engine: Arc<ScoreEngine>,
    verifier: Arc<ActionVerifier>,
    store: Arc<ScoreStore>,
    identity: Arc<IdentityService>,
    broadcaster: Arc<Broadcaster>,
}

fn build_service(score_rate_max: u64, buffer: usize) -> Service {
    let cache = Arc::new(LayeredCache::new(None));
    let store = Arc::new(ScoreStore::memory_only(Duration::from_secs(2)));
    let verifier = Arc::new(ActionVerifier::new(
        "integration-test-action-secret",
        1000,
        Duration::from_secs(300),
        Duration::from_secs(360),
        Arc::clone(&cache),
        RateLimits {
            score_max: score_rate_max,
            score_window: Duration::from_secs(60),
            auth_max: 100,
            auth_window: Duration::from_secs(60),
            admin_max: 100,
            admin_window: Duration::from_secs(60),
        },
    ));
    let broadcaster = Arc::new(Broadcaster::new(buffer));
    let jwt = JwtValidator::new(
        "integration-test-secret-at-least-32-chars".into(),
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

    Service {
        engine,
        verifier,
        store,
        identity,
        broadcaster,
    }
}

async fn register(svc: &Service, name: &str) -> String {
    let (_, user) = svc
        .identity
        .register(name, &format!("{name}@example.com"), "a-strong-password")
        .await
        .unwrap();
    svc.store.create_identity(&user.identity).await.unwrap();
    user.identity
}

#[tokio::test]
async fn fresh_identity_single_update() {
    let svc = build_service(10, 64);
    let alice = register(&svc, "alice").await;

    let token = svc.verifier.issue(&alice, 50).unwrap();
    let outcome = svc.engine.apply(&alice, &token, None).await.unwrap();
    assert_eq!(outcome.new_score, 50);
    assert_eq!(outcome.rank, 1);

    let top = svc.engine.top(10).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].rank, 1);
    assert_eq!(top[0].identity, alice);
    assert_eq!(top[0].score, 50);
}

#[tokio::test]
async fn duplicate_replay_rejected_without_side_effects() {
    let svc = build_service(10, 64);
    let alice = register(&svc, "alice").await;

    let token = svc.verifier.issue(&alice, 50).unwrap();
    svc.engine.apply(&alice, &token, None).await.unwrap();

    // Resending the exact same payload is a conflict, not a double apply
    let err = svc.engine.apply(&alice, &token, None).await.unwrap_err();
    assert!(matches!(err, PodiumError::DuplicateAction));

    let rank = svc.engine.user_rank(&alice).await.unwrap();
    assert_eq!(rank.score, 50);
}

#[tokio::test]
async fn tie_break_ranks_earlier_commit_first() {
    let svc = build_service(10, 64);
    let bob = register(&svc, "bob").await;
    let carol = register(&svc, "carol").await;

    // Both reach 100; bob's commit happens first
    let token = svc.verifier.issue(&bob, 100).unwrap();
    svc.engine.apply(&bob, &token, None).await.unwrap();
    let token = svc.verifier.issue(&carol, 100).unwrap();
    svc.engine.apply(&carol, &token, None).await.unwrap();

    let top = svc.engine.top(10).await.unwrap();
    assert_eq!(top[0].identity, bob);
    assert_eq!(top[1].identity, carol);
    assert_eq!(top[0].score, top[1].score);
}

#[tokio::test]
async fn rate_limit_caps_accepted_updates() {
    let svc = build_service(10, 64);
    let dave = register(&svc, "dave").await;

    for i in 0..10 {
        let token = svc.verifier.issue(&dave, 1).unwrap();
        let outcome = svc.engine.apply(&dave, &token, None).await.unwrap();
        assert_eq!(outcome.new_score, i + 1);
    }

    let token = svc.verifier.issue(&dave, 1).unwrap();
    let err = svc.engine.apply(&dave, &token, None).await.unwrap_err();
    match err {
        PodiumError::RateLimited { retry_after_secs } => {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }
        other => panic!("expected RateLimited, got {other}"),
    }

    // The rejected call did not change the score
    assert_eq!(svc.engine.user_rank(&dave).await.unwrap().score, 10);
}

#[tokio::test]
async fn concurrent_replays_apply_exactly_once() {
    let svc = build_service(100, 64);
    let alice = register(&svc, "alice").await;

    let token = svc.verifier.issue(&alice, 25).unwrap();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&svc.engine);
        let identity = alice.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            engine.apply(&identity, &token, None).await
        }));
    }

    let mut accepted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                accepted += 1;
                assert_eq!(outcome.new_score, 25);
            }
            Err(PodiumError::DuplicateAction) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(svc.engine.user_rank(&alice).await.unwrap().score, 25);
}

#[tokio::test]
async fn broadcast_reaches_all_subscribers_with_post_commit_ranking() {
    let svc = build_service(10, 64);
    let carol = register(&svc, "carol").await;

    let (_, mut rx_a) = svc.broadcaster.subscribe();
    let (_, mut rx_b) = svc.broadcaster.subscribe();
    rx_a.recv().await.unwrap();
    rx_b.recv().await.unwrap();

    let token = svc.verifier.issue(&carol, 80).unwrap();
    svc.engine.apply(&carol, &token, None).await.unwrap();

    let expected = svc.engine.top(10).await.unwrap();
    for rx in [&mut rx_a, &mut rx_b] {
        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("update must arrive promptly")
            .unwrap();
        match msg.as_ref() {
            ServerMessage::ScoreboardUpdate {
                scoreboard,
                total_users,
                ..
            } => {
                assert_eq!(*total_users, 1);
                assert_eq!(scoreboard.len(), expected.len());
                assert_eq!(scoreboard[0].score, expected[0].score);
                assert_eq!(scoreboard[0].identity, expected[0].identity);
            }
            other => panic!("expected scoreboard_update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn slow_subscriber_evicted_fast_ones_get_everything_in_order() {
    let buffer = 64;
    let svc = build_service(1000, buffer);
    let erin = register(&svc, "erin").await;

    // A and B read continuously; C reads its greeting and then stalls
    let (_, rx_a) = svc.broadcaster.subscribe();
    let (_, rx_b) = svc.broadcaster.subscribe();
    let (_, mut rx_c) = svc.broadcaster.subscribe();
    rx_c.recv().await.unwrap();

    let updates = buffer as u64 + 1;
    let reader = |mut rx: tokio::sync::mpsc::Receiver<Arc<ServerMessage>>| {
        tokio::spawn(async move {
            let mut scores = Vec::new();
            while scores.len() < updates as usize {
                match rx.recv().await {
                    Some(msg) => {
                        if let ServerMessage::ScoreboardUpdate { scoreboard, .. } = msg.as_ref() {
                            scores.push(scoreboard[0].score);
                        }
                    }
                    None => break,
                }
            }
            scores
        })
    };
    let a_task = reader(rx_a);
    let b_task = reader(rx_b);

    for _ in 0..updates {
        let token = svc.verifier.issue(&erin, 1).unwrap();
        svc.engine.apply(&erin, &token, None).await.unwrap();
    }

    // C's buffer filled after `buffer` undelivered updates; the next
    // emit evicted it. A and B saw every update, in order.
    assert_eq!(svc.broadcaster.subscriber_count(), 2);
    assert_eq!(svc.broadcaster.evicted_count(), 1);

    for task in [a_task, b_task] {
        let scores = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        let expected: Vec<u64> = (1..=updates).collect();
        assert_eq!(scores, expected);
    }
}

#[tokio::test]
async fn registration_broadcast_keeps_total_users_fresh() {
    let svc = build_service(10, 64);

    let (_, mut rx) = svc.broadcaster.subscribe();
    rx.recv().await.unwrap();

    register(&svc, "frank").await;
    svc.engine.broadcast_current();

    let msg = rx.recv().await.unwrap();
    match msg.as_ref() {
        ServerMessage::ScoreboardUpdate { total_users, .. } => {
            assert_eq!(*total_users, 1);
        }
        other => panic!("expected scoreboard_update, got {other:?}"),
    }
}

#[tokio::test]
async fn ranking_is_sorted_and_bounded() {
    let svc = build_service(1000, 64);

    for i in 0..15u64 {
        let id = register(&svc, &format!("user{i}")).await;
        let token = svc.verifier.issue(&id, (i % 7) * 10 + 1).unwrap();
        svc.engine.apply(&id, &token, None).await.unwrap();
    }

    let top = svc.engine.top(10).await.unwrap();
    assert!(top.len() <= 10);
    for pair in top.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.score > b.score || (a.score == b.score && a.last_updated <= b.last_updated),
            "ranking must be ordered by (score DESC, last_updated ASC)"
        );
    }
    for (i, row) in top.iter().enumerate() {
        assert_eq!(row.rank, (i + 1) as u64);
    }
}

#[tokio::test]
async fn rank_formula_for_identity_outside_top_k() {
    let svc = build_service(1000, 64);

    for i in 0..10u64 {
        let id = register(&svc, &format!("strong{i}")).await;
        let token = svc.verifier.issue(&id, 50 + i).unwrap();
        svc.engine.apply(&id, &token, None).await.unwrap();
    }
    let weak = register(&svc, "weak").await;
    let token = svc.verifier.issue(&weak, 3).unwrap();
    svc.engine.apply(&weak, &token, None).await.unwrap();

    let rank = svc.engine.user_rank(&weak).await.unwrap();
    assert!(rank.rank > 10);
    assert_eq!(rank.rank, 11);
    assert_eq!(rank.total, 11);
}
