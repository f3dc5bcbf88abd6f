//! Podium - real-time scoreboard service

use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podium::{
    actions::{ActionVerifier, RateLimits},
    auth::JwtValidator,
    broadcast::Broadcaster,
    cache::{self, L2Cache, LayeredCache},
    config::Args,
    db::MongoClient,
    engine::{EngineConfig, ScoreEngine},
    identity::IdentityService,
    server::{self, AppState},
    store::ScoreStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("podium={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Podium - real-time scoreboard");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("MongoDB: {}", args.mongodb_uri);
    info!(
        "Redis: {}",
        args.redis_url.as_deref().unwrap_or("(none, L1-only)")
    );
    info!("Top-K: {}", args.top_k);
    info!("======================================");

    // MongoDB is the durable store; optional in dev mode
    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => Some(client),
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, memory-only store): {}", e);
                None
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Redis is the shared cache tier; losing it degrades to L1-only
    let l2 = match &args.redis_url {
        Some(url) => match L2Cache::connect(url, args.l2_timeout()).await {
            Ok(l2) => Some(l2),
            Err(e) => {
                warn!("Redis connection failed, running L1-only: {}", e);
                None
            }
        },
        None => None,
    };
    let cache_layer = Arc::new(LayeredCache::new(l2));

    let store = match &mongo {
        Some(client) => Arc::new(
            ScoreStore::with_mongo(client.clone(), args.store_timeout(), args.nonce_marker_ttl())
                .await?,
        ),
        None => Arc::new(ScoreStore::memory_only(args.store_timeout())),
    };

    let jwt = JwtValidator::new(args.jwt_secret(), args.jwt_expiry_seconds)?;
    let identity = match &mongo {
        Some(client) => {
            Arc::new(IdentityService::with_mongo(client.clone(), jwt, args.store_timeout()).await?)
        }
        None => Arc::new(IdentityService::memory_only(jwt, args.store_timeout())),
    };

    let limits = RateLimits {
        score_max: args.score_rate_max,
        score_window: Duration::from_secs(args.score_rate_window_secs),
        auth_max: args.auth_rate_max,
        auth_window: Duration::from_secs(args.auth_rate_window_secs),
        admin_max: args.admin_rate_max,
        admin_window: Duration::from_secs(args.admin_rate_window_secs),
    };
    let verifier = Arc::new(ActionVerifier::new(
        &args.action_secret(),
        args.max_increment,
        args.freshness_window(),
        args.nonce_marker_ttl(),
        Arc::clone(&cache_layer),
        limits,
    ));

    let broadcaster = Arc::new(Broadcaster::new(args.subscriber_buffer));

    let engine = Arc::new(ScoreEngine::new(
        Arc::clone(&store),
        Arc::clone(&cache_layer),
        Arc::clone(&verifier),
        Arc::clone(&broadcaster),
        Arc::clone(&identity),
        EngineConfig {
            top_k: args.top_k,
            l1_ttl: Duration::from_millis(args.top_l1_ttl_ms),
            top_l2_ttl: Duration::from_secs(args.top_ttl_secs),
            score_l2_ttl: Duration::from_secs(args.score_ttl_secs),
            total_ttl: Duration::from_secs(args.total_ttl_secs),
        },
    ));

    // Sweep expired L1 entries in the background
    cache::spawn_cleanup_task(Arc::clone(&cache_layer), Duration::from_secs(60));

    let state = Arc::new(AppState {
        args,
        store,
        cache: cache_layer,
        verifier,
        engine,
        broadcaster,
        identity,
        started_at: Instant::now(),
    });

    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    info!("Podium shut down cleanly");
    Ok(())
}
