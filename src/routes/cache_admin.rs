//! Administrative cache endpoints
//!
//! Bearer-authenticated and rate limited per identity under the admin
//! scope. Cache problems here are downgraded: the write path never
//! depends on these handlers.

use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::{failure_response, require_bearer, success_response, BoxBody};
use crate::server::AppState;

/// GET /cache/stats
pub async fn handle_stats(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let principal = match require_bearer(&state, &req) {
        Ok(p) => p,
        Err(e) => return failure_response(&e),
    };
    if let Err(e) = state.verifier.check_admin_rate(&principal.identity).await {
        return failure_response(&e);
    }

    success_response(StatusCode::OK, &state.cache.stats())
}

/// POST /cache/warm
pub async fn handle_warm(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let principal = match require_bearer(&state, &req) {
        Ok(p) => p,
        Err(e) => return failure_response(&e),
    };
    if let Err(e) = state.verifier.check_admin_rate(&principal.identity).await {
        return failure_response(&e);
    }

    let started = Instant::now();
    match state.engine.warm().await {
        Ok(items) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            info!(items = items, duration_ms = duration_ms, "Cache warmed");
            success_response(
                StatusCode::OK,
                &serde_json::json!({ "itemsCached": items, "duration": duration_ms }),
            )
        }
        Err(e) => failure_response(&e),
    }
}

/// DELETE /cache/clear
pub async fn handle_clear(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let principal = match require_bearer(&state, &req) {
        Ok(p) => p,
        Err(e) => return failure_response(&e),
    };
    if let Err(e) = state.verifier.check_admin_rate(&principal.identity).await {
        return failure_response(&e);
    }

    match state.engine.clear_cache().await {
        Ok(cleared) => {
            info!(cleared = cleared, "Cache cleared");
            success_response(
                StatusCode::OK,
                &serde_json::json!({ "entriesCleared": cleared }),
            )
        }
        Err(e) => failure_response(&e),
    }
}
