//! Scoreboard endpoints
//!
//! - GET  /scoreboard                 - public top-K view
//! - POST /scoreboard/generate-action - issue an action token (bearer)
//! - POST /scoreboard/update          - apply an action token (bearer)
//! - GET  /scoreboard/user/:identity  - score + rank for one identity (bearer)

use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{failure_response, parse_json_body, require_bearer, success_response, BoxBody};
use crate::actions::ActionToken;
use crate::engine::ms_to_rfc3339;
use crate::error::PodiumError;
use crate::server::AppState;
use crate::store::RankedEntry;

#[derive(Debug, Deserialize)]
pub struct GenerateActionRequest {
    #[serde(default)]
    pub increment: u64,
}

/// GET /scoreboard
pub async fn handle_scoreboard(state: Arc<AppState>) -> Response<BoxBody> {
    let ranking = match state.engine.top(state.engine.top_k()).await {
        Ok(r) => r,
        Err(e) => return failure_response(&e),
    };
    let total = match state.engine.total_identities().await {
        Ok(t) => t,
        Err(e) => return failure_response(&e),
    };

    let last_updated = ranking
        .iter()
        .map(|r| r.last_updated)
        .max()
        .map(ms_to_rfc3339);

    success_response(
        StatusCode::OK,
        &serde_json::json!({
            "scoreboard": render_rows(&state, &ranking),
            "totalUsers": total,
            "lastUpdated": last_updated,
        }),
    )
}

/// POST /scoreboard/generate-action
pub async fn handle_generate_action(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let principal = match require_bearer(&state, &req) {
        Ok(p) => p,
        Err(e) => return failure_response(&e),
    };

    let body: GenerateActionRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return failure_response(&e),
    };

    match state.verifier.issue(&principal.identity, body.increment) {
        Ok(token) => success_response(StatusCode::OK, &token),
        Err(e) => failure_response(&e),
    }
}

/// POST /scoreboard/update
pub async fn handle_update(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<BoxBody> {
    let principal = match require_bearer(&state, &req) {
        Ok(p) => p,
        Err(e) => return failure_response(&e),
    };

    let token: ActionToken = match parse_json_body(req).await {
        Ok(t) => t,
        Err(e) => return failure_response(&e),
    };

    match state
        .engine
        .apply(&principal.identity, &token, Some(addr.ip().to_string()))
        .await
    {
        Ok(outcome) => success_response(StatusCode::OK, &outcome),
        Err(e) => failure_response(&e),
    }
}

/// GET /scoreboard/user/:identity
pub async fn handle_user_rank(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    identity: &str,
) -> Response<BoxBody> {
    if let Err(e) = require_bearer(&state, &req) {
        return failure_response(&e);
    }

    if identity.is_empty() {
        return failure_response(&PodiumError::MissingFields("identity".into()));
    }

    match state.engine.user_rank(identity).await {
        Ok(rank) => {
            let username = state
                .identity
                .username_of(identity)
                .unwrap_or_else(|| identity.to_string());
            success_response(
                StatusCode::OK,
                &serde_json::json!({
                    "identity": rank.identity,
                    "username": username,
                    "score": rank.score,
                    "rank": rank.rank,
                    "totalUsers": rank.total,
                }),
            )
        }
        Err(e) => failure_response(&e),
    }
}

fn render_rows(state: &AppState, ranking: &[RankedEntry]) -> Vec<serde_json::Value> {
    ranking
        .iter()
        .map(|r| {
            serde_json::json!({
                "rank": r.rank,
                "identity": r.identity,
                "username": state
                    .identity
                    .username_of(&r.identity)
                    .unwrap_or_else(|| r.identity.clone()),
                "score": r.score,
                "lastUpdated": ms_to_rfc3339(r.last_updated),
            })
        })
        .collect()
}
