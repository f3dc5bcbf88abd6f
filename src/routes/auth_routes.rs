//! Registration and login endpoints
//!
//! - POST /auth/register - create identity + credentials, returns a bearer token
//! - POST /auth/login    - verify credentials, returns a bearer token
//!
//! Both are rate limited per source address. Registration provisions a
//! zero ScoreRecord and broadcasts the refreshed ranking so connected
//! subscribers see `total_users` move.

use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::{cors_preflight, failure_response, parse_json_body, success_response, BoxBody};
use crate::error::PodiumError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Dispatch /auth/* requests; returns None for paths outside /auth
pub async fn handle_auth_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path();
    let method = req.method();

    if !path.starts_with("/auth") {
        return None;
    }

    if method == Method::OPTIONS {
        return Some(cors_preflight());
    }

    let path = path.split('?').next().unwrap_or(path);

    let response = match (method, path) {
        (&Method::POST, "/auth/register") => handle_register(req, state, addr).await,
        (&Method::POST, "/auth/login") => handle_login(req, state, addr).await,
        (_, "/auth/register") | (_, "/auth/login") => failure_response(
            &PodiumError::MissingFields("method not allowed".into()),
        ),
        _ => super::not_found_response(path),
    };

    Some(response)
}

async fn handle_register(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<BoxBody> {
    if let Err(e) = state.verifier.check_auth_rate(&addr.ip().to_string()).await {
        return failure_response(&e);
    }

    let body: RegisterRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return failure_response(&e),
    };

    let (token, user) = match state
        .identity
        .register(&body.username, &body.email, &body.password)
        .await
    {
        Ok(result) => result,
        Err(e) => return failure_response(&e),
    };

    // The identity exists from the first moment with a zero score
    if let Err(e) = state.store.create_identity(&user.identity).await {
        return failure_response(&e);
    }

    // Subscribers' total_users must track registrations even though a
    // zero score cannot enter an already-full top-K
    state.engine.on_identity_created(&user.identity).await;

    info!(username = %user.username, "Registration complete");
    success_response(
        StatusCode::CREATED,
        &serde_json::json!({ "token": token, "user": user }),
    )
}

async fn handle_login(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<BoxBody> {
    if let Err(e) = state.verifier.check_auth_rate(&addr.ip().to_string()).await {
        return failure_response(&e);
    }

    let body: LoginRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => return failure_response(&e),
    };

    match state.identity.authenticate(&body.email, &body.password).await {
        Ok((token, user)) => success_response(
            StatusCode::OK,
            &serde_json::json!({ "token": token, "user": user }),
        ),
        Err(e) => failure_response(&e),
    }
}
