//! HTTP route handlers
//!
//! Every JSON response shares the `{success, data?, error?}` envelope;
//! errors carry the machine code from [`PodiumError::code`] and rate
//! limits add `retry_after`.

pub mod auth_routes;
pub mod cache_admin;
pub mod health;
pub mod scoreboard;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::auth::extract_token_from_header;
use crate::error::PodiumError;
use crate::identity::Principal;
use crate::server::AppState;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Build a success envelope
pub fn success_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::json!({ "success": true, "data": data });
    json_response(status, &body)
}

/// Build an error envelope from a service error
pub fn failure_response(err: &PodiumError) -> Response<BoxBody> {
    let mut error = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let PodiumError::RateLimited { retry_after_secs } = err {
        error["retry_after"] = serde_json::json!(retry_after_secs);
    }
    let body = serde_json::json!({ "success": false, "error": error });

    let mut builder = Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*");
    if let PodiumError::RateLimited { retry_after_secs } = err {
        builder = builder.header("Retry-After", retry_after_secs.to_string());
    }
    builder
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| fallback_response())
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
        .body(full_body(json))
        .unwrap_or_else(|_| fallback_response())
}

pub fn not_found_response(path: &str) -> Response<BoxBody> {
    let body = serde_json::json!({
        "success": false,
        "error": { "code": "NOT_FOUND", "message": format!("No route for {path}") },
    });
    json_response(StatusCode::NOT_FOUND, &body)
}

pub fn cors_preflight() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
        .header("Access-Control-Max-Age", "86400")
        .body(empty_body())
        .unwrap_or_else(|_| fallback_response())
}

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn fallback_response() -> Response<BoxBody> {
    let mut response = Response::new(full_body(r#"{"success":false}"#));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Parse a bounded JSON request body
pub async fn parse_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, PodiumError> {
    let body = req
        .collect()
        .await
        .map_err(|e| PodiumError::MissingFields(format!("Failed to read body: {e}")))?;

    let bytes = body.to_bytes();
    if bytes.len() > 10240 {
        return Err(PodiumError::MissingFields("Request body too large".into()));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| PodiumError::MissingFields(format!("Invalid JSON body: {e}")))
}

/// Resolve the bearer principal or fail with 401
pub fn require_bearer(
    state: &AppState,
    req: &Request<hyper::body::Incoming>,
) -> Result<Principal, PodiumError> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = extract_token_from_header(header)
        .ok_or_else(|| PodiumError::InvalidToken("missing bearer token".into()))?;
    state.identity.verify_bearer(token)
}
