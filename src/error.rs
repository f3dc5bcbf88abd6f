//! Error types for Podium
//!
//! One service-wide error enum. Every variant carries a stable machine
//! code (returned to clients in the response envelope) and maps to an
//! HTTP status.

use hyper::StatusCode;

/// Main error type for Podium operations
#[derive(Debug, thiserror::Error)]
pub enum PodiumError {
    #[error("Missing fields: {0}")]
    MissingFields(String),

    #[error("Invalid score increment: {0}")]
    InvalidIncrement(String),

    #[error("Invalid action hash: {0}")]
    InvalidActionHash(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Duplicate action: nonce already consumed")]
    DuplicateAction,

    #[error("Duplicate identity: {0}")]
    DuplicateIdentity(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PodiumError {
    /// Stable machine code surfaced in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "MISSING_FIELDS",
            Self::InvalidIncrement(_) => "INVALID_SCORE_INCREMENT",
            Self::InvalidActionHash(_) => "INVALID_ACTION_HASH",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::DuplicateAction => "DUPLICATE_ACTION",
            Self::DuplicateIdentity(_) => "DUPLICATE_IDENTITY",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Config(_) => "INTERNAL",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFields(_) | Self::InvalidIncrement(_) => StatusCode::BAD_REQUEST,
            Self::InvalidActionHash(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::DuplicateAction | Self::DuplicateIdentity(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UserNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for PodiumError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PodiumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for PodiumError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for PodiumError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for PodiumError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for PodiumError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::InvalidToken(format!("JWT error: {}", err))
    }
}

/// Result type alias for Podium operations
pub type Result<T> = std::result::Result<T, PodiumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PodiumError::MissingFields("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PodiumError::DuplicateAction.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PodiumError::RateLimited { retry_after_secs: 5 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PodiumError::BackendUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_machine_codes_are_stable() {
        assert_eq!(PodiumError::DuplicateAction.code(), "DUPLICATE_ACTION");
        assert_eq!(
            PodiumError::InvalidIncrement("0".into()).code(),
            "INVALID_SCORE_INCREMENT"
        );
        assert_eq!(
            PodiumError::RateLimited { retry_after_secs: 1 }.code(),
            "RATE_LIMITED"
        );
    }
}
