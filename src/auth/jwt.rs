//! JWT bearer token handling
//!
//! Tokens are signed with HS256 (HMAC-SHA256). The secret is injected
//! configuration, never read from a global.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PodiumError;

/// Payload stored in a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Identity the token authenticates
    pub identity: String,
    /// Display username at issue time
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Create a new JWT validator
    ///
    /// Returns an error if the secret is empty.
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, PodiumError> {
        if secret.is_empty() {
            return Err(PodiumError::Config("bearer secret must not be empty".into()));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Generate a bearer token for an authenticated identity
    pub fn generate_token(&self, identity: &str, username: &str) -> Result<String, PodiumError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PodiumError::Internal(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            identity: identity.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Verify and decode a bearer token
    pub fn verify_token(&self, token: &str) -> Result<Claims, PodiumError> {
        let validation = Validation::default();

        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        ) {
            Ok(token_data) => Ok(token_data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                Err(PodiumError::InvalidToken(msg.into()))
            }
        }
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

/// Extract token from a URL query string
pub fn extract_token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    for param in query.split('&') {
        if let Some((key, value)) = param.split_once('=') {
            if key == "token" {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validator() -> JwtValidator {
        JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            3600,
        )
        .unwrap()
    }

    #[test]
    fn test_generate_and_verify_token() {
        let validator = test_validator();

        let token = validator.generate_token("id-123", "alice").unwrap();
        assert!(!token.is_empty());

        let claims = validator.verify_token(&token).unwrap();
        assert_eq!(claims.identity, "id-123");
        assert_eq!(claims.username, "alice");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_invalid_token() {
        let validator = test_validator();
        assert!(validator.verify_token("invalid-token").is_err());
    }

    #[test]
    fn test_wrong_secret() {
        let validator1 = test_validator();
        let validator2 = JwtValidator::new(
            "different-secret-that-is-at-least-32-characters".into(),
            3600,
        )
        .unwrap();

        let token = validator1.generate_token("id-123", "alice").unwrap();
        assert!(validator2.verify_token(&token).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtValidator::new("".into(), 3600).is_err());
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(
            extract_token_from_header(Some("Bearer abc123")),
            Some("abc123")
        );
        assert_eq!(extract_token_from_header(Some("abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(None), None);
        assert_eq!(extract_token_from_header(Some("")), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("Basic abc123")), None);
    }

    #[test]
    fn test_extract_token_from_query() {
        assert_eq!(
            extract_token_from_query(Some("token=abc123")),
            Some("abc123".into())
        );
        assert_eq!(
            extract_token_from_query(Some("foo=bar&token=abc123")),
            Some("abc123".into())
        );
        assert_eq!(extract_token_from_query(Some("foo=bar")), None);
        assert_eq!(extract_token_from_query(None), None);
    }
}
