//! Cache key builders
//!
//! Both tiers share these keys, so invalidating a key clears it
//! everywhere.

/// Top-K ranking view
pub fn top_key(k: usize) -> String {
    format!("top:{k}")
}

/// Per-identity score entry
pub fn score_key(identity: &str) -> String {
    format!("score:{identity}")
}

/// Identity count, coarse TTL
pub fn total_key() -> String {
    "total:users".to_string()
}

/// Rate-limit counter for a scope and subject
pub fn rate_key(scope: &str, id: &str) -> String {
    format!("rl:{scope}:{id}")
}

/// Consumed-nonce marker
pub fn nonce_key(nonce: &str) -> String {
    format!("nonce:seen:{nonce}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_disjoint_namespaces() {
        assert_eq!(top_key(10), "top:10");
        assert_eq!(score_key("alice"), "score:alice");
        assert_eq!(rate_key("score", "alice"), "rl:score:alice");
        assert_eq!(nonce_key("abc"), "nonce:seen:abc");
        assert_ne!(score_key("x"), rate_key("score", "x"));
    }
}
