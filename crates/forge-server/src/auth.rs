use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use forge_core::{ForgeError, StoreClient};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

/// Extracts the bearer token from an Authorization header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

/// Validates the bearer token with a constant-time comparison.
pub fn authorize_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::unauthorized());
    };
    if !timing_safe_equal(token.as_bytes(), state.cfg.server.auth_token.as_bytes()) {
        return Err(ApiError::unauthorized());
    }
    Ok(())
}

fn timing_safe_equal(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (lhs, rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Sliding-window rate limiter keyed by a hash of the bearer token. The
/// purge, count, add, and expiry all land in one pipeline.
pub struct RateLimiter {
    store: StoreClient,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: StoreClient, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    /// Records the request and decides admission. Returns the suggested
    /// retry-after seconds when the caller is over the limit.
    pub async fn allow(&self, client_token: &str) -> Result<Option<u64>, ForgeError> {
        let key = self.store.key(&["ratelimit", &hash_token(client_token)]);

        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - self.window.as_millis() as i64;
        let member = now_ms.to_string();

        let mut conn = self.store.connection();
        let (count,): (i64,) = redis::pipe()
            .zrembyscore(&key, 0, window_start)
            .ignore()
            .zcard(&key)
            .zadd(&key, &member, now_ms)
            .ignore()
            .expire(&key, self.window.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count >= i64::from(self.limit) {
            let retry_after = (self.window.as_secs() / u64::from(self.limit.max(1))).max(1);
            return Ok(Some(retry_after));
        }
        Ok(None)
    }
}

/// Short digest so raw tokens never appear in key names.
fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};

    use super::{bearer_token, hash_token, timing_safe_equal};

    #[test]
    fn unit_bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer tok-123"));
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn unit_timing_safe_equal_matches_exact_bytes_only() {
        assert!(timing_safe_equal(b"token", b"token"));
        assert!(!timing_safe_equal(b"token", b"token2"));
        assert!(!timing_safe_equal(b"tokena", b"tokenb"));
    }

    #[test]
    fn unit_token_hash_is_short_and_stable() {
        let first = hash_token("secret-token");
        let second = hash_token("secret-token");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert_ne!(first, hash_token("other-token"));
    }
}
