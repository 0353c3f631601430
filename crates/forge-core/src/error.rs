use std::collections::BTreeMap;

use thiserror::Error;

/// Application error taxonomy, distinguished by observable behavior.
///
/// HTTP handlers map each variant to a status code via [`ForgeError::http_status`];
/// the executor never propagates these to callers and instead converts them to
/// a `failed` terminal state on the task.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("missing or invalid Bearer token")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{0}")]
    NotSupported(String),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{0}")]
    Crypto(String),

    #[error("{0}")]
    Internal(String),
}

impl ForgeError {
    /// Convenience constructor for a 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Convenience constructor for a 400 without a per-field map.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Convenience constructor for a 409.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Convenience constructor for a 500.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the HTTP status code this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation { .. } | Self::NotSupported(_) => 400,
            Self::Unauthorized => 401,
            Self::Conflict(_) | Self::InvalidTransition { .. } => 409,
            Self::RateLimited { .. } => 429,
            Self::Store(_) | Self::Encoding(_) | Self::Crypto(_) | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ForgeError;

    #[test]
    fn unit_http_status_mapping_is_stable() {
        assert_eq!(ForgeError::not_found("x").http_status(), 404);
        assert_eq!(ForgeError::validation("x").http_status(), 400);
        assert_eq!(ForgeError::Unauthorized.http_status(), 401);
        assert_eq!(ForgeError::conflict("x").http_status(), 409);
        assert_eq!(
            ForgeError::InvalidTransition {
                from: "pending".to_string(),
                to: "completed".to_string(),
            }
            .http_status(),
            409
        );
        assert_eq!(
            ForgeError::RateLimited {
                retry_after_seconds: 6
            }
            .http_status(),
            429
        );
        assert_eq!(ForgeError::NotSupported("x".to_string()).http_status(), 400);
        assert_eq!(ForgeError::internal("x").http_status(), 500);
    }

    #[test]
    fn unit_invalid_transition_message_names_both_states() {
        let error = ForgeError::InvalidTransition {
            from: "pending".to_string(),
            to: "completed".to_string(),
        };
        assert_eq!(error.to_string(), "invalid transition: pending -> completed");
    }
}
