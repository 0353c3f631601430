use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::ForgeError;
use serde_json::json;

/// HTTP-facing error: status code, canonical reason, human message, and an
/// optional per-field reason map for validation failures.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    fields: Option<BTreeMap<String, String>>,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            fields: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn validation(message: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        let mut error = Self::new(StatusCode::BAD_REQUEST, message);
        error.fields = Some(fields);
        error
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid Bearer token")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        let mut error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate limit exceeded, retry after {retry_after_seconds}s"),
        );
        error.retry_after_seconds = Some(retry_after_seconds);
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl From<ForgeError> for ApiError {
    fn from(error: ForgeError) -> Self {
        let status =
            StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match error {
            ForgeError::Validation { message, fields } => Self {
                status,
                message,
                fields: if fields.is_empty() { None } else { Some(fields) },
                retry_after_seconds: None,
            },
            ForgeError::RateLimited {
                retry_after_seconds,
            } => Self::rate_limited(retry_after_seconds),
            // Internal error classes keep their detail in the logs only.
            internal @ (ForgeError::Store(_)
            | ForgeError::Encoding(_)
            | ForgeError::Crypto(_)
            | ForgeError::Internal(_)) => {
                tracing::error!(error = %internal, "internal error");
                Self::internal("internal server error")
            }
            other => Self::new(status, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self
            .status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string();
        let mut body = json!({
            "error": reason,
            "message": self.message,
        });
        if let Some(fields) = &self.fields {
            body["fields"] = json!(fields);
        }

        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after_seconds {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use forge_core::ForgeError;

    use super::ApiError;

    #[test]
    fn unit_forge_errors_map_to_expected_statuses() {
        let not_found: ApiError = ForgeError::not_found("task x not found").into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let conflict: ApiError = ForgeError::conflict("busy").into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let invalid: ApiError = ForgeError::InvalidTransition {
            from: "pending".to_string(),
            to: "completed".to_string(),
        }
        .into();
        assert_eq!(invalid.status, StatusCode::CONFLICT);

        let internal: ApiError = ForgeError::internal("boom").into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "internal server error");
    }

    #[test]
    fn unit_rate_limited_response_carries_retry_after() {
        let response = ApiError::rate_limited(6).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("Retry-After")
                .and_then(|value| value.to_str().ok()),
            Some("6")
        );
    }
}
