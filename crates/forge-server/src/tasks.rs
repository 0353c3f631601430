use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_task::{CreatePrRequest, CreateTaskRequest, TaskStatus};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::auth::{authorize_bearer, bearer_token};
use crate::error::ApiError;
use crate::state::AppState;

const MAX_PROMPT_BYTES: usize = 100 * 1024;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GetTaskQuery {
    include: String,
}

#[derive(Debug, Deserialize)]
struct InstructBody {
    #[serde(default)]
    prompt: String,
}

/// POST /api/v1/tasks
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_bearer(&state, &headers) {
        return error.into_response();
    }

    if let Some(limiter) = &state.limiter {
        let token = bearer_token(&headers).unwrap_or_default();
        match limiter.allow(token).await {
            Ok(None) => {}
            Ok(Some(retry_after)) => {
                return ApiError::rate_limited(retry_after).into_response();
            }
            Err(error) => {
                tracing::error!(%error, "rate limiter check failed");
            }
        }
    }

    let request: CreateTaskRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return ApiError::bad_request("invalid JSON body").into_response(),
    };

    if let Some(fields) = validate_create(&request) {
        return ApiError::validation("validation failed", fields).into_response();
    }

    match state.tasks.create(request).await {
        Ok(task) => (
            StatusCode::CREATED,
            Json(json!({
                "id": task.id,
                "status": task.status,
                "created_at": task.created_at,
            })),
        )
            .into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

/// GET /api/v1/tasks/{id}?include=iterations
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(query): Query<GetTaskQuery>,
) -> Response {
    if let Err(error) = authorize_bearer(&state, &headers) {
        return error.into_response();
    }

    let mut task = match state.tasks.get(&task_id).await {
        Ok(task) => task,
        Err(error) => return ApiError::from(error).into_response(),
    };

    if query.include == "iterations" {
        match state.tasks.get_iterations(&task_id).await {
            Ok(iterations) => task.iterations = iterations,
            Err(error) => {
                tracing::warn!(task_id, %error, "failed to load iterations");
            }
        }
    }

    Json(task).into_response()
}

/// POST /api/v1/tasks/{id}/instruct
pub async fn instruct_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_bearer(&state, &headers) {
        return error.into_response();
    }

    let request: InstructBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return ApiError::bad_request("invalid JSON body").into_response(),
    };
    if request.prompt.is_empty() {
        return ApiError::bad_request("prompt is required").into_response();
    }
    if request.prompt.len() > MAX_PROMPT_BYTES {
        return ApiError::bad_request("prompt exceeds maximum length").into_response();
    }

    match state.tasks.instruct(&task_id, &request.prompt).await {
        Ok(task) => Json(json!({
            "id": task.id,
            "status": task.status,
            "iteration": task.iteration,
        }))
        .into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

/// POST /api/v1/tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    if let Err(error) = authorize_bearer(&state, &headers) {
        return error.into_response();
    }

    let task = match state.tasks.get(&task_id).await {
        Ok(task) => task,
        Err(error) => return ApiError::from(error).into_response(),
    };

    if task.status != TaskStatus::Running && task.status != TaskStatus::Cloning {
        return ApiError::conflict(format!("task is not running (status: {})", task.status))
            .into_response();
    }

    if let Err(error) = state.pool.cancel(&task_id) {
        return ApiError::from(error).into_response();
    }

    Json(json!({
        "id": task_id,
        "status": "cancelling",
        "message": "task cancellation requested",
    }))
    .into_response()
}

/// POST /api/v1/tasks/{id}/create-pr
pub async fn create_pr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_bearer(&state, &headers) {
        return error.into_response();
    }

    let request: CreatePrRequest = if body.is_empty() {
        CreatePrRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => return ApiError::bad_request("invalid JSON body").into_response(),
        }
    };

    match state.pr.create_pr(&task_id, request).await {
        Ok(created) => Json(created).into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

/// Per-field validation with the same reason phrasing across HTTP and the
/// input listener.
fn validate_create(request: &CreateTaskRequest) -> Option<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();

    if request.repo_url.is_empty() {
        fields.insert("repo_url".to_string(), "field is required".to_string());
    } else if Url::parse(&request.repo_url).is_err() {
        fields.insert("repo_url".to_string(), "must be a valid URL".to_string());
    }

    if request.prompt.is_empty() {
        fields.insert("prompt".to_string(), "field is required".to_string());
    } else if request.prompt.len() > MAX_PROMPT_BYTES {
        fields.insert("prompt".to_string(), "exceeds maximum length".to_string());
    }

    if !request.callback_url.is_empty() && Url::parse(&request.callback_url).is_err() {
        fields.insert("callback_url".to_string(), "must be a valid URL".to_string());
    }

    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use forge_task::CreateTaskRequest;

    use super::validate_create;

    #[test]
    fn unit_valid_request_produces_no_field_errors() {
        let request = CreateTaskRequest {
            repo_url: "https://github.com/acme/app.git".to_string(),
            prompt: "Add a hello world function".to_string(),
            ..CreateTaskRequest::default()
        };
        assert!(validate_create(&request).is_none());
    }

    #[test]
    fn unit_field_map_names_each_failure() {
        let request = CreateTaskRequest {
            repo_url: "not a url".to_string(),
            prompt: String::new(),
            callback_url: "also bad".to_string(),
            ..CreateTaskRequest::default()
        };
        let fields = validate_create(&request).expect("field errors");
        assert_eq!(fields.get("repo_url").map(String::as_str), Some("must be a valid URL"));
        assert_eq!(fields.get("prompt").map(String::as_str), Some("field is required"));
        assert_eq!(
            fields.get("callback_url").map(String::as_str),
            Some("must be a valid URL")
        );
    }

    #[test]
    fn unit_oversized_prompt_is_rejected() {
        let request = CreateTaskRequest {
            repo_url: "https://github.com/acme/app.git".to_string(),
            prompt: "p".repeat(100 * 1024 + 1),
            ..CreateTaskRequest::default()
        };
        let fields = validate_create(&request).expect("field errors");
        assert_eq!(
            fields.get("prompt").map(String::as_str),
            Some("exceeds maximum length")
        );
    }
}
