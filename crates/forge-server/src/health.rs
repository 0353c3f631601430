use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// GET /health — store connectivity plus version/uptime/disk usage.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let store_ok = state.store.ping().await.is_ok();
    let disk_usage_mb =
        state.workspaces.total_size_bytes().await as f64 / (1024.0 * 1024.0);

    let body = json!({
        "status": if store_ok { "ok" } else { "error" },
        "redis": if store_ok { "connected" } else { "disconnected" },
        "version": state.version,
        "uptime": format_uptime(state.started_at.elapsed().as_secs()),
        "workspace_disk_usage_mb": disk_usage_mb,
    });

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// GET /ready — 503 while shutting down.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if !state.ready.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response();
    }
    Json(json!({ "status": "ready" })).into_response()
}

fn format_uptime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::format_uptime;

    #[test]
    fn unit_uptime_rendering_is_compact() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(90), "1m30s");
        assert_eq!(format_uptime(3_725), "1h2m5s");
    }
}
