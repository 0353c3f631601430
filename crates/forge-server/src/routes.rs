use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;
use crate::{health, stream, tasks};

/// Assembles the HTTP surface.
///
/// Authorization is enforced inside each `/api/v1` handler rather than by a
/// wrapping layer, and no global request timeout is installed: the SSE route
/// is long-lived and manages its own keepalives and deadline.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/api/v1/tasks", post(tasks::create_task))
        .route("/api/v1/tasks/:task_id", get(tasks::get_task))
        .route("/api/v1/tasks/:task_id/instruct", post(tasks::instruct_task))
        .route("/api/v1/tasks/:task_id/cancel", post(tasks::cancel_task))
        .route("/api/v1/tasks/:task_id/create-pr", post(tasks::create_pr))
        .route("/api/v1/tasks/:task_id/stream", get(stream::stream_task))
        .with_state(state)
}
