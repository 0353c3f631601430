use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use forge_core::StoreClient;
use forge_task::{is_finished, TaskStatus};
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::authorize_bearer;
use crate::error::ApiError;
use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const STREAM_MAX_DURATION: Duration = Duration::from_secs(600);

/// One frame on the SSE connection: a named event or an unnamed data event.
enum SseFrame {
    Named { event: &'static str, data: String },
    Data(String),
}

impl SseFrame {
    fn named(event: &'static str, data: serde_json::Value) -> Self {
        Self::Named {
            event,
            data: data.to_string(),
        }
    }

    fn into_event(self) -> Event {
        match self {
            Self::Named { event, data } => Event::default().event(event).data(data),
            Self::Data(data) => Event::default().data(data),
        }
    }
}

/// GET /api/v1/tasks/{id}/stream
///
/// Live subscription opens before history is read; a late-joining client may
/// see a small duplicate window at the join boundary but never a gap.
/// Terminal tasks get a one-shot replay: connected, history, done, close.
pub async fn stream_task(
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
    let finished = is_finished(task.status);

    // Subscribe to the live and done channels BEFORE touching history, so
    // events landing between replay and the live loop are not lost.
    let subscription = if finished {
        None
    } else {
        let stream_key = state.store.key(&["task", &task_id, "stream"]);
        let done_key = state.store.key(&["task", &task_id, "done"]);
        match state
            .store
            .subscriber(&[stream_key.clone(), done_key.clone()])
            .await
        {
            Ok(pubsub) => Some((pubsub, done_key)),
            Err(error) => {
                tracing::error!(task_id, %error, "stream subscription failed");
                return ApiError::internal("stream subscription failed").into_response();
            }
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<SseFrame>();
    let _ = tx.send(SseFrame::named(
        "connected",
        json!({ "task_id": task.id, "status": task.status }),
    ));

    tokio::spawn(feed_frames(
        state.store.clone(),
        task_id,
        task.status,
        subscription,
        tx,
    ));

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response()
}

/// Feeds history then live events into the connection channel. Dropping the
/// receiver (client disconnect) ends the task.
async fn feed_frames(
    store: StoreClient,
    task_id: String,
    status: TaskStatus,
    subscription: Option<(redis::aio::PubSub, String)>,
    tx: mpsc::UnboundedSender<SseFrame>,
) {
    let history_key = store.key(&["task", &task_id, "history"]);
    let mut conn = store.connection();
    let history: Vec<String> = conn.lrange(&history_key, 0, -1).await.unwrap_or_default();
    for entry in history {
        if tx.send(SseFrame::Data(entry)).is_err() {
            return;
        }
    }

    let Some((mut pubsub, done_key)) = subscription else {
        let _ = tx.send(SseFrame::named(
            "done",
            json!({ "task_id": task_id, "status": status }),
        ));
        return;
    };

    let deadline = tokio::time::sleep(STREAM_MAX_DURATION);
    tokio::pin!(deadline);
    let mut messages = pubsub.on_message();

    tracing::debug!(task_id, "SSE stream live loop started");
    loop {
        tokio::select! {
            maybe_message = messages.next() => {
                let Some(message) = maybe_message else {
                    break;
                };
                let payload: String = message.get_payload().unwrap_or_default();
                if message.get_channel_name() == done_key {
                    let _ = tx.send(SseFrame::Named { event: "done", data: payload });
                    break;
                }
                if tx.send(SseFrame::Data(payload)).is_err() {
                    break;
                }
            }
            () = &mut deadline => {
                let _ = tx.send(SseFrame::named(
                    "timeout",
                    json!({ "message": "stream closed after 10 minutes" }),
                ));
                break;
            }
            () = tx.closed() => {
                tracing::debug!(task_id, "SSE client disconnected");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SseFrame;

    fn rendered(frame: SseFrame) -> String {
        // Event does not expose its fields; compare via Debug formatting.
        format!("{:?}", frame.into_event())
    }

    #[test]
    fn unit_named_frames_carry_the_event_name() {
        let frame = SseFrame::named("connected", json!({ "task_id": "t-1" }));
        let event = rendered(frame);
        assert!(event.contains("connected"));
        assert!(event.contains("t-1"));
    }

    #[test]
    fn unit_data_frames_stay_unnamed() {
        let event = rendered(SseFrame::Data("{\"type\":\"git\"}".to_string()));
        assert!(event.contains("git"));
        assert!(!event.contains("event:"));
    }
}
