use std::sync::Arc;
use std::time::Duration;

use forge_core::{CancelToken, StoreClient};
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::model::{CreateTaskRequest, TaskConfig};
use crate::service::TaskService;

const POP_WINDOW_SECONDS: f64 = 5.0;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const CORRELATION_TTL_SECONDS: u64 = 300;
const MAX_PROMPT_BYTES: usize = 100 * 1024;
const LOG_SNIPPET_BYTES: usize = 200;

/// Payload pushed onto the input list by non-HTTP submitters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputPayload {
    pub repo_url: String,
    pub provider_key: String,
    pub access_token: String,
    pub prompt: String,
    pub callback_url: String,
    pub config: Option<TaskConfig>,
    pub correlation_id: String,
}

/// Consumes task payloads from a secondary list channel with the same
/// blocking-pop discipline as the worker pool. Invalid payloads are dropped
/// with a truncated log line; valid ones flow through the normal create path.
pub struct InputListener {
    store: StoreClient,
    service: Arc<TaskService>,
    input_key: String,
}

impl InputListener {
    pub fn new(store: StoreClient, service: Arc<TaskService>, input_key: impl Into<String>) -> Self {
        Self {
            store,
            service,
            input_key: input_key.into(),
        }
    }

    /// Runs until the token cancels.
    pub async fn run(&self, shutdown: CancelToken) {
        let input_key = self.store.key(&[self.input_key.as_str()]);
        tracing::info!(key = %input_key, "input listener started");

        // Blocking pops get their own connection so they never park the
        // shared multiplexed one.
        let mut conn = None;
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("input listener shutting down");
                return;
            }

            if conn.is_none() {
                match self.store.blocking_connection().await {
                    Ok(fresh) => conn = Some(fresh),
                    Err(error) => {
                        tracing::error!(%error, "input connection failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
            let Some(input_conn) = conn.as_mut() else {
                continue;
            };

            let popped: Result<Option<(String, String)>, redis::RedisError> = tokio::select! {
                result = input_conn.blpop(&input_key, POP_WINDOW_SECONDS) => result,
                _ = shutdown.cancelled() => {
                    tracing::info!("input listener shutting down");
                    return;
                }
            };

            match popped {
                Ok(Some((_, payload))) => self.handle_payload(&payload).await,
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(%error, "input pop failed");
                    conn = None;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_payload(&self, raw: &str) {
        let input: InputPayload = match serde_json::from_str(raw) {
            Ok(input) => input,
            Err(error) => {
                tracing::error!(%error, payload = %truncate(raw), "invalid input payload");
                return;
            }
        };

        if let Err(reason) = validate_input(&input) {
            tracing::error!(reason, payload = %truncate(raw), "input validation failed");
            return;
        }

        let request = CreateTaskRequest {
            repo_url: input.repo_url,
            provider_key: input.provider_key,
            access_token: input.access_token,
            prompt: input.prompt,
            callback_url: input.callback_url,
            config: input.config,
        };

        let task = match self.service.create(request).await {
            Ok(task) => task,
            Err(error) => {
                tracing::error!(%error, "failed to create task from input channel");
                return;
            }
        };

        tracing::info!(
            task_id = %task.id,
            correlation_id = %input.correlation_id,
            "task created from input channel"
        );

        if !input.correlation_id.is_empty() {
            let result_key = self
                .store
                .key(&["input", "result", input.correlation_id.as_str()]);
            let payload = json!({
                "task_id": task.id,
                "status": task.status,
            })
            .to_string();
            let mut conn = self.store.connection();
            if let Err(error) = conn
                .set_ex::<_, _, ()>(&result_key, payload, CORRELATION_TTL_SECONDS)
                .await
            {
                tracing::error!(%error, "failed to write correlation result");
            }
        }
    }
}

fn validate_input(input: &InputPayload) -> Result<(), &'static str> {
    if input.repo_url.is_empty() {
        return Err("repo_url is required");
    }
    if Url::parse(&input.repo_url).is_err() {
        return Err("repo_url must be a valid URL");
    }
    if input.prompt.is_empty() {
        return Err("prompt is required");
    }
    if input.prompt.len() > MAX_PROMPT_BYTES {
        return Err("prompt exceeds maximum length");
    }
    if !input.callback_url.is_empty() && Url::parse(&input.callback_url).is_err() {
        return Err("callback_url must be a valid URL");
    }
    Ok(())
}

fn truncate(raw: &str) -> String {
    if raw.len() <= LOG_SNIPPET_BYTES {
        return raw.to_string();
    }
    let mut end = LOG_SNIPPET_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
