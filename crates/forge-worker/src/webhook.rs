use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use forge_git::ChangesSummary;
use forge_task::UsageInfo;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result envelope POSTed to the task's callback URL.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub task_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes_summary: Option<ChangesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub finished_at: DateTime<Utc>,
}

/// Delivers HMAC-signed webhooks with capped exponential retry
/// (base delay x 5 per attempt).
pub struct WebhookSender {
    client: reqwest::Client,
    secret: String,
    max_retries: u32,
    base_delay: Duration,
}

impl WebhookSender {
    pub fn new(secret: impl Into<String>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            secret: secret.into(),
            max_retries,
            base_delay,
        }
    }

    /// Sends the payload, retrying on transport errors and non-2xx responses.
    pub async fn send(&self, callback_url: &str, payload: &WebhookPayload) -> Result<()> {
        let body = serde_json::to_string(payload).context("encoding webhook payload")?;
        let signature = sign(&self.secret, body.as_bytes());
        let event_type = format!("task.{}", payload.status);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 5u32.saturating_pow(attempt - 1);
                tracing::info!(attempt, ?delay, url = callback_url, "webhook retry");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(callback_url)
                .header("Content-Type", "application/json")
                .header("X-Signature-256", format!("sha256={signature}"))
                .header("X-CodeForge-Event", &event_type)
                .body(body.clone());
            if !payload.trace_id.is_empty() {
                request = request.header("X-Trace-ID", &payload.trace_id);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(attempt, %error, url = callback_url, "webhook request failed");
                    continue;
                }
            };

            if response.status().is_success() {
                tracing::info!(
                    url = callback_url,
                    status = response.status().as_u16(),
                    attempt,
                    "webhook delivered"
                );
                return Ok(());
            }

            tracing::warn!(
                attempt,
                status = response.status().as_u16(),
                url = callback_url,
                "webhook non-2xx response"
            );
        }

        bail!(
            "webhook delivery failed after {} attempts to {}",
            self.max_retries + 1,
            callback_url
        );
    }
}

/// Hex-encoded HMAC-SHA-256 of the body under the given secret.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("{:x}", mac.finalize().into_bytes())
}

/// Verifies an `X-Signature-256` value (`sha256=<hex>`) against a body.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(received) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let expected = sign(secret, body);
    timing_safe_equal(expected.as_bytes(), received.as_bytes())
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
