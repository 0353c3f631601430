use chrono::Utc;
use forge_core::{ForgeError, StoreClient};
use forge_git::ChangesSummary;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};

use crate::model::TaskStatus;

/// Stream event category; the fixed set shared with all subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    System,
    Git,
    Cli,
    Stream,
    Result,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Git => "git",
            Self::Cli => "cli",
            Self::Stream => "stream",
            Self::Result => "result",
        }
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    event: &'a str,
    data: &'a RawValue,
    ts: &'a str,
}

/// Publishes typed events to the per-task live channel and appends them to
/// the replayable history sequence in one pipeline, plus the one-shot done
/// signal on its own channel.
pub struct EventBus {
    store: StoreClient,
    history_ttl: u64,
}

impl EventBus {
    pub fn new(store: StoreClient, history_ttl: u64) -> Self {
        Self { store, history_ttl }
    }

    /// Serializes and dual-writes one event: publish on the live channel and
    /// append to history in a single round trip.
    pub async fn emit(
        &self,
        task_id: &str,
        kind: EventKind,
        event: &str,
        data: Value,
    ) -> Result<(), ForgeError> {
        let raw = serde_json::to_string(&data)?;
        self.emit_raw(task_id, kind, event, raw).await
    }

    /// `stream.output` event whose data is the raw agent line, forwarded
    /// byte-for-byte. Lines that are not valid JSON are carried as a JSON
    /// string.
    pub async fn emit_cli_output(&self, task_id: &str, raw_line: &str) -> Result<(), ForgeError> {
        let data = match serde_json::from_str::<&RawValue>(raw_line) {
            Ok(_) => raw_line.to_string(),
            Err(_) => serde_json::to_string(raw_line)?,
        };
        self.emit_raw(task_id, EventKind::Stream, "output", data).await
    }

    pub async fn emit_system(
        &self,
        task_id: &str,
        event: &str,
        data: Value,
    ) -> Result<(), ForgeError> {
        self.emit(task_id, EventKind::System, event, data).await
    }

    pub async fn emit_git(&self, task_id: &str, event: &str, data: Value) -> Result<(), ForgeError> {
        self.emit(task_id, EventKind::Git, event, data).await
    }

    pub async fn emit_result(
        &self,
        task_id: &str,
        event: &str,
        data: Value,
    ) -> Result<(), ForgeError> {
        self.emit(task_id, EventKind::Result, event, data).await
    }

    /// Publishes the completion signal on the done channel and applies the
    /// history TTL in the same pipeline.
    pub async fn emit_done(
        &self,
        task_id: &str,
        status: TaskStatus,
        changes: Option<&ChangesSummary>,
    ) -> Result<(), ForgeError> {
        let payload = json!({
            "task_id": task_id,
            "status": status,
            "changes_summary": changes,
        })
        .to_string();

        let done_key = self.store.key(&["task", task_id, "done"]);
        let history_key = self.store.key(&["task", task_id, "history"]);

        let mut conn = self.store.connection();
        redis::pipe()
            .publish(&done_key, &payload)
            .ignore()
            .expire(&history_key, self.history_ttl as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn emit_raw(
        &self,
        task_id: &str,
        kind: EventKind,
        event: &str,
        data: String,
    ) -> Result<(), ForgeError> {
        let message = render_event(kind, event, &data)?;

        let stream_key = self.store.key(&["task", task_id, "stream"]);
        let history_key = self.store.key(&["task", task_id, "history"]);

        let mut conn = self.store.connection();
        redis::pipe()
            .publish(&stream_key, &message)
            .ignore()
            .rpush(&history_key, &message)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

fn render_event(kind: EventKind, event: &str, data: &str) -> Result<String, ForgeError> {
    let raw: &RawValue = serde_json::from_str(data)?;
    let ts = Utc::now().to_rfc3339();
    Ok(serde_json::to_string(&WireEvent {
        kind: kind.as_str(),
        event,
        data: raw,
        ts: &ts,
    })?)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{render_event, EventKind};

    #[test]
    fn unit_wire_event_shape_matches_subscriber_contract() {
        let message = render_event(
            EventKind::Git,
            "clone_started",
            r#"{"repo_url":"https://github.com/acme/app.git"}"#,
        )
        .expect("render event");

        let parsed: Value = serde_json::from_str(&message).expect("round-trip");
        assert_eq!(parsed["type"], "git");
        assert_eq!(parsed["event"], "clone_started");
        assert_eq!(parsed["data"]["repo_url"], "https://github.com/acme/app.git");
        assert!(parsed["ts"].as_str().expect("ts string").contains('T'));
    }

    #[test]
    fn unit_raw_agent_lines_pass_through_untouched() {
        let raw = r#"{"type":"assistant","message":{"content":[]}}"#;
        let message = render_event(EventKind::Stream, "output", raw).expect("render event");
        assert!(message.contains(raw));
    }

    #[test]
    fn unit_kind_labels_are_the_fixed_set() {
        assert_eq!(EventKind::System.as_str(), "system");
        assert_eq!(EventKind::Git.as_str(), "git");
        assert_eq!(EventKind::Cli.as_str(), "cli");
        assert_eq!(EventKind::Stream.as_str(), "stream");
        assert_eq!(EventKind::Result.as_str(), "result");
    }
}
