use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use forge_git::ChangesSummary;
use serde::{Deserialize, Serialize};

/// Current state of a task. In-place updates must go through the state
/// machine in [`crate::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Cloning,
    Running,
    Completed,
    Failed,
    AwaitingInstruction,
    CreatingPr,
    PrCreated,
}

impl TaskStatus {
    /// Stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingInstruction => "awaiting_instruction",
            Self::CreatingPr => "creating_pr",
            Self::PrCreated => "pr_created",
        }
    }

    /// Parses the wire representation back into a status.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "cloning" => Some(Self::Cloning),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "awaiting_instruction" => Some(Self::AwaitingInstruction),
            "creating_pr" => Some(Self::CreatingPr),
            "pr_created" => Some(Self::PrCreated),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage and wall-clock duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_seconds: u64,
}

/// Per-task MCP server entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Optional per-task configuration overrides.
///
/// `ai_api_key` is accepted on input but never serialized back out; its
/// persisted form lives only as ciphertext in a dedicated hash field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cli: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ai_model: String,
    #[serde(skip_serializing)]
    pub ai_api_key: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_turns: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_branch: String,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub max_budget_usd: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerSpec>,
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

/// One run of the agent against a task's workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub number: u32,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<ChangesSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The central task record.
///
/// `access_token` and the config's `ai_api_key` are populated in memory only
/// after decryption during processing; the API view never carries either.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub repo_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_key: String,
    #[serde(skip)]
    pub access_token: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub callback_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes_summary: Option<ChangesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,

    pub iteration: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub current_prompt: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pr_url: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<Iteration>,
}

impl Task {
    /// Prompt in effect for the current iteration.
    pub fn effective_prompt(&self) -> &str {
        if self.current_prompt.is_empty() {
            &self.prompt
        } else {
            &self.current_prompt
        }
    }
}

/// Payload for task creation, shared by the HTTP handler and input listener.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateTaskRequest {
    pub repo_url: String,
    pub provider_key: String,
    pub access_token: String,
    pub prompt: String,
    pub callback_url: String,
    pub config: Option<TaskConfig>,
}

/// Serializes a config for hash storage; `None` stores as empty.
pub(crate) fn marshal_config(config: Option<&TaskConfig>) -> Result<String, serde_json::Error> {
    match config {
        Some(config) => serde_json::to_string(config),
        None => Ok(String::new()),
    }
}

/// Lenient hash-field parsers: malformed stored JSON reads as absent.
pub(crate) fn unmarshal_config(raw: &str) -> Option<TaskConfig> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

pub(crate) fn unmarshal_changes(raw: &str) -> Option<ChangesSummary> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

pub(crate) fn unmarshal_usage(raw: &str) -> Option<UsageInfo> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::{
        marshal_config, unmarshal_config, McpServerSpec, Task, TaskConfig, TaskStatus,
    };

    fn populated_config() -> TaskConfig {
        TaskConfig {
            timeout_seconds: 600,
            cli: "claude-code".to_string(),
            ai_model: "claude-sonnet-4-20250514".to_string(),
            ai_api_key: "sk-ant-secret".to_string(),
            max_turns: 12,
            target_branch: "develop".to_string(),
            max_budget_usd: 2.5,
            mcp_servers: vec![McpServerSpec {
                name: "filesystem".to_string(),
                command: "@modelcontextprotocol/server-filesystem".to_string(),
                args: vec!["/data".to_string()],
                env: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn unit_status_round_trips_through_wire_form() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Cloning,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::AwaitingInstruction,
            TaskStatus::CreatingPr,
            TaskStatus::PrCreated,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("unknown"), None);
    }

    #[test]
    fn unit_config_round_trips_except_the_secret() {
        let config = populated_config();
        let encoded = marshal_config(Some(&config)).expect("marshal config");
        assert!(!encoded.contains("sk-ant-secret"));

        let decoded = unmarshal_config(&encoded).expect("unmarshal config");
        assert_eq!(decoded.timeout_seconds, config.timeout_seconds);
        assert_eq!(decoded.cli, config.cli);
        assert_eq!(decoded.ai_model, config.ai_model);
        assert_eq!(decoded.max_turns, config.max_turns);
        assert_eq!(decoded.target_branch, config.target_branch);
        assert_eq!(decoded.max_budget_usd, config.max_budget_usd);
        assert_eq!(decoded.mcp_servers, config.mcp_servers);
        assert!(decoded.ai_api_key.is_empty());
    }

    #[test]
    fn regression_api_view_omits_sensitive_fields() {
        let task = Task {
            id: "t-1".to_string(),
            status: TaskStatus::Pending,
            repo_url: "https://github.com/acme/app.git".to_string(),
            provider_key: String::new(),
            access_token: "ghp_secret_token".to_string(),
            prompt: "Add a hello world function".to_string(),
            callback_url: String::new(),
            config: Some(populated_config()),
            result: String::new(),
            error: String::new(),
            changes_summary: None,
            usage: None,
            iteration: 1,
            current_prompt: String::new(),
            branch: String::new(),
            pr_number: None,
            pr_url: String::new(),
            trace_id: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            iterations: Vec::new(),
        };

        let rendered = serde_json::to_string(&task).expect("serialize task");
        assert!(!rendered.contains("ghp_secret_token"));
        assert!(!rendered.contains("sk-ant-secret"));
        assert!(!rendered.contains("access_token"));
        assert!(!rendered.contains("ai_api_key"));
    }
}
