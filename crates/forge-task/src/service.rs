use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge_core::{CryptoService, ForgeError, StoreClient};
use forge_git::ChangesSummary;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::model::{
    marshal_config, unmarshal_changes, unmarshal_config, unmarshal_usage, CreateTaskRequest,
    Iteration, Task, TaskConfig, TaskStatus, UsageInfo,
};
use crate::state::{is_finished, validate_transition};

/// CRUD over task records with state-machine-gated transitions, the
/// append-only iteration log, and liveness-sensitive TTL application.
pub struct TaskService {
    store: StoreClient,
    crypto: Arc<CryptoService>,
    queue_name: String,
    state_ttl: u64,
    result_ttl: u64,
}

impl TaskService {
    pub fn new(
        store: StoreClient,
        crypto: Arc<CryptoService>,
        queue_name: impl Into<String>,
        state_ttl: u64,
        result_ttl: u64,
    ) -> Self {
        Self {
            store,
            crypto,
            queue_name: queue_name.into(),
            state_ttl,
            result_ttl,
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    fn state_key(&self, task_id: &str) -> String {
        self.store.key(&["task", task_id, "state"])
    }

    fn result_key(&self, task_id: &str) -> String {
        self.store.key(&["task", task_id, "result"])
    }

    fn iterations_key(&self, task_id: &str) -> String {
        self.store.key(&["task", task_id, "iterations"])
    }

    /// Creates a task record and enqueues its id in one pipeline. No TTL is
    /// applied yet; running tasks must not expire.
    pub async fn create(&self, req: CreateTaskRequest) -> Result<Task, ForgeError> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            repo_url: req.repo_url,
            provider_key: req.provider_key,
            access_token: req.access_token,
            prompt: req.prompt,
            callback_url: req.callback_url,
            config: req.config,
            result: String::new(),
            error: String::new(),
            changes_summary: None,
            usage: None,
            iteration: 1,
            current_prompt: String::new(),
            branch: String::new(),
            pr_number: None,
            pr_url: String::new(),
            trace_id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            iterations: Vec::new(),
        };

        let mut fields = task_to_hash(&task)?;
        if !task.access_token.is_empty() {
            fields.push((
                "encrypted_access_token".to_string(),
                self.crypto.encrypt(&task.access_token)?,
            ));
        }
        if let Some(config) = &task.config {
            if !config.ai_api_key.is_empty() {
                fields.push((
                    "encrypted_ai_api_key".to_string(),
                    self.crypto.encrypt(&config.ai_api_key)?,
                ));
            }
        }

        let state_key = self.state_key(&task.id);
        let queue_key = self.store.key(&[self.queue_name.as_str()]);

        let mut conn = self.store.connection();
        redis::pipe()
            .hset_multiple(&state_key, &fields)
            .ignore()
            .rpush(&queue_key, &task.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::info!(task_id = %task.id, repo_url = %task.repo_url, "task created");
        Ok(task)
    }

    /// Loads a task, decrypting sensitive fields for the caller's use and
    /// attaching the stored result blob.
    pub async fn get(&self, task_id: &str) -> Result<Task, ForgeError> {
        let mut conn = self.store.connection();
        let fields: HashMap<String, String> = conn.hgetall(self.state_key(task_id)).await?;
        if fields.is_empty() {
            return Err(ForgeError::not_found(format!("task {task_id} not found")));
        }

        let mut task = hash_to_task(&fields);

        if let Some(encrypted) = fields.get("encrypted_access_token") {
            match self.crypto.decrypt(encrypted) {
                Ok(token) => task.access_token = token,
                Err(error) => {
                    tracing::error!(task_id, %error, "failed to decrypt access token");
                }
            }
        }
        if let Some(encrypted) = fields.get("encrypted_ai_api_key") {
            match self.crypto.decrypt(encrypted) {
                Ok(key) => {
                    task.config.get_or_insert_with(TaskConfig::default).ai_api_key = key;
                }
                Err(error) => {
                    tracing::error!(task_id, %error, "failed to decrypt ai api key");
                }
            }
        }

        let result: Option<String> = conn.get(self.result_key(task_id)).await?;
        if let Some(result) = result {
            task.result = result;
        }

        Ok(task)
    }

    /// Transitions a task through the state machine, stamping `updated_at`
    /// plus `started_at`/`finished_at` where appropriate. Finished states get
    /// the state TTL applied in the same pipeline.
    pub async fn update_status(&self, task_id: &str, next: TaskStatus) -> Result<(), ForgeError> {
        let state_key = self.state_key(task_id);
        let mut conn = self.store.connection();

        let current: Option<String> = conn.hget(&state_key, "status").await?;
        let current = current
            .and_then(|raw| TaskStatus::parse(&raw))
            .ok_or_else(|| ForgeError::not_found(format!("task {task_id} not found")))?;

        validate_transition(current, next)?;

        let now = Utc::now().to_rfc3339();
        let mut fields = vec![
            ("status".to_string(), next.as_str().to_string()),
            ("updated_at".to_string(), now.clone()),
        ];
        match next {
            TaskStatus::Cloning | TaskStatus::Running => {
                fields.push(("started_at".to_string(), now));
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::PrCreated => {
                fields.push(("finished_at".to_string(), now));
            }
            _ => {}
        }

        let mut pipe = redis::pipe();
        pipe.hset_multiple(&state_key, &fields).ignore();
        if is_finished(next) {
            pipe.expire(&state_key, self.state_ttl as i64).ignore();
            pipe.expire(self.iterations_key(task_id), self.state_ttl as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        tracing::info!(task_id, status = %next, "task status updated");
        Ok(())
    }

    /// Stores the result blob (with its TTL) and patches changes/usage onto
    /// the task hash in one pipeline.
    pub async fn set_result(
        &self,
        task_id: &str,
        result: &str,
        changes: Option<&ChangesSummary>,
        usage: Option<&UsageInfo>,
    ) -> Result<(), ForgeError> {
        let mut fields: Vec<(String, String)> = Vec::new();
        if let Some(changes) = changes {
            fields.push((
                "changes_summary".to_string(),
                serde_json::to_string(changes)?,
            ));
        }
        if let Some(usage) = usage {
            fields.push(("usage".to_string(), serde_json::to_string(usage)?));
        }

        let mut conn = self.store.connection();
        let mut pipe = redis::pipe();
        pipe.set_ex(self.result_key(task_id), result, self.result_ttl)
            .ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(self.state_key(task_id), &fields).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Patches the error field.
    pub async fn set_error(&self, task_id: &str, message: &str) -> Result<(), ForgeError> {
        let mut conn = self.store.connection();
        conn.hset::<_, _, _, ()>(self.state_key(task_id), "error", message)
            .await?;
        Ok(())
    }

    /// Appends an iteration record to the per-task list. The list's TTL is
    /// applied at terminal transitions, not here.
    pub async fn save_iteration(
        &self,
        task_id: &str,
        iteration: &Iteration,
    ) -> Result<(), ForgeError> {
        let payload = serde_json::to_string(iteration)?;
        let mut conn = self.store.connection();
        conn.rpush::<_, _, ()>(self.iterations_key(task_id), payload)
            .await?;
        Ok(())
    }

    /// Loads iteration records in issue order. Malformed entries are skipped.
    pub async fn get_iterations(&self, task_id: &str) -> Result<Vec<Iteration>, ForgeError> {
        let mut conn = self.store.connection();
        let raw: Vec<String> = conn.lrange(self.iterations_key(task_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    /// Starts a follow-up iteration: requires a resumable state, stages
    /// through `awaiting_instruction` into `running`, bumps the iteration
    /// counter, sets the current prompt, and re-enqueues the id.
    pub async fn instruct(&self, task_id: &str, prompt: &str) -> Result<Task, ForgeError> {
        let task = self.get(task_id).await?;

        match task.status {
            TaskStatus::Completed | TaskStatus::PrCreated | TaskStatus::AwaitingInstruction => {}
            TaskStatus::Failed => {
                return Err(ForgeError::conflict(
                    "last iteration failed; the task cannot accept further instructions",
                ));
            }
            other => {
                return Err(ForgeError::conflict(format!(
                    "task is still processing (status: {other})"
                )));
            }
        }

        if task.status != TaskStatus::AwaitingInstruction {
            self.update_status(task_id, TaskStatus::AwaitingInstruction)
                .await?;
        }
        self.update_status(task_id, TaskStatus::Running).await?;

        let next_iteration = task.iteration + 1;
        let fields = vec![
            ("iteration".to_string(), next_iteration.to_string()),
            ("current_prompt".to_string(), prompt.to_string()),
        ];

        let state_key = self.state_key(task_id);
        let queue_key = self.store.key(&[self.queue_name.as_str()]);
        let mut conn = self.store.connection();
        redis::pipe()
            .hset_multiple(&state_key, &fields)
            .ignore()
            .rpush(&queue_key, task_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::info!(task_id, iteration = next_iteration, "follow-up instruction queued");

        let mut updated = task;
        updated.status = TaskStatus::Running;
        updated.iteration = next_iteration;
        updated.current_prompt = prompt.to_string();
        Ok(updated)
    }

    /// Patches PR coordinates onto the task hash after a successful creation.
    pub async fn set_pr_info(
        &self,
        task_id: &str,
        branch: &str,
        pr_url: &str,
        pr_number: u64,
    ) -> Result<(), ForgeError> {
        let fields = vec![
            ("branch".to_string(), branch.to_string()),
            ("pr_url".to_string(), pr_url.to_string()),
            ("pr_number".to_string(), pr_number.to_string()),
        ];
        let mut conn = self.store.connection();
        conn.hset_multiple::<_, _, _, ()>(self.state_key(task_id), &fields)
            .await?;
        Ok(())
    }
}

fn task_to_hash(task: &Task) -> Result<Vec<(String, String)>, ForgeError> {
    let created = task.created_at.to_rfc3339();
    let mut fields = vec![
        ("id".to_string(), task.id.clone()),
        ("status".to_string(), task.status.as_str().to_string()),
        ("repo_url".to_string(), task.repo_url.clone()),
        ("prompt".to_string(), task.prompt.clone()),
        ("iteration".to_string(), task.iteration.to_string()),
        ("created_at".to_string(), created.clone()),
        ("updated_at".to_string(), created),
    ];
    if !task.provider_key.is_empty() {
        fields.push(("provider_key".to_string(), task.provider_key.clone()));
    }
    if !task.callback_url.is_empty() {
        fields.push(("callback_url".to_string(), task.callback_url.clone()));
    }
    if task.config.is_some() {
        fields.push(("config".to_string(), marshal_config(task.config.as_ref())?));
    }
    if !task.trace_id.is_empty() {
        fields.push(("trace_id".to_string(), task.trace_id.clone()));
    }
    Ok(fields)
}

fn hash_to_task(fields: &HashMap<String, String>) -> Task {
    let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let parse_time = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    };

    Task {
        id: get("id"),
        status: fields
            .get("status")
            .and_then(|raw| TaskStatus::parse(raw))
            .unwrap_or(TaskStatus::Pending),
        repo_url: get("repo_url"),
        provider_key: get("provider_key"),
        access_token: String::new(),
        prompt: get("prompt"),
        callback_url: get("callback_url"),
        config: unmarshal_config(&get("config")),
        result: String::new(),
        error: get("error"),
        changes_summary: unmarshal_changes(&get("changes_summary")),
        usage: unmarshal_usage(&get("usage")),
        iteration: fields
            .get("iteration")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1),
        current_prompt: get("current_prompt"),
        branch: get("branch"),
        pr_number: fields.get("pr_number").and_then(|raw| raw.parse().ok()),
        pr_url: get("pr_url"),
        trace_id: get("trace_id"),
        created_at: parse_time("created_at").unwrap_or_else(Utc::now),
        started_at: parse_time("started_at"),
        finished_at: parse_time("finished_at"),
        iterations: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::{hash_to_task, task_to_hash};
    use crate::model::{Task, TaskConfig, TaskStatus};

    fn sample_task() -> Task {
        Task {
            id: "11111111-2222-3333-4444-555555555555".to_string(),
            status: TaskStatus::Pending,
            repo_url: "https://github.com/acme/app.git".to_string(),
            provider_key: "acme-bot".to_string(),
            access_token: "secret".to_string(),
            prompt: "Add a hello world function".to_string(),
            callback_url: "https://hooks.example.com/done".to_string(),
            config: Some(TaskConfig {
                timeout_seconds: 120,
                ..TaskConfig::default()
            }),
            result: String::new(),
            error: String::new(),
            changes_summary: None,
            usage: None,
            iteration: 1,
            current_prompt: String::new(),
            branch: String::new(),
            pr_number: None,
            pr_url: String::new(),
            trace_id: "abc123".to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            iterations: Vec::new(),
        }
    }

    #[test]
    fn unit_task_hash_round_trip_preserves_core_fields() {
        let task = sample_task();
        let fields: HashMap<String, String> = task_to_hash(&task)
            .expect("hash fields")
            .into_iter()
            .collect();

        // The plaintext token is never part of the hash fields.
        assert!(!fields.values().any(|value| value == "secret"));

        let loaded = hash_to_task(&fields);
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.repo_url, task.repo_url);
        assert_eq!(loaded.provider_key, task.provider_key);
        assert_eq!(loaded.prompt, task.prompt);
        assert_eq!(loaded.callback_url, task.callback_url);
        assert_eq!(loaded.iteration, 1);
        assert_eq!(loaded.trace_id, task.trace_id);
        assert_eq!(
            loaded.config.expect("config present").timeout_seconds,
            120
        );
        assert!(loaded.access_token.is_empty());
    }

    #[test]
    fn unit_hash_parsing_tolerates_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "t-1".to_string());
        fields.insert("status".to_string(), "running".to_string());

        let task = hash_to_task(&fields);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.iteration, 1);
        assert!(task.config.is_none());
        assert!(task.started_at.is_none());
    }
}
