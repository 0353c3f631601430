use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forge_core::CancelToken;
use forge_git::{
    calculate_changes, clone, pull_branch, push_existing_branch, sanitize_url,
    update_pr_description, BranchOptions, CloneOptions,
};
use forge_runner::{RunOptions, RunOutcome, RunnerError, RunnerRegistry};
use forge_task::{EventBus, Iteration, Task, TaskService, TaskStatus, UsageInfo};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::keys::KeyResolver;
use crate::mcp::McpInstaller;
use crate::webhook::{WebhookPayload, WebhookSender};
use crate::workspace::WorkspaceManager;

const MAX_CONTEXT_CHARS: usize = 50_000;
const RESULT_SUMMARY_CHARS: usize = 2_000;

/// Executor limits and defaults.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_base: PathBuf,
    pub default_timeout: u64,
    pub max_timeout: u64,
    pub default_model: String,
}

/// Which outer signal interrupted a pipeline step.
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Orchestrates one task iteration: clone-or-reuse, MCP materialization, CLI
/// run with live event forwarding, diff, result persistence, completion
/// emission, and webhook delivery.
///
/// Errors never propagate to the caller; every failure converts into a
/// `failed` terminal state on the task. The fail-path tail runs regardless of
/// cancellation so a cancelled task still reaches its terminal state.
pub struct Executor {
    tasks: Arc<TaskService>,
    runners: Arc<RunnerRegistry>,
    bus: Arc<EventBus>,
    webhook: Option<Arc<WebhookSender>>,
    keys: Arc<KeyResolver>,
    mcp: Arc<McpInstaller>,
    workspaces: Arc<WorkspaceManager>,
    cfg: ExecutorConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<TaskService>,
        runners: Arc<RunnerRegistry>,
        bus: Arc<EventBus>,
        webhook: Option<Arc<WebhookSender>>,
        keys: Arc<KeyResolver>,
        mcp: Arc<McpInstaller>,
        workspaces: Arc<WorkspaceManager>,
        cfg: ExecutorConfig,
    ) -> Self {
        Self {
            tasks,
            runners,
            bus,
            webhook,
            keys,
            mcp,
            workspaces,
            cfg,
        }
    }

    /// Runs the full pipeline for one iteration of a task.
    pub async fn execute(&self, cancel: CancelToken, mut task: Task) {
        let started_at = Utc::now();
        let timeout = self.effective_timeout(&task);
        let deadline = Instant::now() + Duration::from_secs(timeout);
        let work_dir = self.cfg.workspace_base.join(&task.id);

        tracing::info!(
            task_id = %task.id,
            iteration = task.iteration,
            timeout_seconds = timeout,
            "task execution started"
        );
        let _ = self
            .bus
            .emit_system(
                &task.id,
                "task_started",
                json!({ "iteration": task.iteration }),
            )
            .await;

        // Token resolution: inline wins; registry and environment are
        // non-fatal fallbacks — a downstream clone surfaces the auth error.
        if task.access_token.is_empty() {
            match self
                .keys
                .resolve_token(&task.repo_url, &task.provider_key)
                .await
            {
                Ok(token) => task.access_token = token,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "token resolution failed");
                }
            }
        }

        // Workspace step: first iteration clones, later ones reuse (or
        // re-clone when the directory was swept).
        if task.iteration <= 1 {
            match bounded(&cancel, deadline, self.clone_step(&task, &work_dir)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.fail_task(&task, &format!("clone failed: {error:#}"), started_at)
                        .await;
                    return;
                }
                Err(interrupt) => {
                    self.interrupted(&task, interrupt, timeout, started_at).await;
                    return;
                }
            }
        } else if !self.workspaces.exists(&task.id).await {
            tracing::warn!(
                task_id = %task.id,
                work_dir = %work_dir.display(),
                "workspace missing for iteration, re-cloning"
            );
            match bounded(&cancel, deadline, self.clone_step(&task, &work_dir)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.fail_task(&task, &format!("re-clone failed: {error:#}"), started_at)
                        .await;
                    return;
                }
                Err(interrupt) => {
                    self.interrupted(&task, interrupt, timeout, started_at).await;
                    return;
                }
            }
        } else {
            tracing::info!(task_id = %task.id, work_dir = %work_dir.display(), "reusing existing workspace");
            if !task.branch.is_empty() {
                if let Ok(Err(error)) = bounded(
                    &cancel,
                    deadline,
                    pull_branch(&work_dir, &task.branch, &task.access_token),
                )
                .await
                {
                    tracing::warn!(
                        task_id = %task.id,
                        %error,
                        "git pull failed (continuing with existing workspace)"
                    );
                }
            }
        }

        // MCP failures are non-fatal.
        let task_servers = task
            .config
            .as_ref()
            .map(|config| config.mcp_servers.as_slice())
            .unwrap_or_default();
        if let Err(error) = self.mcp.setup(&work_dir, &task.repo_url, task_servers).await {
            tracing::warn!(task_id = %task.id, %error, "MCP setup failed (continuing without MCP)");
        }

        // CLI run with live event forwarding.
        let outcome = match self.run_step(&cancel, deadline, &task, &work_dir).await {
            Ok(outcome) => outcome,
            Err(error) => {
                match error.downcast_ref::<RunnerError>() {
                    Some(RunnerError::DeadlineExceeded) => {
                        self.interrupted(&task, Interrupt::TimedOut, timeout, started_at)
                            .await;
                    }
                    Some(RunnerError::Cancelled) => {
                        self.interrupted(&task, Interrupt::Cancelled, timeout, started_at)
                            .await;
                    }
                    _ => {
                        self.fail_task(
                            &task,
                            &format!("CLI execution failed: {error:#}"),
                            started_at,
                        )
                        .await;
                    }
                }
                return;
            }
        };

        let changes = match calculate_changes(&work_dir).await {
            Ok(changes) => Some(changes),
            Err(error) => {
                tracing::warn!(task_id = %task.id, %error, "failed to calculate changes");
                None
            }
        };

        if let Ok(size) = self.workspaces.update_size(&task.id).await {
            tracing::info!(task_id = %task.id, size_bytes = size, "workspace size updated");
        }

        let usage = UsageInfo {
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            duration_seconds: outcome.duration.as_secs(),
        };

        if let Err(error) = self
            .tasks
            .set_result(&task.id, &outcome.output, changes.as_ref(), Some(&usage))
            .await
        {
            tracing::error!(task_id = %task.id, %error, "failed to store result");
        }

        if let Err(error) = self.tasks.update_status(&task.id, TaskStatus::Completed).await {
            tracing::error!(task_id = %task.id, %error, "failed to update status to completed");
            return;
        }

        let summary = truncate_chars(&outcome.output, RESULT_SUMMARY_CHARS);
        let ended_at = Utc::now();
        if let Err(error) = self
            .tasks
            .save_iteration(
                &task.id,
                &Iteration {
                    number: task.iteration,
                    prompt: task.effective_prompt().to_string(),
                    result: summary.clone(),
                    error: String::new(),
                    status: TaskStatus::Completed,
                    changes: changes.clone(),
                    usage: Some(usage.clone()),
                    started_at,
                    ended_at: Some(ended_at),
                },
            )
            .await
        {
            tracing::error!(task_id = %task.id, %error, "failed to save iteration record");
        }

        let _ = self
            .bus
            .emit_result(
                &task.id,
                "task_completed",
                json!({
                    "result": summary,
                    "changes_summary": changes,
                    "usage": usage,
                    "iteration": task.iteration,
                }),
            )
            .await;
        let _ = self
            .bus
            .emit_done(&task.id, TaskStatus::Completed, changes.as_ref())
            .await;

        // Follow-up iterations on a task with an open PR push to its branch.
        if !task.branch.is_empty() && task.iteration > 1 {
            self.push_follow_up(&task, &work_dir).await;
        }

        if !task.callback_url.is_empty() {
            self.send_webhook(&task, WebhookPayload {
                task_id: task.id.clone(),
                status: TaskStatus::Completed.as_str().to_string(),
                result: outcome.output.clone(),
                error: String::new(),
                changes_summary: changes,
                usage: Some(usage),
                trace_id: task.trace_id.clone(),
                finished_at: Utc::now(),
            })
            .await;
        }

        tracing::info!(
            task_id = %task.id,
            duration_seconds = outcome.duration.as_secs(),
            "task completed"
        );
    }

    fn effective_timeout(&self, task: &Task) -> u64 {
        let requested = task
            .config
            .as_ref()
            .map(|config| config.timeout_seconds)
            .unwrap_or(0);
        clamp_timeout(requested, self.cfg.default_timeout, self.cfg.max_timeout)
    }

    async fn clone_step(&self, task: &Task, work_dir: &Path) -> Result<()> {
        self.tasks
            .update_status(&task.id, TaskStatus::Cloning)
            .await
            .context("transitioning to cloning")?;

        let _ = self
            .bus
            .emit_git(
                &task.id,
                "clone_started",
                json!({ "repo_url": sanitize_url(&task.repo_url) }),
            )
            .await;

        self.workspaces
            .create(&task.id)
            .await
            .context("creating workspace")?;
        let _ = self
            .bus
            .emit_system(
                &task.id,
                "workspace_created",
                json!({ "work_dir": work_dir.display().to_string() }),
            )
            .await;

        let branch = task
            .config
            .as_ref()
            .map(|config| config.target_branch.clone())
            .unwrap_or_default();

        clone(&CloneOptions {
            repo_url: task.repo_url.clone(),
            dest_dir: work_dir.to_path_buf(),
            token: task.access_token.clone(),
            branch,
            shallow: true,
        })
        .await?;

        let _ = self
            .bus
            .emit_git(
                &task.id,
                "clone_completed",
                json!({ "work_dir": work_dir.display().to_string() }),
            )
            .await;

        // A privileged server chowns the tree to the drop-privileges user so
        // the agent can write to it.
        #[cfg(unix)]
        {
            use nix::unistd::{Uid, User};
            if Uid::effective().is_root() {
                if let Ok(Some(user)) = User::from_name("codeforge") {
                    let _ = crate::workspace::chown_recursive(
                        work_dir,
                        user.uid.as_raw(),
                        user.gid.as_raw(),
                    );
                }
            }
        }

        tracing::info!(task_id = %task.id, work_dir = %work_dir.display(), "repository cloned");
        Ok(())
    }

    async fn run_step(
        &self,
        cancel: &CancelToken,
        deadline: Instant,
        task: &Task,
        work_dir: &Path,
    ) -> Result<RunOutcome> {
        // Idempotent for follow-up iterations already staged into running.
        if task.status != TaskStatus::Running {
            self.tasks
                .update_status(&task.id, TaskStatus::Running)
                .await
                .context("transitioning to running")?;
        }

        let cli_name = task
            .config
            .as_ref()
            .map(|config| config.cli.clone())
            .unwrap_or_default();
        let runner = self.runners.get(&cli_name).context("resolving CLI runner")?;

        let _ = self
            .bus
            .emit_system(
                &task.id,
                "cli_started",
                json!({ "cli": cli_name, "iteration": task.iteration }),
            )
            .await;

        let prompt = self.build_prompt(task).await;

        let mut model = self.cfg.default_model.clone();
        let mut api_key = String::new();
        let mut max_turns = 0u32;
        let mut max_budget_usd = 0.0f64;
        if let Some(config) = &task.config {
            if !config.ai_model.is_empty() {
                model = config.ai_model.clone();
            }
            api_key = config.ai_api_key.clone();
            max_turns = config.max_turns;
            max_budget_usd = config.max_budget_usd;
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = tokio::spawn({
            let bus = Arc::clone(&self.bus);
            let task_id = task.id.clone();
            async move {
                while let Some(line) = event_rx.recv().await {
                    if let Err(error) = bus.emit_cli_output(&task_id, &line).await {
                        tracing::debug!(task_id = %task_id, %error, "dropping CLI event");
                    }
                }
            }
        });

        let result = runner
            .run(RunOptions {
                prompt,
                work_dir: work_dir.to_path_buf(),
                model,
                api_key,
                max_turns,
                max_budget_usd,
                event_sink: Some(event_tx),
                cancel: cancel.clone(),
                deadline,
            })
            .await;
        let _ = forwarder.await;

        let outcome = result?;
        tracing::info!(
            task_id = %task.id,
            exit_code = outcome.exit_code,
            duration_seconds = outcome.duration.as_secs(),
            "CLI execution completed"
        );
        Ok(outcome)
    }

    /// Builds the prompt for the run: the original prompt verbatim on the
    /// first iteration, otherwise a bounded summary of prior iterations
    /// followed by the current instruction.
    async fn build_prompt(&self, task: &Task) -> String {
        let current = task.effective_prompt();
        if task.iteration <= 1 {
            return current.to_string();
        }
        let iterations = self
            .tasks
            .get_iterations(&task.id)
            .await
            .unwrap_or_default();
        if iterations.is_empty() {
            return current.to_string();
        }
        build_context_prompt(&iterations, current)
    }

    async fn interrupted(
        &self,
        task: &Task,
        interrupt: Interrupt,
        timeout: u64,
        started_at: DateTime<Utc>,
    ) {
        match interrupt {
            Interrupt::TimedOut => {
                let _ = self
                    .bus
                    .emit_system(
                        &task.id,
                        "task_timeout",
                        json!({ "timeout_seconds": timeout }),
                    )
                    .await;
                self.fail_task(task, &format!("task timed out after {timeout}s"), started_at)
                    .await;
            }
            Interrupt::Cancelled => {
                let _ = self
                    .bus
                    .emit_system(&task.id, "task_cancelled", json!({}))
                    .await;
                self.fail_task(task, "cancelled by user", started_at).await;
            }
        }
    }

    /// Fail-path tail. Runs to completion regardless of the task token; a
    /// cancelled task must still reach `failed`, emit done, and fire its
    /// webhook.
    async fn fail_task(&self, task: &Task, message: &str, started_at: DateTime<Utc>) {
        tracing::error!(task_id = %task.id, error = message, "task failed");

        if let Err(error) = self.tasks.set_error(&task.id, message).await {
            tracing::error!(task_id = %task.id, %error, "failed to store error");
        }
        if let Err(error) = self.tasks.update_status(&task.id, TaskStatus::Failed).await {
            tracing::error!(task_id = %task.id, %error, "failed to update status to failed");
        }

        let ended_at = Utc::now();
        if let Err(error) = self
            .tasks
            .save_iteration(
                &task.id,
                &Iteration {
                    number: task.iteration,
                    prompt: task.effective_prompt().to_string(),
                    result: String::new(),
                    error: message.to_string(),
                    status: TaskStatus::Failed,
                    changes: None,
                    usage: None,
                    started_at,
                    ended_at: Some(ended_at),
                },
            )
            .await
        {
            tracing::error!(task_id = %task.id, %error, "failed to save iteration record");
        }

        let _ = self
            .bus
            .emit_system(&task.id, "task_failed", json!({ "error": message }))
            .await;
        let _ = self.bus.emit_done(&task.id, TaskStatus::Failed, None).await;

        if !task.callback_url.is_empty() {
            self.send_webhook(task, WebhookPayload {
                task_id: task.id.clone(),
                status: TaskStatus::Failed.as_str().to_string(),
                result: String::new(),
                error: message.to_string(),
                changes_summary: None,
                usage: None,
                trace_id: task.trace_id.clone(),
                finished_at: Utc::now(),
            })
            .await;
        }
    }

    /// Best-effort follow-up push onto an already-created PR branch, plus a
    /// description refresh so reviewers see the newest instruction.
    async fn push_follow_up(&self, task: &Task, work_dir: &Path) {
        let commit_message = format!(
            "chore(codeforge): follow-up iteration {}\n\nTask ID: {}",
            task.iteration, task.id
        );
        if let Err(error) = push_existing_branch(&BranchOptions {
            work_dir: work_dir.to_path_buf(),
            branch_name: task.branch.clone(),
            commit_message,
            author_name: "CodeForge Bot".to_string(),
            author_email: "codeforge@noreply".to_string(),
            token: task.access_token.clone(),
        })
        .await
        {
            tracing::warn!(task_id = %task.id, %error, "follow-up push failed");
            return;
        }

        if let Some(pr_number) = task.pr_number {
            let domains = std::collections::BTreeMap::new();
            if let Ok(repo) = forge_git::parse_repo_url(&task.repo_url, &domains) {
                let description = format!(
                    "Automated changes by CodeForge.\n\nLatest instruction (iteration {}): {}",
                    task.iteration,
                    truncate_chars(task.effective_prompt(), 200)
                );
                if let Err(error) =
                    update_pr_description(&repo, &task.access_token, pr_number, &description).await
                {
                    tracing::debug!(task_id = %task.id, %error, "PR description refresh failed");
                }
            }
        }
    }

    async fn send_webhook(&self, task: &Task, payload: WebhookPayload) {
        let Some(webhook) = &self.webhook else {
            return;
        };
        if let Err(error) = webhook.send(&task.callback_url, &payload).await {
            tracing::error!(task_id = %task.id, %error, "webhook delivery failed");
        }
    }
}

/// Effective timeout: the per-task override when set, otherwise the default,
/// never above the server maximum.
fn clamp_timeout(requested: u64, default: u64, max: u64) -> u64 {
    let timeout = if requested > 0 { requested } else { default };
    timeout.min(max)
}

/// Runs a step under the outer cancellation token and the iteration deadline.
async fn bounded<T>(
    cancel: &CancelToken,
    deadline: Instant,
    step: impl Future<Output = T>,
) -> Result<T, Interrupt> {
    tokio::select! {
        result = step => Ok(result),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::TimedOut),
    }
}

/// Prior-iteration context block: newest entries are kept within the budget,
/// oldest are truncated first, and the current instruction closes the prompt
/// under its own header.
fn build_context_prompt(iterations: &[Iteration], current: &str) -> String {
    let entries: Vec<String> = iterations
        .iter()
        .map(|iteration| {
            format!(
                "### Iteration {}\n**Prompt:** {}\n**Result summary:** {}\n**Status:** {}\n\n",
                iteration.number, iteration.prompt, iteration.result, iteration.status
            )
        })
        .collect();

    let mut total = 0usize;
    let mut kept_from = entries.len();
    for (index, entry) in entries.iter().enumerate().rev() {
        if total + entry.len() > MAX_CONTEXT_CHARS {
            break;
        }
        total += entry.len();
        kept_from = index;
    }

    let mut prompt = String::from("## Previous iterations on this codebase:\n\n");
    if kept_from > 0 {
        prompt.push_str("(earlier iterations truncated for context limits)\n\n");
    }
    for entry in &entries[kept_from..] {
        prompt.push_str(entry);
    }
    prompt.push_str("## Current instruction:\n\n");
    prompt.push_str(current);
    prompt
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(max).collect();
    shortened.push_str("...");
    shortened
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use forge_task::{Iteration, TaskStatus};

    use super::{build_context_prompt, clamp_timeout, truncate_chars, MAX_CONTEXT_CHARS};

    fn iteration(number: u32, prompt: &str, result: &str) -> Iteration {
        Iteration {
            number,
            prompt: prompt.to_string(),
            result: result.to_string(),
            error: String::new(),
            status: TaskStatus::Completed,
            changes: None,
            usage: None,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        }
    }

    #[test]
    fn unit_context_prompt_orders_iterations_before_instruction() {
        let iterations = vec![
            iteration(1, "Add hello world", "added function"),
            iteration(2, "Now add tests", "added tests"),
        ];
        let prompt = build_context_prompt(&iterations, "Document the module");

        let first = prompt.find("### Iteration 1").expect("iteration 1 present");
        let second = prompt.find("### Iteration 2").expect("iteration 2 present");
        let instruction = prompt
            .find("## Current instruction:")
            .expect("instruction header present");
        assert!(first < second && second < instruction);
        assert!(prompt.ends_with("Document the module"));
        assert!(!prompt.contains("truncated for context limits"));
    }

    #[test]
    fn functional_context_prompt_truncates_oldest_first() {
        let big = "x".repeat(MAX_CONTEXT_CHARS / 2);
        let iterations = vec![
            iteration(1, "first", &big),
            iteration(2, "second", &big),
            iteration(3, "third", &big),
        ];
        let prompt = build_context_prompt(&iterations, "continue");

        assert!(prompt.contains("truncated for context limits"));
        assert!(!prompt.contains("### Iteration 1"));
        assert!(prompt.contains("### Iteration 3"));
        assert!(prompt.ends_with("continue"));
    }

    #[test]
    fn unit_timeout_clamps_to_the_server_maximum() {
        assert_eq!(clamp_timeout(0, 300, 1800), 300);
        assert_eq!(clamp_timeout(600, 300, 1800), 600);
        assert_eq!(clamp_timeout(7200, 300, 1800), 1800);
        assert_eq!(clamp_timeout(0, 3600, 1800), 1800);
    }

    #[test]
    fn unit_truncate_is_char_safe() {
        assert_eq!(truncate_chars("short", 10), "short");
        let truncated = truncate_chars(&"é".repeat(20), 5);
        assert_eq!(truncated, format!("{}...", "é".repeat(5)));
    }
}
