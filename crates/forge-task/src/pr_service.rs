use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use forge_core::ForgeError;
use forge_git::{
    create_branch_and_push, create_pr, format_commit_message, generate_branch_name,
    parse_repo_url, BranchOptions, PrCreateOptions, Provider,
};
use forge_runner::Analyzer;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::TaskStatus;
use crate::service::TaskService;
use crate::stream::EventBus;

/// Configuration for the PR creation workflow.
#[derive(Debug, Clone)]
pub struct PrServiceConfig {
    pub workspace_base: PathBuf,
    pub branch_prefix: String,
    pub commit_author: String,
    pub commit_email: String,
    pub provider_domains: BTreeMap<String, String>,
}

/// Request body for `POST /tasks/{id}/create-pr`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreatePrRequest {
    pub title: String,
    pub description: String,
    pub target_branch: String,
}

/// Response for a successful PR creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePrResponse {
    pub pr_url: String,
    pub pr_number: u64,
    pub branch: String,
}

/// Explicit-request PR workflow: state transition, metadata resolution,
/// commit/push, provider API call, and state reconciliation.
pub struct PrService {
    tasks: Arc<TaskService>,
    bus: Arc<EventBus>,
    analyzer: Analyzer,
    cfg: PrServiceConfig,
}

impl PrService {
    pub fn new(
        tasks: Arc<TaskService>,
        bus: Arc<EventBus>,
        analyzer: Analyzer,
        cfg: PrServiceConfig,
    ) -> Self {
        Self {
            tasks,
            bus,
            analyzer,
            cfg,
        }
    }

    /// Runs the full flow. Any failure after the `creating_pr` transition
    /// moves the task to `failed` and stops.
    pub async fn create_pr(
        &self,
        task_id: &str,
        req: CreatePrRequest,
    ) -> Result<CreatePrResponse, ForgeError> {
        let task = self.tasks.get(task_id).await?;

        if task.status != TaskStatus::Completed {
            return Err(ForgeError::conflict(format!(
                "task must be in completed status, currently: {}",
                task.status
            )));
        }

        let has_changes = task
            .changes_summary
            .as_ref()
            .map(|changes| changes.has_changes())
            .unwrap_or(false);
        if !has_changes {
            return Err(ForgeError::validation("no changes to create PR for"));
        }

        self.tasks
            .update_status(task_id, TaskStatus::CreatingPr)
            .await?;

        let repo = match parse_repo_url(&task.repo_url, &self.cfg.provider_domains) {
            Ok(repo) => repo,
            Err(error) => {
                let error = ForgeError::validation(format!("parsing repo URL: {error}"));
                self.fail_pr(task_id, &error).await;
                return Err(error);
            }
        };
        if repo.provider == Provider::Unknown {
            let error = ForgeError::NotSupported(format!(
                "PR creation not supported for host: {}",
                repo.host
            ));
            self.fail_pr(task_id, &error).await;
            return Err(error);
        }

        // Caller-provided metadata wins; the analyzer fills the gaps.
        let mut title = req.title;
        let mut description = req.description;
        let branch_slug;
        if title.is_empty() || description.is_empty() {
            let diff_stats = task
                .changes_summary
                .as_ref()
                .map(|changes| changes.diff_stats.clone())
                .unwrap_or_default();
            let analysis = self.analyzer.analyze(&task.prompt, &diff_stats, task_id).await;
            if title.is_empty() {
                title = analysis.pr_title;
            }
            if description.is_empty() {
                description = analysis.description;
            }
            branch_slug = analysis.branch_slug;
        } else {
            branch_slug = format!("task-{}", task_id.chars().take(8).collect::<String>());
        }

        let base_branch = if !req.target_branch.is_empty() {
            req.target_branch
        } else {
            task.config
                .as_ref()
                .filter(|config| !config.target_branch.is_empty())
                .map(|config| config.target_branch.clone())
                .unwrap_or_else(|| "main".to_string())
        };

        let work_dir = self.cfg.workspace_base.join(task_id);
        let branch_name =
            generate_branch_name(&work_dir, &self.cfg.branch_prefix, &branch_slug).await;
        let commit_message = format_commit_message(
            &title,
            task_id,
            &self.cfg.commit_author,
            &self.cfg.commit_email,
        );

        if let Err(error) = create_branch_and_push(&BranchOptions {
            work_dir: work_dir.clone(),
            branch_name: branch_name.clone(),
            commit_message,
            author_name: self.cfg.commit_author.clone(),
            author_email: self.cfg.commit_email.clone(),
            token: task.access_token.clone(),
        })
        .await
        {
            let error = ForgeError::internal(format!("creating branch and pushing: {error}"));
            self.fail_pr(task_id, &error).await;
            return Err(error);
        }
        let _ = self
            .bus
            .emit_git(task_id, "branch_created", json!({ "branch": branch_name }))
            .await;
        let _ = self
            .bus
            .emit_git(task_id, "push_completed", json!({ "branch": branch_name }))
            .await;

        let handle = match create_pr(
            &repo,
            &task.access_token,
            &PrCreateOptions {
                title,
                description,
                branch: branch_name.clone(),
                base_branch,
            },
        )
        .await
        {
            Ok(handle) => handle,
            Err(error) => {
                let error = ForgeError::internal(format!("creating PR: {error}"));
                self.fail_pr(task_id, &error).await;
                return Err(error);
            }
        };

        self.tasks
            .set_pr_info(task_id, &branch_name, &handle.url, handle.number)
            .await?;
        if let Err(error) = self
            .tasks
            .update_status(task_id, TaskStatus::PrCreated)
            .await
        {
            tracing::error!(task_id, %error, "failed to transition to pr_created");
        }

        tracing::info!(task_id, pr_url = %handle.url, branch = %branch_name, "PR created");

        Ok(CreatePrResponse {
            pr_url: handle.url,
            pr_number: handle.number,
            branch: branch_name,
        })
    }

    async fn fail_pr(&self, task_id: &str, error: &ForgeError) {
        tracing::error!(task_id, %error, "PR creation failed");
        if let Err(store_error) = self
            .tasks
            .set_error(task_id, &format!("PR creation failed: {error}"))
            .await
        {
            tracing::error!(task_id, error = %store_error, "failed to record PR error");
        }
        if let Err(store_error) = self.tasks.update_status(task_id, TaskStatus::Failed).await {
            tracing::error!(task_id, error = %store_error, "failed to transition to failed");
        }
    }
}
