use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::askpass::AskPass;
use crate::command::{git, git_output};

/// Options for committing workspace changes and pushing a branch.
#[derive(Debug, Clone)]
pub struct BranchOptions {
    pub work_dir: PathBuf,
    pub branch_name: String,
    pub commit_message: String,
    pub author_name: String,
    pub author_email: String,
    pub token: String,
}

/// Creates a branch, stages everything, commits, and pushes with upstream
/// tracking. Fails if there is nothing to commit.
pub async fn create_branch_and_push(opts: &BranchOptions) -> Result<()> {
    let work_dir = opts.work_dir.as_path();

    git(work_dir, &[], &["checkout", "-b", &opts.branch_name])
        .await
        .context("creating branch")?;
    tracing::info!(branch = %opts.branch_name, "branch created");

    git(work_dir, &[], &["add", "-A"])
        .await
        .context("staging changes")?;
    let status = git_output(work_dir, &[], &["status", "--porcelain"])
        .await
        .context("checking status")?;
    if status.trim().is_empty() {
        bail!("nothing to commit");
    }
    commit(opts).await?;

    let (push_env, _helper) = AskPass::env(&opts.token)?;
    git(
        work_dir,
        &push_env,
        &["push", "-u", "origin", &opts.branch_name],
    )
    .await
    .context("pushing branch")?;
    tracing::info!(branch = %opts.branch_name, "branch pushed");

    Ok(())
}

/// Stages, commits, and pushes follow-up changes to an already-created branch.
/// A clean worktree is not an error here; there is simply nothing to push.
pub async fn push_existing_branch(opts: &BranchOptions) -> Result<()> {
    let work_dir = opts.work_dir.as_path();

    git(work_dir, &[], &["add", "-A"])
        .await
        .context("staging changes")?;
    let status = git_output(work_dir, &[], &["status", "--porcelain"])
        .await
        .context("checking status")?;
    if status.trim().is_empty() {
        return Ok(());
    }

    commit(opts).await?;

    let (push_env, _helper) = AskPass::env(&opts.token)?;
    git(work_dir, &push_env, &["push", "origin", &opts.branch_name])
        .await
        .context("pushing to branch")?;
    Ok(())
}

async fn commit(opts: &BranchOptions) -> Result<()> {
    let identity = vec![
        ("GIT_AUTHOR_NAME".to_string(), opts.author_name.clone()),
        ("GIT_AUTHOR_EMAIL".to_string(), opts.author_email.clone()),
        ("GIT_COMMITTER_NAME".to_string(), opts.author_name.clone()),
        ("GIT_COMMITTER_EMAIL".to_string(), opts.author_email.clone()),
    ];
    git(
        opts.work_dir.as_path(),
        &identity,
        &["commit", "-m", &opts.commit_message],
    )
    .await
    .context("committing changes")?;
    tracing::info!(branch = %opts.branch_name, "changes committed");
    Ok(())
}

/// Pulls the latest commits for a previously-pushed branch, authenticating
/// through the askpass helper.
pub async fn pull_branch(work_dir: &Path, branch: &str, token: &str) -> Result<()> {
    let (env, _helper) = AskPass::env(token)?;
    git(work_dir, &env, &["pull", "origin", branch])
        .await
        .context("pulling branch")
}

/// Picks `{prefix}{slug}`, appending `-1`, `-2`, ... while the candidate
/// already exists locally or on origin.
pub async fn generate_branch_name(work_dir: &Path, prefix: &str, slug: &str) -> String {
    let base = format!("{prefix}{slug}");
    let mut name = base.clone();
    for suffix in 1..=99 {
        if !branch_exists(work_dir, &name).await {
            return name;
        }
        name = format!("{base}-{suffix}");
    }
    name
}

async fn branch_exists(work_dir: &Path, name: &str) -> bool {
    if git(work_dir, &[], &["rev-parse", "--verify", name])
        .await
        .is_ok()
    {
        return true;
    }
    let remote = format!("origin/{name}");
    git(work_dir, &[], &["rev-parse", "--verify", &remote])
        .await
        .is_ok()
}

/// Conventional-format commit message carrying the task id and a co-author
/// trailer.
pub fn format_commit_message(
    title: &str,
    task_id: &str,
    author_name: &str,
    author_email: &str,
) -> String {
    format!(
        "feat(codeforge): {title}\n\nTask ID: {task_id}\nCo-authored-by: {author_name} <{author_email}>"
    )
}

#[cfg(test)]
mod tests {
    use super::format_commit_message;

    #[test]
    fn unit_commit_message_carries_task_id_and_trailer() {
        let message = format_commit_message(
            "Add hello world",
            "0a1b2c3d-e4f5",
            "CodeForge Bot",
            "codeforge@noreply",
        );
        assert!(message.starts_with("feat(codeforge): Add hello world\n"));
        assert!(message.contains("Task ID: 0a1b2c3d-e4f5"));
        assert!(message.ends_with("Co-authored-by: CodeForge Bot <codeforge@noreply>"));
    }
}
