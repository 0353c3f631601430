use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::command::git_output;

/// Numeric snapshot of workspace changes taken right after a CLI run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    pub files_modified: u32,
    pub files_created: u32,
    pub files_deleted: u32,
    /// Compact "+insertions -deletions" across staged and unstaged diffs.
    pub diff_stats: String,
}

impl ChangesSummary {
    /// Returns true when at least one file was created, modified, or deleted.
    pub fn has_changes(&self) -> bool {
        self.files_modified > 0 || self.files_created > 0 || self.files_deleted > 0
    }
}

/// Computes a [`ChangesSummary`] from `git status --porcelain` plus the
/// shortstat of both the staged and unstaged diffs.
pub async fn calculate_changes(work_dir: &Path) -> Result<ChangesSummary> {
    let status = git_output(work_dir, &[], &["status", "--porcelain"])
        .await
        .context("git status")?;
    let mut summary = count_porcelain(&status);

    let (unstaged_insertions, unstaged_deletions) = short_stat(work_dir, false).await;
    let (staged_insertions, staged_deletions) = short_stat(work_dir, true).await;

    summary.diff_stats = format!(
        "+{} -{}",
        unstaged_insertions + staged_insertions,
        unstaged_deletions + staged_deletions
    );
    Ok(summary)
}

/// Tallies porcelain status lines into created/modified/deleted counts.
fn count_porcelain(status: &str) -> ChangesSummary {
    let mut summary = ChangesSummary::default();
    for line in status.lines() {
        if line.len() < 3 {
            continue;
        }
        match &line[..2] {
            "??" | "A " | " A" | "AM" => summary.files_created += 1,
            " D" | "D " => summary.files_deleted += 1,
            " M" | "M " | "MM" | "R " | "RM" => summary.files_modified += 1,
            _ => {}
        }
    }
    summary
}

async fn short_stat(work_dir: &Path, cached: bool) -> (u32, u32) {
    let args: &[&str] = if cached {
        &["diff", "--cached", "--shortstat"]
    } else {
        &["diff", "--shortstat"]
    };
    match git_output(work_dir, &[], args).await {
        Ok(out) => parse_short_stat(&out),
        Err(_) => (0, 0),
    }
}

fn short_stat_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(\d+) insertions?\(\+\).*?(\d+) deletions?\(-\)|(\d+) insertions?\(\+\)|(\d+) deletions?\(-\)",
        )
        .expect("shortstat regex")
    })
}

/// Parses `git diff --shortstat` output such as
/// `"3 files changed, 142 insertions(+), 38 deletions(-)"`, including the
/// insertions-only and deletions-only forms.
fn parse_short_stat(raw: &str) -> (u32, u32) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (0, 0);
    }

    let Some(captures) = short_stat_regex().captures(trimmed) else {
        return (0, 0);
    };

    let group = |index: usize| {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<u32>().ok())
    };

    if let (Some(insertions), Some(deletions)) = (group(1), group(2)) {
        return (insertions, deletions);
    }
    if let Some(insertions) = group(3) {
        return (insertions, 0);
    }
    if let Some(deletions) = group(4) {
        return (0, deletions);
    }
    (0, 0)
}
