//! Git plumbing for CodeForge workspaces.
//!
//! Covers token-safe clones through an askpass helper, porcelain/shortstat
//! diff summaries, branch create/commit/push, repository provider detection,
//! and the GitHub/GitLab PR APIs.

pub mod askpass;
pub mod branch;
pub mod clone;
pub mod diff;
pub mod github;
pub mod gitlab;
pub mod pr;
pub mod provider;

mod command;

pub use askpass::AskPass;
pub use branch::{
    create_branch_and_push, format_commit_message, generate_branch_name, pull_branch,
    push_existing_branch, BranchOptions,
};
pub use clone::{clone, redact_secret, sanitize_url, CloneOptions};
pub use diff::{calculate_changes, ChangesSummary};
pub use pr::{create_pr, update_pr_description, PrCreateOptions, PrHandle};
pub use provider::{parse_repo_url, Provider, RepoInfo};
