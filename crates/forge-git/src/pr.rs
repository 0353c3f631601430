use anyhow::{bail, Result};

use crate::github::GitHubClient;
use crate::gitlab::GitLabClient;
use crate::provider::{Provider, RepoInfo};

/// Parameters for opening a pull/merge request.
#[derive(Debug, Clone)]
pub struct PrCreateOptions {
    pub title: String,
    pub description: String,
    pub branch: String,
    pub base_branch: String,
}

/// Coordinates of a created pull/merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrHandle {
    pub url: String,
    pub number: u64,
}

/// Opens a PR/MR on the provider detected from the repository URL.
pub async fn create_pr(repo: &RepoInfo, token: &str, opts: &PrCreateOptions) -> Result<PrHandle> {
    match repo.provider {
        Provider::GitHub => GitHubClient::new().create_pr(repo, token, opts).await,
        Provider::GitLab => GitLabClient::new().create_mr(repo, token, opts).await,
        Provider::Unknown => bail!(
            "PR creation not supported for provider: {}",
            repo.provider.as_str()
        ),
    }
}

/// Updates the description of an existing PR/MR, dispatched by provider.
pub async fn update_pr_description(
    repo: &RepoInfo,
    token: &str,
    number: u64,
    body: &str,
) -> Result<()> {
    match repo.provider {
        Provider::GitHub => GitHubClient::new().update_pr(repo, token, number, body).await,
        Provider::GitLab => {
            GitLabClient::new()
                .update_mr(repo, token, number, body)
                .await
        }
        Provider::Unknown => bail!(
            "PR update not supported for provider: {}",
            repo.provider.as_str()
        ),
    }
}
