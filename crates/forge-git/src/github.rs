use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::pr::{PrCreateOptions, PrHandle};
use crate::provider::RepoInfo;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Minimal GitHub REST client for pull-request creation.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubPrResponse {
    html_url: String,
    number: u64,
}

impl GitHubClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: None,
        }
    }

    /// Overrides the API base URL; used by tests against a mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn api_base(&self, repo: &RepoInfo) -> String {
        self.base_url.clone().unwrap_or_else(|| repo.api_url())
    }

    /// Opens a pull request, then best-effort attaches the `codeforge` label.
    pub async fn create_pr(
        &self,
        repo: &RepoInfo,
        token: &str,
        opts: &PrCreateOptions,
    ) -> Result<PrHandle> {
        let endpoint = format!(
            "{}/repos/{}/{}/pulls",
            self.api_base(repo),
            repo.owner,
            repo.repo
        );

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .json(&json!({
                "title": opts.title,
                "body": opts.description,
                "head": opts.branch,
                "base": opts.base_branch,
            }))
            .send()
            .await
            .context("github API request")?;

        let status = response.status();
        let body = response.text().await.context("reading github response")?;
        if status != reqwest::StatusCode::CREATED {
            bail!(
                "github API returned {}: {}",
                status.as_u16(),
                truncate(&body, 500)
            );
        }

        let created: GitHubPrResponse =
            serde_json::from_str(&body).context("parsing github PR response")?;

        self.add_label(repo, token, created.number).await;

        Ok(PrHandle {
            url: created.html_url,
            number: created.number,
        })
    }

    async fn add_label(&self, repo: &RepoInfo, token: &str, pr_number: u64) {
        let endpoint = format!(
            "{}/repos/{}/{}/issues/{}/labels",
            self.api_base(repo),
            repo.owner,
            repo.repo,
            pr_number
        );
        let result = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "labels": ["codeforge"] }))
            .send()
            .await;
        if let Err(error) = result {
            tracing::debug!(pr_number, %error, "label attach failed");
        }
    }

    /// Replaces the body of an existing pull request.
    pub async fn update_pr(
        &self,
        repo: &RepoInfo,
        token: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<()> {
        let endpoint = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.api_base(repo),
            repo.owner,
            repo.repo,
            pr_number
        );
        let response = self
            .client
            .patch(&endpoint)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("github PATCH PR request")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("github PATCH PR returned {}", response.status().as_u16());
        }
        Ok(())
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    format!("{}...", &text[..max])
}
