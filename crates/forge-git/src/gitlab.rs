use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::pr::{PrCreateOptions, PrHandle};
use crate::provider::RepoInfo;

/// Minimal GitLab REST client for merge-request creation.
pub struct GitLabClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabMrResponse {
    web_url: String,
    iid: u64,
}

impl GitLabClient {
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

    fn project_path(repo: &RepoInfo) -> String {
        urlencode(&repo.full_name())
    }

    /// Opens a merge request labelled `codeforge`.
    pub async fn create_mr(
        &self,
        repo: &RepoInfo,
        token: &str,
        opts: &PrCreateOptions,
    ) -> Result<PrHandle> {
        let endpoint = format!(
            "{}/api/v4/projects/{}/merge_requests",
            self.api_base(repo),
            Self::project_path(repo)
        );

        let response = self
            .client
            .post(&endpoint)
            .header("PRIVATE-TOKEN", token)
            .json(&json!({
                "title": opts.title,
                "description": opts.description,
                "source_branch": opts.branch,
                "target_branch": opts.base_branch,
                "labels": "codeforge",
            }))
            .send()
            .await
            .context("gitlab API request")?;

        let status = response.status();
        let body = response.text().await.context("reading gitlab response")?;
        if status != reqwest::StatusCode::CREATED {
            bail!(
                "gitlab API returned {}: {}",
                status.as_u16(),
                truncate(&body, 500)
            );
        }

        let created: GitLabMrResponse =
            serde_json::from_str(&body).context("parsing gitlab MR response")?;

        Ok(PrHandle {
            url: created.web_url,
            number: created.iid,
        })
    }

    /// Replaces the description of an existing merge request.
    pub async fn update_mr(
        &self,
        repo: &RepoInfo,
        token: &str,
        mr_iid: u64,
        description: &str,
    ) -> Result<()> {
        let endpoint = format!(
            "{}/api/v4/projects/{}/merge_requests/{}",
            self.api_base(repo),
            Self::project_path(repo),
            mr_iid
        );
        let response = self
            .client
            .put(&endpoint)
            .header("PRIVATE-TOKEN", token)
            .json(&json!({ "description": description }))
            .send()
            .await
            .context("gitlab PUT MR request")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("gitlab PUT MR returned {}", response.status().as_u16());
        }
        Ok(())
    }
}

impl Default for GitLabClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent-encodes a project path the way the GitLab API expects
/// (`group/subgroup/repo` becomes `group%2Fsubgroup%2Frepo`).
fn urlencode(path: &str) -> String {
    path.replace('/', "%2F")
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    format!("{}...", &text[..max])
}
