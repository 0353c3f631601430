use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Git hosting provider detected from a repository URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
    Unknown,
}

impl Provider {
    /// Stable lowercase wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Unknown => "unknown",
        }
    }
}

/// Parsed repository coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub provider: Provider,
    pub host: String,
    pub owner: String,
    pub repo: String,
}

impl RepoInfo {
    /// Returns `owner/repo` (the owner may contain GitLab subgroup segments).
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Base API URL for the provider, covering github.com, GitHub Enterprise,
    /// gitlab.com, and self-hosted GitLab.
    pub fn api_url(&self) -> String {
        match self.provider {
            Provider::GitHub => {
                if self.host == "github.com" {
                    "https://api.github.com".to_string()
                } else {
                    format!("https://{}/api/v3", self.host)
                }
            }
            Provider::GitLab => format!("https://{}", self.host),
            Provider::Unknown => String::new(),
        }
    }
}

/// Extracts provider, owner, and repository name from an HTTPS git URL.
/// Custom hosts resolve through `provider_domains` (host -> provider name).
pub fn parse_repo_url(
    repo_url: &str,
    provider_domains: &BTreeMap<String, String>,
) -> Result<RepoInfo> {
    let parsed = Url::parse(repo_url).context("invalid repo URL")?;
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    let path = parsed
        .path()
        .trim_matches('/')
        .trim_end_matches(".git")
        .to_string();
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.len() < 2 {
        bail!("cannot extract owner/repo from URL: {repo_url}");
    }

    // GitLab subgroups: group/subgroup/repo keeps everything but the last
    // segment as the owner path.
    let (owner, repo) = {
        let repo = parts[parts.len() - 1].to_string();
        let owner = parts[..parts.len() - 1].join("/");
        (owner, repo)
    };

    Ok(RepoInfo {
        provider: detect_provider(&host, provider_domains),
        host,
        owner,
        repo,
    })
}

fn detect_provider(host: &str, provider_domains: &BTreeMap<String, String>) -> Provider {
    if let Some(name) = provider_domains.get(host) {
        match name.to_ascii_lowercase().as_str() {
            "github" => return Provider::GitHub,
            "gitlab" => return Provider::GitLab,
            _ => {}
        }
    }

    if host == "github.com" || host.ends_with(".github.com") {
        Provider::GitHub
    } else if host == "gitlab.com" || host.ends_with(".gitlab.com") {
        Provider::GitLab
    } else {
        Provider::Unknown
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{parse_repo_url, Provider};

    #[test]
    fn unit_parses_github_https_url() {
        let info = parse_repo_url("https://github.com/acme/app.git", &BTreeMap::new())
            .expect("parse github URL");
        assert_eq!(info.provider, Provider::GitHub);
        assert_eq!(info.host, "github.com");
        assert_eq!(info.full_name(), "acme/app");
        assert_eq!(info.api_url(), "https://api.github.com");
    }

    #[test]
    fn unit_parses_gitlab_subgroup_path() {
        let info = parse_repo_url(
            "https://gitlab.com/group/subgroup/app.git",
            &BTreeMap::new(),
        )
        .expect("parse gitlab URL");
        assert_eq!(info.provider, Provider::GitLab);
        assert_eq!(info.owner, "group/subgroup");
        assert_eq!(info.repo, "app");
        assert_eq!(info.api_url(), "https://gitlab.com");
    }

    #[test]
    fn functional_custom_domain_mapping_overrides_detection() {
        let mut domains = BTreeMap::new();
        domains.insert("git.example.com".to_string(), "gitlab".to_string());
        let info = parse_repo_url("https://git.example.com/team/app.git", &domains)
            .expect("parse custom domain URL");
        assert_eq!(info.provider, Provider::GitLab);
        assert_eq!(info.api_url(), "https://git.example.com");
    }

    #[test]
    fn unit_enterprise_github_api_url() {
        let mut domains = BTreeMap::new();
        domains.insert("github.corp.example".to_string(), "github".to_string());
        let info = parse_repo_url("https://github.corp.example/acme/app", &domains)
            .expect("parse enterprise URL");
        assert_eq!(info.api_url(), "https://github.corp.example/api/v3");
    }

    #[test]
    fn unit_unknown_host_and_file_urls() {
        let info = parse_repo_url("https://code.internal/owner/repo.git", &BTreeMap::new())
            .expect("parse unknown host URL");
        assert_eq!(info.provider, Provider::Unknown);

        let file = parse_repo_url("file:///tmp/fixtures/repo.git", &BTreeMap::new());
        assert!(file.is_err(), "file URLs carry no owner/repo coordinates");
    }

    #[test]
    fn regression_rejects_urls_without_owner_and_repo() {
        let error = parse_repo_url("https://github.com/onlyowner", &BTreeMap::new())
            .expect_err("single-segment path must fail");
        assert!(error.to_string().contains("owner/repo"));
    }
}
