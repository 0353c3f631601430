use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

const ANALYZER_MODEL: &str = "claude-haiku-4-5-20250929";
const ANALYZER_MAX_TOKENS: u32 = 256;
const ANALYZER_TIMEOUT: Duration = Duration::from_secs(10);
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const SLUG_MAX_CHARS: usize = 40;

/// Auto-generated PR metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub branch_slug: String,
    pub pr_title: String,
    pub description: String,
}

/// Best-effort PR metadata generation backed by a lightweight model call.
///
/// Any failure (no key, transport, malformed reply) falls back to
/// deterministic values so PR creation never blocks on the analyzer.
pub struct Analyzer {
    api_key: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AnalyzerReply {
    branch_slug: String,
    #[serde(default)]
    pr_title: String,
    #[serde(default)]
    description: String,
}

impl Analyzer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            client: reqwest::Client::builder()
                .timeout(ANALYZER_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Overrides the API endpoint; used by tests against a mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Produces branch slug, PR title, and description for a task.
    pub async fn analyze(&self, prompt: &str, diff_stats: &str, task_id: &str) -> AnalysisResult {
        if self.api_key.is_empty() {
            return fallback_result(prompt, task_id);
        }
        match self.call_api(prompt, diff_stats).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, "analyzer call failed, using fallback metadata");
                fallback_result(prompt, task_id)
            }
        }
    }

    async fn call_api(&self, prompt: &str, diff_stats: &str) -> Result<AnalysisResult> {
        let system_prompt = "You generate metadata for a git pull request. Given a task description and diff stats, produce:\n\
1. branch_slug: a short kebab-case slug (max 40 chars, no special chars except hyphens)\n\
2. pr_title: a concise PR title (max 72 chars)\n\
3. description: a 1-3 sentence PR description\n\n\
Respond ONLY with valid JSON: {\"branch_slug\":\"...\",\"pr_title\":\"...\",\"description\":\"...\"}";
        let user_message = format!(
            "Task: {}\n\nChanges: {}",
            truncate_chars(prompt, 1000),
            diff_stats
        );

        let endpoint = self
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_API_URL)
            .to_string();

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": ANALYZER_MODEL,
                "max_tokens": ANALYZER_MAX_TOKENS,
                "messages": [
                    {"role": "user", "content": format!("{system_prompt}\n\n{user_message}")}
                ],
            }))
            .send()
            .await
            .context("anthropic API request")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("anthropic API returned {}", response.status().as_u16());
        }

        let body: Value = response.json().await.context("reading analyzer response")?;
        parse_analyzer_response(&body)
    }
}

fn parse_analyzer_response(body: &Value) -> Result<AnalysisResult> {
    let text = body
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str)
        .context("empty response from analyzer")?;

    let reply: AnalyzerReply =
        serde_json::from_str(text).context("parsing analyzer output")?;

    let slug = sanitize_slug(&reply.branch_slug);
    if slug.is_empty() {
        bail!("empty branch slug from analyzer");
    }

    Ok(AnalysisResult {
        branch_slug: slug,
        pr_title: reply.pr_title,
        description: reply.description,
    })
}

fn fallback_result(prompt: &str, task_id: &str) -> AnalysisResult {
    let short_id: String = task_id.chars().take(8).collect();
    let mut title = truncate_chars(prompt, 60);
    if prompt.chars().count() > 60 {
        title.push_str("...");
    }
    AnalysisResult {
        branch_slug: format!("task-{short_id}"),
        pr_title: format!("CodeForge: {title}"),
        description: "Automated changes by CodeForge.".to_string(),
    }
}

fn slug_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new("[^a-z0-9-]").expect("slug regex"))
}

/// Lowercases, replaces anything outside `[a-z0-9-]`, collapses hyphen runs,
/// and bounds the slug to 40 characters.
pub fn sanitize_slug(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut slug = slug_regex().replace_all(&lowered, "-").into_owned();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > SLUG_MAX_CHARS {
        slug.truncate(SLUG_MAX_CHARS);
        slug = slug.trim_end_matches('-').to_string();
    }
    slug
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{sanitize_slug, Analyzer};

    #[test]
    fn unit_sanitize_slug_normalizes_input() {
        assert_eq!(sanitize_slug("Add Hello World!"), "add-hello-world");
        assert_eq!(sanitize_slug("--already--kebab--"), "already-kebab");
        assert_eq!(sanitize_slug("___"), "");
        let long = sanitize_slug(&"a".repeat(60));
        assert_eq!(long.len(), 40);
    }

    #[tokio::test]
    async fn integration_analyze_parses_model_reply() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/").header("x-api-key", "ant-key");
            then.status(200).json_body(json!({
                "content": [{
                    "type": "text",
                    "text": "{\"branch_slug\":\"Add Hello!\",\"pr_title\":\"Add hello world\",\"description\":\"Adds a greeting.\"}",
                }],
            }));
        });

        let result = Analyzer::new("ant-key")
            .with_base_url(server.base_url())
            .analyze("Add a hello world function", "+10 -0", "0a1b2c3d-rest")
            .await;
        assert_eq!(result.branch_slug, "add-hello");
        assert_eq!(result.pr_title, "Add hello world");
        assert_eq!(result.description, "Adds a greeting.");
    }

    #[tokio::test]
    async fn functional_malformed_reply_falls_back() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).json_body(json!({
                "content": [{ "type": "text", "text": "not json" }],
            }));
        });

        let result = Analyzer::new("ant-key")
            .with_base_url(server.base_url())
            .analyze("Refactor the parser module", "+3 -1", "0a1b2c3d-rest")
            .await;
        assert_eq!(result.branch_slug, "task-0a1b2c3d");
        assert!(result.pr_title.starts_with("CodeForge: "));
    }

    #[tokio::test]
    async fn unit_missing_api_key_uses_fallback_without_calling_out() {
        let result = Analyzer::new("")
            .analyze(&"p".repeat(120), "+1 -1", "deadbeef-cafe")
            .await;
        assert_eq!(result.branch_slug, "task-deadbeef");
        assert!(result.pr_title.ends_with("..."));
        assert_eq!(result.description, "Automated changes by CodeForge.");
    }
}
