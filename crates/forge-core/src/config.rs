use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ForgeError;

/// Top-level service configuration.
///
/// Loading order: built-in defaults, then an optional YAML file, then
/// environment variables prefixed `CODEFORGE_` where `__` separates nesting
/// levels (`CODEFORGE_SERVER__AUTH_TOKEN` maps to `server.auth_token`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub workers: WorkersConfig,
    pub tasks: TasksConfig,
    pub cli: CliConfig,
    pub git: GitConfig,
    pub encryption: EncryptionConfig,
    pub mcp: McpConfig,
    pub webhooks: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            prefix: "codeforge:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub concurrency: usize,
    pub queue_name: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            queue_name: "queue:tasks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Default per-task timeout in seconds.
    pub default_timeout: u64,
    /// Hard ceiling for per-task timeouts in seconds.
    pub max_timeout: u64,
    /// Workspace (and event history) TTL in seconds.
    pub workspace_ttl: u64,
    pub workspace_base: String,
    /// Task hash and iteration list TTL in seconds, applied when finished.
    pub state_ttl: u64,
    /// Result blob TTL in seconds.
    pub result_ttl: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_timeout: 300,
            max_timeout: 1800,
            workspace_ttl: 86_400,
            workspace_base: "/data/workspaces".to_string(),
            state_ttl: 604_800,
            result_ttl: 604_800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Name of the default runner in the registry.
    pub default: String,
    pub claude_code: ClaudeCodeConfig,
    /// API key for the PR-metadata analyzer model.
    pub analyzer_api_key: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default: "claude-code".to_string(),
            claude_code: ClaudeCodeConfig::default(),
            analyzer_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeCodeConfig {
    pub path: String,
    pub default_model: String,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            path: "claude".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub branch_prefix: String,
    pub commit_author: String,
    pub commit_email: String,
    /// Maps custom hosts to a provider name ("github" or "gitlab").
    pub provider_domains: BTreeMap<String, String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "codeforge/".to_string(),
            commit_author: "CodeForge Bot".to_string(),
            commit_email: "codeforge@noreply".to_string(),
            provider_domains: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64-encoded 32-byte AES key.
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub global_servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    pub package: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub hmac_secret: String,
    pub retry_count: u32,
    /// Base retry delay in seconds; the backoff factor is 5.
    pub retry_delay: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            hmac_secret: String::new(),
            retry_count: 3,
            retry_delay: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub tasks_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "text".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from an optional YAML file plus environment
    /// variables. A missing file at the default path is ignored; an explicit
    /// path that cannot be read is an error.
    pub fn load(config_path: Option<&str>) -> Result<Self, ForgeError> {
        let mut builder = config::Config::builder();

        match config_path {
            Some(path) => {
                builder = builder.add_source(config::File::with_name(path).required(true));
            }
            None => {
                if Path::new("codeforge.yaml").exists() {
                    builder =
                        builder.add_source(config::File::with_name("codeforge").required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CODEFORGE")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|error| ForgeError::internal(format!("loading config: {error}")))?;
        let cfg: Config = loaded
            .try_deserialize()
            .map_err(|error| ForgeError::internal(format!("decoding config: {error}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ForgeError> {
        if self.redis.url.is_empty() {
            return Err(ForgeError::internal(
                "config: redis.url is required (set CODEFORGE_REDIS__URL)",
            ));
        }
        if self.server.auth_token.is_empty() {
            return Err(ForgeError::internal(
                "config: server.auth_token is required (set CODEFORGE_SERVER__AUTH_TOKEN)",
            ));
        }
        if self.encryption.key.is_empty() {
            return Err(ForgeError::internal(
                "config: encryption.key is required (set CODEFORGE_ENCRYPTION__KEY)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn unit_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.redis.prefix, "codeforge:");
        assert_eq!(cfg.workers.concurrency, 3);
        assert_eq!(cfg.workers.queue_name, "queue:tasks");
        assert_eq!(cfg.tasks.default_timeout, 300);
        assert_eq!(cfg.tasks.max_timeout, 1800);
        assert_eq!(cfg.tasks.workspace_ttl, 86_400);
        assert_eq!(cfg.tasks.state_ttl, 604_800);
        assert_eq!(cfg.webhooks.retry_count, 3);
        assert_eq!(cfg.webhooks.retry_delay, 5);
        assert_eq!(cfg.rate_limit.tasks_per_minute, 10);
        assert_eq!(cfg.git.branch_prefix, "codeforge/");
        assert_eq!(cfg.cli.default, "claude-code");
    }

    #[test]
    fn functional_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("codeforge.yaml");
        std::fs::write(
            &path,
            concat!(
                "redis:\n",
                "  url: redis://localhost:6379/0\n",
                "server:\n",
                "  port: 9090\n",
                "  auth_token: file-token\n",
                "encryption:\n",
                "  key: c2VjcmV0LWtleS1zZWNyZXQta2V5LXNlY3JldC1rZXkhIQ==\n",
                "workers:\n",
                "  concurrency: 7\n",
            ),
        )
        .expect("write yaml");

        let cfg = Config::load(Some(path.to_str().expect("utf-8 path"))).expect("load config");
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.workers.concurrency, 7);
        assert_eq!(cfg.redis.url, "redis://localhost:6379/0");
        // untouched sections keep their defaults
        assert_eq!(cfg.tasks.default_timeout, 300);
    }

    #[test]
    fn regression_missing_required_keys_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "server:\n  auth_token: tok\n").expect("write yaml");

        let error = Config::load(Some(path.to_str().expect("utf-8 path")))
            .expect_err("missing redis.url must fail");
        assert!(error.to_string().contains("redis.url"));
    }
}
