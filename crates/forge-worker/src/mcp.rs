use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use forge_core::{config::McpServerConfig, StoreClient};
use forge_task::McpServerSpec;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

const MCP_CONFIG_FILE: &str = ".mcp.json";

/// Resolved MCP server entry destined for the workspace manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub package: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Materializes the workspace-local `.mcp.json` manifest from global,
/// per-project, and per-task entries; later layers override by name.
pub struct McpInstaller {
    store: StoreClient,
    global: Vec<McpServer>,
}

impl McpInstaller {
    pub fn new(store: StoreClient, global: &[McpServerConfig]) -> Self {
        let global = global
            .iter()
            .map(|server| McpServer {
                name: server.name.clone(),
                package: server.package.clone(),
                args: server.args.clone(),
                env: server.env.clone(),
            })
            .collect();
        Self { store, global }
    }

    /// Resolves the merged server list and writes the manifest. With no
    /// servers configured nothing is written.
    pub async fn setup(
        &self,
        work_dir: &Path,
        repo_url: &str,
        task_servers: &[McpServerSpec],
    ) -> Result<()> {
        let project = self.project_servers(repo_url).await;
        let task: Vec<McpServer> = task_servers
            .iter()
            .map(|spec| McpServer {
                name: spec.name.clone(),
                // The task model carries the package under "command".
                package: spec.command.clone(),
                args: spec.args.clone(),
                env: spec.env.clone(),
            })
            .collect();

        let servers = merge_servers(&self.global, &project, &task);
        if servers.is_empty() {
            return Ok(());
        }
        write_mcp_config(work_dir, &servers)
    }

    /// Per-project entries registered in the store, keyed by a digest of the
    /// repository URL. Registry writes are out of band; absence is normal.
    async fn project_servers(&self, repo_url: &str) -> Vec<McpServer> {
        let key = self.store.key(&["mcp", "project", &project_digest(repo_url)]);
        let mut conn = self.store.connection();
        let fields: HashMap<String, String> = match conn.hgetall(&key).await {
            Ok(fields) => fields,
            Err(error) => {
                tracing::warn!(%error, "project MCP lookup failed");
                return Vec::new();
            }
        };
        fields
            .values()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }
}

/// Later layers override earlier ones by server name; insertion order is
/// global, then project, then task.
pub(crate) fn merge_servers(
    global: &[McpServer],
    project: &[McpServer],
    task: &[McpServer],
) -> Vec<McpServer> {
    let mut merged: Vec<McpServer> = Vec::new();
    for server in global.iter().chain(project).chain(task) {
        if server.name.is_empty() || server.package.is_empty() {
            continue;
        }
        if let Some(existing) = merged.iter_mut().find(|entry| entry.name == server.name) {
            *existing = server.clone();
        } else {
            merged.push(server.clone());
        }
    }
    merged
}

/// Writes `.mcp.json` with npx-launched server entries.
pub(crate) fn write_mcp_config(work_dir: &Path, servers: &[McpServer]) -> Result<()> {
    let mut entries = serde_json::Map::new();
    for server in servers {
        let mut args = vec!["-y".to_string(), server.package.clone()];
        args.extend(server.args.iter().cloned());

        let mut entry = json!({
            "command": "npx",
            "args": args,
        });
        if !server.env.is_empty() {
            entry["env"] = json!(server.env);
        }
        entries.insert(server.name.clone(), entry);
    }

    let config = json!({ "mcpServers": entries });
    let rendered = serde_json::to_string_pretty(&config).context("encoding MCP config")?;
    std::fs::write(work_dir.join(MCP_CONFIG_FILE), rendered).context("writing .mcp.json")?;
    Ok(())
}

fn project_digest(repo_url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(repo_url.as_bytes()));
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Value;

    use super::{merge_servers, write_mcp_config, McpServer};

    fn server(name: &str, package: &str) -> McpServer {
        McpServer {
            name: name.to_string(),
            package: package.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn unit_later_layers_override_by_name() {
        let global = vec![server("fs", "@mcp/fs"), server("search", "@mcp/search")];
        let project = vec![server("search", "@mcp/search-pinned")];
        let task = vec![server("fs", "@mcp/fs-task"), server("extra", "@mcp/extra")];

        let merged = merge_servers(&global, &project, &task);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].package, "@mcp/fs-task");
        assert_eq!(merged[1].package, "@mcp/search-pinned");
        assert_eq!(merged[2].name, "extra");
    }

    #[test]
    fn unit_incomplete_entries_are_dropped() {
        let incomplete = vec![server("", "@mcp/anonymous"), server("no-package", "")];
        assert!(merge_servers(&incomplete, &[], &[]).is_empty());
    }

    #[test]
    fn functional_manifest_shape_matches_agent_expectations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut with_env = server("fs", "@modelcontextprotocol/server-filesystem");
        with_env.args = vec!["/data".to_string()];
        with_env.env.insert("LOG_LEVEL".to_string(), "debug".to_string());

        write_mcp_config(dir.path(), &[with_env]).expect("write manifest");

        let raw = std::fs::read_to_string(dir.path().join(".mcp.json")).expect("read manifest");
        let parsed: Value = serde_json::from_str(&raw).expect("parse manifest");
        let entry = &parsed["mcpServers"]["fs"];
        assert_eq!(entry["command"], "npx");
        assert_eq!(entry["args"][0], "-y");
        assert_eq!(entry["args"][1], "@modelcontextprotocol/server-filesystem");
        assert_eq!(entry["args"][2], "/data");
        assert_eq!(entry["env"]["LOG_LEVEL"], "debug");
    }
}
