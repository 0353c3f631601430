use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge_core::{CancelToken, ForgeError, StoreClient};
use forge_task::{is_finished, TaskService};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Metadata tracked for a task workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub task_id: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    /// Seconds until the workspace may be swept.
    pub ttl: u64,
    pub size_bytes: u64,
}

impl Workspace {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_seconds() > self.ttl as i64
    }
}

/// Owns workspace directories on disk plus their store metadata, and runs the
/// TTL sweeper that reclaims them once their task has finished.
pub struct WorkspaceManager {
    base_path: PathBuf,
    store: StoreClient,
    ttl: u64,
}

impl WorkspaceManager {
    pub fn new(base_path: impl Into<PathBuf>, store: StoreClient, ttl: u64) -> Self {
        Self {
            base_path: base_path.into(),
            store,
            ttl,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.base_path.join(task_id)
    }

    fn meta_key(&self, task_id: &str) -> String {
        self.store.key(&["workspace", task_id])
    }

    /// Creates the workspace directory and registers its metadata.
    pub async fn create(&self, task_id: &str) -> Result<Workspace, ForgeError> {
        let path = self.path_for(task_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|error| ForgeError::internal(format!("creating workspace directory: {error}")))?;

        let workspace = Workspace {
            task_id: task_id.to_string(),
            path: path.display().to_string(),
            created_at: Utc::now(),
            ttl: self.ttl,
            size_bytes: 0,
        };

        let fields = vec![
            ("task_id".to_string(), workspace.task_id.clone()),
            ("path".to_string(), workspace.path.clone()),
            (
                "created_at".to_string(),
                workspace.created_at.to_rfc3339(),
            ),
            ("ttl".to_string(), workspace.ttl.to_string()),
            ("size_bytes".to_string(), "0".to_string()),
        ];
        let mut conn = self.store.connection();
        conn.hset_multiple::<_, _, _, ()>(self.meta_key(task_id), &fields)
            .await?;

        Ok(workspace)
    }

    /// Checks for the workspace directory on disk.
    pub async fn exists(&self, task_id: &str) -> bool {
        tokio::fs::metadata(self.path_for(task_id)).await.is_ok()
    }

    /// Removes a workspace directory and its metadata. The path is validated
    /// against the configured root before anything is deleted.
    pub async fn delete(&self, task_id: &str) -> Result<(), ForgeError> {
        let path = self.path_for(task_id);
        guard_inside_base(&self.base_path, &path)?;

        if let Err(error) = tokio::fs::remove_dir_all(&path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), %error, "failed to remove workspace directory");
            }
        }

        let mut conn = self.store.connection();
        conn.del::<_, ()>(self.meta_key(task_id)).await?;
        Ok(())
    }

    /// Recalculates and stores the workspace size.
    pub async fn update_size(&self, task_id: &str) -> Result<u64, ForgeError> {
        let path = self.path_for(task_id);
        let size = tokio::task::spawn_blocking(move || dir_size(&path))
            .await
            .map_err(|error| ForgeError::internal(format!("size walk join: {error}")))??;

        let mut conn = self.store.connection();
        conn.hset::<_, _, _, ()>(self.meta_key(task_id), "size_bytes", size)
            .await?;
        Ok(size)
    }

    /// Lists all tracked workspaces.
    pub async fn list(&self) -> Result<Vec<Workspace>, ForgeError> {
        let pattern = self.store.key(&["workspace", "*"]);
        let mut conn = self.store.connection();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut workspaces = Vec::new();
        for key in keys {
            let fields: HashMap<String, String> = conn.hgetall(&key).await?;
            if fields.is_empty() {
                continue;
            }
            if let Some(workspace) = hash_to_workspace(&fields) {
                workspaces.push(workspace);
            }
        }
        Ok(workspaces)
    }

    /// Aggregate size of all tracked workspaces in bytes.
    pub async fn total_size_bytes(&self) -> u64 {
        match self.list().await {
            Ok(workspaces) => workspaces.iter().map(|ws| ws.size_bytes).sum(),
            Err(_) => 0,
        }
    }

    /// Periodic TTL sweep: deletes expired workspaces whose task has finished
    /// or no longer exists. Running tasks are never swept.
    pub async fn run_sweeper(&self, tasks: Arc<TaskService>, shutdown: CancelToken) {
        tracing::info!(interval_seconds = SWEEP_INTERVAL.as_secs(), "workspace sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("workspace sweeper shutting down");
                    return;
                }
            }
            self.sweep_once(&tasks).await;
        }
    }

    async fn sweep_once(&self, tasks: &TaskService) {
        let workspaces = match self.list().await {
            Ok(workspaces) => workspaces,
            Err(error) => {
                tracing::warn!(%error, "workspace sweep listing failed");
                return;
            }
        };

        let now = Utc::now();
        for workspace in workspaces {
            if !workspace.is_expired(now) {
                continue;
            }
            let deletable = match tasks.get(&workspace.task_id).await {
                Ok(task) => is_finished(task.status),
                Err(ForgeError::NotFound(_)) => true,
                Err(error) => {
                    tracing::warn!(task_id = %workspace.task_id, %error, "sweep status check failed");
                    false
                }
            };
            if !deletable {
                continue;
            }
            match self.delete(&workspace.task_id).await {
                Ok(()) => {
                    tracing::info!(task_id = %workspace.task_id, "expired workspace removed")
                }
                Err(error) => {
                    tracing::warn!(task_id = %workspace.task_id, %error, "workspace removal failed")
                }
            }
        }
    }
}

/// Rejects any path that resolves outside the workspace base.
fn guard_inside_base(base: &Path, candidate: &Path) -> Result<(), ForgeError> {
    let base = std::path::absolute(base)
        .map_err(|error| ForgeError::internal(format!("resolving base path: {error}")))?;
    let candidate = std::path::absolute(candidate)
        .map_err(|error| ForgeError::internal(format!("resolving workspace path: {error}")))?;
    if !candidate.starts_with(&base) || candidate == base {
        return Err(ForgeError::internal(format!(
            "path traversal attempt: {} is outside workspace base {}",
            candidate.display(),
            base.display()
        )));
    }
    Ok(())
}

/// Total size of a directory tree; unreadable entries are skipped.
fn dir_size(root: &Path) -> Result<u64, ForgeError> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                if let Ok(metadata) = entry.metadata() {
                    total += metadata.len();
                }
            }
        }
    }
    Ok(total)
}

/// Recursively chowns a workspace tree to the given uid/gid so a
/// privilege-dropped agent can write to it.
#[cfg(unix)]
pub fn chown_recursive(root: &Path, uid: u32, gid: u32) -> Result<(), ForgeError> {
    use nix::unistd::{chown, Gid, Uid};

    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let _ = chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
        if path.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&path) {
                for entry in entries.flatten() {
                    stack.push(entry.path());
                }
            }
        }
    }
    Ok(())
}

fn hash_to_workspace(fields: &HashMap<String, String>) -> Option<Workspace> {
    Some(Workspace {
        task_id: fields.get("task_id")?.clone(),
        path: fields.get("path").cloned().unwrap_or_default(),
        created_at: fields
            .get("created_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))?,
        ttl: fields.get("ttl").and_then(|raw| raw.parse().ok())?,
        size_bytes: fields
            .get("size_bytes")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
    })
}
