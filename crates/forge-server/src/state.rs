use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use forge_core::{Config, StoreClient};
use forge_task::{PrService, TaskService};
use forge_worker::{WorkerPool, WorkspaceManager};

use crate::auth::RateLimiter;

/// Shared state handed to every handler.
pub struct AppState {
    pub cfg: Config,
    pub store: StoreClient,
    pub tasks: Arc<TaskService>,
    pub pr: Arc<PrService>,
    pub pool: Arc<WorkerPool>,
    pub workspaces: Arc<WorkspaceManager>,
    pub limiter: Option<RateLimiter>,
    pub ready: Arc<AtomicBool>,
    pub started_at: Instant,
    pub version: &'static str,
}
