//! Task execution for CodeForge: the FIFO worker pool, the per-iteration
//! executor pipeline, the event stream bus, webhook delivery, workspace
//! management, MCP config materialization, and access-token resolution.

pub mod executor;
pub mod keys;
pub mod mcp;
pub mod pool;
pub mod webhook;
pub mod workspace;

pub use executor::{Executor, ExecutorConfig};
pub use keys::KeyResolver;
pub use mcp::{McpInstaller, McpServer};
pub use pool::WorkerPool;
pub use webhook::{verify_signature, WebhookPayload, WebhookSender};
pub use workspace::{Workspace, WorkspaceManager};
