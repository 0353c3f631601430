//! Task domain for CodeForge: the central record, its state machine, the
//! store-backed service, the PR workflow, and the list-channel input listener.

pub mod listener;
pub mod model;
pub mod pr_service;
pub mod service;
pub mod state;
pub mod stream;

pub use listener::InputListener;
pub use model::{
    CreateTaskRequest, Iteration, McpServerSpec, Task, TaskConfig, TaskStatus, UsageInfo,
};
pub use pr_service::{CreatePrRequest, CreatePrResponse, PrService, PrServiceConfig};
pub use service::TaskService;
pub use state::{is_finished, is_terminal, validate_transition};
pub use stream::{EventBus, EventKind};
