//! Agent CLI execution for CodeForge.
//!
//! A [`CliRunner`] wraps an external coding-agent binary that speaks a
//! line-delimited JSON protocol on stdout. The concrete adapter spawns the
//! binary in its own process group, forwards every raw line to the caller,
//! extracts result text and token usage, and guarantees the whole process
//! tree dies on cancellation or deadline.

pub mod analyzer;
pub mod claude;
pub mod registry;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use forge_core::CancelToken;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use analyzer::{Analyzer, AnalysisResult};
pub use claude::ClaudeCodeRunner;
pub use registry::RunnerRegistry;

/// Parameters for one agent invocation.
pub struct RunOptions {
    pub prompt: String,
    pub work_dir: PathBuf,
    pub model: String,
    pub api_key: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    /// Receives every non-empty stdout line, byte-for-byte.
    pub event_sink: Option<mpsc::UnboundedSender<String>>,
    /// User-initiated cancellation; fires a process-group kill.
    pub cancel: CancelToken,
    /// Absolute deadline for the run; also fires a process-group kill.
    pub deadline: Instant,
}

/// Output of a finished agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Failure modes of an agent run, distinguishable by kind so the executor can
/// tell deadlines from user cancels.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("starting CLI '{binary}': {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("CLI I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The accumulated outcome is still carried so diagnostics can be
    /// inspected after a failed run.
    #[error("CLI exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        exit_code: i32,
        stderr: String,
        outcome: RunOutcome,
    },

    #[error("unknown CLI: {0}")]
    UnknownCli(String),
}

/// Contract for agent CLI adapters.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, opts: RunOptions) -> Result<RunOutcome, RunnerError>;
}
