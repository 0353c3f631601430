//! CodeForge server binary: configuration, service wiring, and lifecycle.

mod auth;
mod error;
mod health;
mod routes;
mod state;
mod stream;
mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use forge_core::{CancelToken, Config, CryptoService, StoreClient};
use forge_runner::{Analyzer, ClaudeCodeRunner, RunnerRegistry};
use forge_task::{EventBus, InputListener, PrService, PrServiceConfig, TaskService};
use forge_worker::{
    Executor, ExecutorConfig, KeyResolver, McpInstaller, WebhookSender, WorkerPool,
    WorkspaceManager,
};

use crate::auth::RateLimiter;
use crate::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const INPUT_LIST_KEY: &str = "input:tasks";

#[derive(Debug, Parser)]
#[command(
    name = "codeforge",
    version,
    about = "Remote task runner executing AI coding agents against cloned repositories"
)]
struct Cli {
    /// Path to a YAML configuration file (falls back to $CODEFORGE_CONFIG,
    /// then ./codeforge.yaml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        tracing::error!(error = %format!("{error:#}"), "fatal error");
        eprintln!("codeforge: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .or_else(|| std::env::var("CODEFORGE_CONFIG").ok());
    let cfg = Config::load(config_path.as_deref()).context("loading config")?;

    init_tracing(&cfg.logging.level, &cfg.logging.format);
    tracing::info!(version = VERSION, "starting codeforge");

    let store = tokio::time::timeout(
        Duration::from_secs(5),
        StoreClient::connect(&cfg.redis.url, &cfg.redis.prefix),
    )
    .await
    .context("redis connection timed out")?
    .context("connecting to redis")?;
    store.ping().await.context("redis ping failed")?;
    tracing::info!(url = %cfg.redis.url, "redis connected");

    let crypto = Arc::new(CryptoService::new(&cfg.encryption.key).context("initializing crypto")?);

    let tasks = Arc::new(TaskService::new(
        store.clone(),
        Arc::clone(&crypto),
        cfg.workers.queue_name.clone(),
        cfg.tasks.state_ttl,
        cfg.tasks.result_ttl,
    ));

    let webhook = if cfg.webhooks.hmac_secret.is_empty() {
        None
    } else {
        Some(Arc::new(WebhookSender::new(
            cfg.webhooks.hmac_secret.clone(),
            cfg.webhooks.retry_count,
            Duration::from_secs(cfg.webhooks.retry_delay),
        )))
    };

    let mut registry = RunnerRegistry::new(cfg.cli.default.clone());
    registry.register(
        "claude-code",
        Arc::new(ClaudeCodeRunner::new(cfg.cli.claude_code.path.clone())),
    );
    let runners = Arc::new(registry);

    let bus = Arc::new(EventBus::new(store.clone(), cfg.tasks.workspace_ttl));
    let workspaces = Arc::new(WorkspaceManager::new(
        cfg.tasks.workspace_base.clone(),
        store.clone(),
        cfg.tasks.workspace_ttl,
    ));
    let keys = Arc::new(KeyResolver::new(
        store.clone(),
        Arc::clone(&crypto),
        cfg.git.provider_domains.clone(),
    ));
    let mcp = Arc::new(McpInstaller::new(store.clone(), &cfg.mcp.global_servers));

    let executor = Arc::new(Executor::new(
        Arc::clone(&tasks),
        Arc::clone(&runners),
        Arc::clone(&bus),
        webhook,
        keys,
        mcp,
        Arc::clone(&workspaces),
        ExecutorConfig {
            workspace_base: cfg.tasks.workspace_base.clone().into(),
            default_timeout: cfg.tasks.default_timeout,
            max_timeout: cfg.tasks.max_timeout,
            default_model: cfg.cli.claude_code.default_model.clone(),
        },
    ));

    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        Arc::clone(&tasks),
        executor,
        cfg.workers.queue_name.clone(),
        cfg.workers.concurrency,
    ));

    let pr = Arc::new(PrService::new(
        Arc::clone(&tasks),
        Arc::clone(&bus),
        Analyzer::new(cfg.cli.analyzer_api_key.clone()),
        PrServiceConfig {
            workspace_base: cfg.tasks.workspace_base.clone().into(),
            branch_prefix: cfg.git.branch_prefix.clone(),
            commit_author: cfg.git.commit_author.clone(),
            commit_email: cfg.git.commit_email.clone(),
            provider_domains: cfg.git.provider_domains.clone(),
        },
    ));

    let limiter = if cfg.rate_limit.enabled && cfg.rate_limit.tasks_per_minute > 0 {
        Some(RateLimiter::new(
            store.clone(),
            cfg.rate_limit.tasks_per_minute,
            Duration::from_secs(60),
        ))
    } else {
        None
    };

    let ready = Arc::new(AtomicBool::new(true));
    let app_state = Arc::new(AppState {
        cfg: cfg.clone(),
        store: store.clone(),
        tasks: Arc::clone(&tasks),
        pr,
        pool: Arc::clone(&pool),
        workspaces: Arc::clone(&workspaces),
        limiter,
        ready: Arc::clone(&ready),
        started_at: Instant::now(),
        version: VERSION,
    });

    // Background services.
    let background = CancelToken::new();
    pool.start();

    let listener = InputListener::new(store.clone(), Arc::clone(&tasks), INPUT_LIST_KEY);
    let listener_shutdown = background.clone();
    let listener_handle = tokio::spawn(async move { listener.run(listener_shutdown).await });

    let sweeper_workspaces = Arc::clone(&workspaces);
    let sweeper_tasks = Arc::clone(&tasks);
    let sweeper_shutdown = background.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper_workspaces
            .run_sweeper(sweeper_tasks, sweeper_shutdown)
            .await
    });

    // HTTP server with graceful shutdown on SIGINT/SIGTERM.
    let app = routes::router(app_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.server.port);
    let listener_socket = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "http server starting");

    let shutdown_ready = Arc::clone(&ready);
    axum::serve(listener_socket, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown_ready.store(false, Ordering::SeqCst);
        })
        .await
        .context("http server error")?;

    // Drain background work: stop accepting, cancel loops, join workers.
    tracing::info!("shutting down");
    background.cancel();
    pool.stop().await;
    let _ = listener_handle.await;
    let _ = sweeper_handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
