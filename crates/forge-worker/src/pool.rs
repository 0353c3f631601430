use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use forge_core::{CancelToken, ForgeError, StoreClient};
use forge_task::TaskService;
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use crate::executor::Executor;

const POP_WINDOW_SECONDS: f64 = 5.0;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pool of N long-lived workers blocking-pop from the FIFO queue, each
/// dispatching to the executor under a task-scoped cancellable token.
///
/// The per-task token is registered in a pool-wide map so `cancel` can reach
/// a running task from any handler.
pub struct WorkerPool {
    store: StoreClient,
    tasks: Arc<TaskService>,
    executor: Arc<Executor>,
    queue_name: String,
    concurrency: usize,
    cancels: Arc<RwLock<HashMap<String, CancelToken>>>,
    active: Arc<AtomicUsize>,
    shutdown: CancelToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: StoreClient,
        tasks: Arc<TaskService>,
        executor: Arc<Executor>,
        queue_name: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            tasks,
            executor,
            queue_name: queue_name.into(),
            concurrency,
            cancels: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancelToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launches the workers.
    pub fn start(&self) {
        tracing::info!(
            concurrency = self.concurrency,
            queue = %self.queue_name,
            "starting worker pool"
        );
        let mut handles = self.handles.lock().expect("pool handle lock");
        for worker_id in 0..self.concurrency {
            let worker = WorkerLoop {
                store: self.store.clone(),
                tasks: Arc::clone(&self.tasks),
                executor: Arc::clone(&self.executor),
                queue_key: self.store.key(&[self.queue_name.as_str()]),
                cancels: Arc::clone(&self.cancels),
                active: Arc::clone(&self.active),
                shutdown: self.shutdown.clone(),
                worker_id,
            };
            handles.push(tokio::spawn(async move { worker.run().await }));
        }
    }

    /// Signals shutdown, cancels in-flight tasks, and joins the workers.
    pub async fn stop(&self) {
        tracing::info!("stopping worker pool");
        self.shutdown.cancel();
        {
            let cancels = self.cancels.read().expect("pool cancel lock");
            for token in cancels.values() {
                token.cancel();
            }
        }
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("pool handle lock"));
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("worker pool stopped");
    }

    /// Fires the registered cancel for a running task.
    pub fn cancel(&self, task_id: &str) -> Result<(), ForgeError> {
        let cancels = self.cancels.read().expect("pool cancel lock");
        match cancels.get(task_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ForgeError::conflict(format!(
                "task {task_id} is not currently running"
            ))),
        }
    }

    /// Number of workers currently executing a task.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct WorkerLoop {
    store: StoreClient,
    tasks: Arc<TaskService>,
    executor: Arc<Executor>,
    queue_key: String,
    cancels: Arc<RwLock<HashMap<String, CancelToken>>>,
    active: Arc<AtomicUsize>,
    shutdown: CancelToken,
    worker_id: usize,
}

impl WorkerLoop {
    async fn run(&self) {
        tracing::info!(worker = self.worker_id, "worker started");
        // Blocking pops park the connection they run on, so each worker
        // holds its own instead of sharing the multiplexed one.
        let mut conn = None;

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(worker = self.worker_id, "worker shutting down");
                return;
            }

            if conn.is_none() {
                match self.store.blocking_connection().await {
                    Ok(fresh) => conn = Some(fresh),
                    Err(error) => {
                        tracing::error!(worker = self.worker_id, %error, "queue connection failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
            let Some(queue_conn) = conn.as_mut() else {
                continue;
            };

            let popped: Result<Option<(String, String)>, redis::RedisError> = tokio::select! {
                result = queue_conn.blpop(&self.queue_key, POP_WINDOW_SECONDS) => result,
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker = self.worker_id, "worker shutting down");
                    return;
                }
            };

            let task_id = match popped {
                Ok(Some((_, task_id))) => task_id,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(worker = self.worker_id, %error, "queue pop failed");
                    conn = None;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            tracing::info!(worker = self.worker_id, task_id = %task_id, "picked up task");
            self.active.fetch_add(1, Ordering::SeqCst);

            // Unknown or deleted ids are logged and skipped, never retried.
            let task = match self.tasks.get(&task_id).await {
                Ok(task) => task,
                Err(error) => {
                    tracing::warn!(
                        worker = self.worker_id,
                        task_id = %task_id,
                        %error,
                        "failed to load task, skipping"
                    );
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            };

            let token = CancelToken::new();
            {
                let mut cancels = self.cancels.write().expect("pool cancel lock");
                cancels.insert(task_id.clone(), token.clone());
            }

            self.executor.execute(token, task).await;

            {
                let mut cancels = self.cancels.write().expect("pool cancel lock");
                cancels.remove(&task_id);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
