//! Worker pool running copy and move tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stowage_common::{Error, Result, StoragePath, TaskConfig};
use stowage_storage::transfer::{self, TransferKind, TransferOptions};
use stowage_storage::Provider;

use crate::store::{spawn_sweeper, TaskId, TaskStatus, TaskStore};

/// Everything a worker needs to run one transfer.
///
/// Providers are handed over whole; workers share nothing else.
#[derive(Clone)]
pub struct TaskRequest {
    pub kind: TransferKind,
    pub source: Arc<dyn Provider>,
    pub dest: Arc<dyn Provider>,
    pub src: StoragePath,
    pub dst: StoragePath,
    pub options: TransferOptions,
}

impl TaskRequest {
    pub fn copy(
        source: Arc<dyn Provider>,
        dest: Arc<dyn Provider>,
        src: StoragePath,
        dst: StoragePath,
    ) -> Self {
        Self {
            kind: TransferKind::Copy,
            source,
            dest,
            src,
            dst,
            options: TransferOptions::default(),
        }
    }

    pub fn move_(
        source: Arc<dyn Provider>,
        dest: Arc<dyn Provider>,
        src: StoragePath,
        dst: StoragePath,
    ) -> Self {
        Self {
            kind: TransferKind::Move,
            ..Self::copy(source, dest, src, dst)
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// What [`TaskPool::submit_and_wait`] got back.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Finished within the wait window.
    Completed(TaskStatus),
    /// Still running; poll this id.
    Accepted(TaskId),
}

type Job = (TaskId, TaskRequest);

/// Bounded queue drained by a fixed number of workers.
pub struct TaskPool {
    store: Arc<TaskStore>,
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    shutdown: CancellationToken,
    wait_timeout: Duration,
}

impl TaskPool {
    /// Start the workers and the expiry sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: &TaskConfig) -> Self {
        let store = Arc::new(TaskStore::new(config.expiry));
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(run_worker(index, receiver.clone(), store.clone())))
            .collect();

        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(store.clone(), config.sweep_interval, shutdown.clone());
        info!("Task pool started with {} workers", config.workers.max(1));

        Self {
            store,
            queue,
            workers,
            sweeper,
            shutdown,
            wait_timeout: config.wait_timeout,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Queue a transfer and return its id without waiting for it.
    ///
    /// Waits for room when the queue is full.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let id = TaskId::new();
        self.store.insert(id);
        info!(
            task = %id,
            "Queued {} of {}:{} to {}:{}",
            request.kind,
            request.source.name(),
            request.src,
            request.dest.name(),
            request.dst
        );

        if self.queue.send((id, request)).await.is_err() {
            self.store.remove(&id);
            return Err(Error::provider(503, "Task pool is shut down"));
        }
        Ok(id)
    }

    /// Current status of a task.
    pub fn poll(&self, id: &TaskId) -> Result<TaskStatus> {
        self.store.get(id)
    }

    /// Wait up to `timeout` for the task to finish.
    ///
    /// Returns the terminal status, or the latest status when time ran out.
    pub async fn wait(&self, id: &TaskId, timeout: Duration) -> Result<TaskStatus> {
        match tokio::time::timeout(timeout, self.store.wait_terminal(id)).await {
            Ok(status) => status,
            Err(_) => self.store.get(id),
        }
    }

    /// Submit, then wait up to the configured window for the result.
    pub async fn submit_and_wait(&self, request: TaskRequest) -> Result<Submission> {
        let id = self.submit(request).await?;
        let status = self.wait(&id, self.wait_timeout).await?;
        Ok(if status.state.is_terminal() {
            Submission::Completed(status)
        } else {
            Submission::Accepted(id)
        })
    }

    /// Stop accepting work, let queued tasks finish, then stop the sweeper.
    pub async fn shutdown(self) {
        let Self {
            queue,
            workers,
            sweeper,
            shutdown,
            ..
        } = self;
        drop(queue);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Task worker panicked: {}", e);
            }
        }
        shutdown.cancel();
        let _ = sweeper.await;
        info!("Task pool stopped");
    }
}

async fn run_worker(index: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, store: Arc<TaskStore>) {
    loop {
        // Hold the lock only while waiting for the next job.
        let job = receiver.lock().await.recv().await;
        let Some((id, request)) = job else {
            break;
        };

        store.mark_started(&id);
        info!(task = %id, worker = index, "Task started");

        // Own task per job, so a panicking adapter fails the task, not the worker.
        let job = tokio::spawn(async move {
            transfer::transfer(
                request.kind,
                request.source.as_ref(),
                request.dest.as_ref(),
                &request.src,
                &request.dst,
                &request.options,
            )
            .await
        });
        let outcome = match job.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::provider(500, format!("Task aborted: {}", e))),
        };

        match &outcome {
            Ok(_) => info!(task = %id, "Task succeeded"),
            Err(e) => error!(task = %id, "Task failed: {}", e),
        }
        store.finish(&id, outcome);
    }
}
