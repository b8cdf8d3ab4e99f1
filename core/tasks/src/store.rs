//! Task state tracking and expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use stowage_common::{Error, ErrorPayload, Metadata, Result};

/// Opaque task identifier handed back on submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Invalid task id '{}': {}", s, e)))
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        })
    }
}

/// Outcome of a successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub metadata: Metadata,
    /// New object, as opposed to an overwrite.
    pub created: bool,
}

/// Snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn pending(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// In-process task records.
///
/// Terminal records are kept for `expiry` after they were last updated,
/// then treated as unknown and dropped by [`TaskStore::purge_expired`].
#[derive(Debug)]
pub struct TaskStore {
    records: RwLock<HashMap<TaskId, TaskStatus>>,
    changed: Notify,
    expiry: Duration,
}

impl TaskStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            changed: Notify::new(),
            expiry,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskStatus>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskStatus>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, status: &TaskStatus, now: DateTime<Utc>) -> bool {
        status.state.is_terminal()
            && chrono::Duration::from_std(self.expiry)
                .map(|expiry| status.updated_at + expiry < now)
                .unwrap_or(false)
    }

    /// Record a new task as pending.
    pub fn insert(&self, id: TaskId) -> TaskStatus {
        let status = TaskStatus::pending(id);
        self.write().insert(id, status.clone());
        status
    }

    /// Forget a task, e.g. one that never reached the queue.
    pub fn remove(&self, id: &TaskId) -> Option<TaskStatus> {
        self.write().remove(id)
    }

    pub fn mark_started(&self, id: &TaskId) {
        self.update(id, |status| status.state = TaskState::Started);
    }

    /// Record the outcome of a task.
    pub fn finish(&self, id: &TaskId, outcome: Result<(Metadata, bool)>) {
        self.update(id, |status| match outcome {
            Ok((metadata, created)) => {
                status.state = TaskState::Success;
                status.result = Some(TaskResult { metadata, created });
            }
            Err(err) => {
                status.state = TaskState::Failure;
                status.error = Some(err.to_payload());
            }
        });
    }

    fn update(&self, id: &TaskId, apply: impl FnOnce(&mut TaskStatus)) {
        if let Some(status) = self.write().get_mut(id) {
            apply(status);
            status.updated_at = Utc::now();
        }
        self.changed.notify_waiters();
    }

    /// Current status of a task.
    ///
    /// # Errors
    /// - `NotFound` for unknown or expired ids
    pub fn get(&self, id: &TaskId) -> Result<TaskStatus> {
        self.read()
            .get(id)
            .filter(|status| !self.expired(status, Utc::now()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Task {}", id)))
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_terminal(&self, id: &TaskId) -> Result<TaskStatus> {
        loop {
            // Registered before the check so an update in between is not missed.
            let changed = self.changed.notified();
            let status = self.get(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            changed.await;
        }
    }

    /// Drop expired terminal records. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, status| !self.expired(status, now));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Purge expired records every `every` until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<TaskStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!("Purged {} expired task records", purged);
                    }
                }
            }
        }
    })
}
