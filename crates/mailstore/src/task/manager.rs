//! In-memory task execution

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Task, TaskExecutionDetails, TaskId, TaskOutcome, TaskStatus};
use crate::error::{Result, StoreError};

/// Submit tasks and observe their status
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Start `task` in the background and return its id
    async fn submit(&self, task: Arc<dyn Task>) -> Result<TaskId>;

    /// Current status of a task
    async fn get(&self, id: &TaskId) -> Result<TaskExecutionDetails>;

    /// Wait until the task reaches a terminal status or `timeout` elapses,
    /// returning the latest details either way
    async fn await_task(&self, id: &TaskId, timeout: Duration) -> Result<TaskExecutionDetails>;

    /// Ask a task to stop; a finished task is left as is
    async fn cancel(&self, id: &TaskId) -> Result<()>;
}

struct Entry {
    task: Arc<dyn Task>,
    details: Arc<watch::Sender<TaskExecutionDetails>>,
    cancel: CancellationToken,
}

/// Runs each task on the tokio runtime and keeps its details in memory
#[derive(Clone, Default)]
pub struct InMemoryTaskManager {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<Entry>>>>,
}

impl InMemoryTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &TaskId) -> Result<Arc<Entry>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| StoreError::Storage(anyhow!("task registry lock poisoned")))?;
        tasks.get(id).cloned().ok_or_else(|| {
            debug!("Task {} not found", id);
            StoreError::not_found(format!("task {}", id))
        })
    }
}

/// Details with live progress for tasks still running
fn snapshot(entry: &Entry) -> TaskExecutionDetails {
    let mut details = entry.details.borrow().clone();
    if !details.status.is_terminal() {
        details.additional_information = entry.task.additional_information();
    }
    details
}

async fn execute(id: TaskId, entry: Arc<Entry>) {
    if entry.cancel.is_cancelled() {
        info!("Task {} cancelled before start", id);
        entry.details.send_modify(|d| {
            d.status = TaskStatus::Cancelled;
            d.completed_at = Some(Utc::now());
            d.additional_information = entry.task.additional_information();
        });
        return;
    }

    entry.details.send_modify(|d| {
        d.status = TaskStatus::InProgress;
        d.started_at = Some(Utc::now());
    });
    info!("Task {} ({}) started", id, entry.task.task_type().as_str());

    // A panicking task must still reach a terminal status
    let outcome = match AssertUnwindSafe(entry.task.run(entry.cancel.clone()))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("Task {} panicked", id);
            TaskOutcome::Failed
        }
    };
    let status = TaskStatus::from(outcome);

    entry.details.send_modify(|d| {
        d.status = status;
        d.completed_at = Some(Utc::now());
        d.additional_information = entry.task.additional_information();
    });
    match status {
        TaskStatus::Failed => warn!("Task {} failed", id),
        _ => info!("Task {} finished: {:?}", id, status),
    }
}

#[async_trait]
impl TaskManager for InMemoryTaskManager {
    async fn submit(&self, task: Arc<dyn Task>) -> Result<TaskId> {
        let id = TaskId::random();
        let details = TaskExecutionDetails {
            task_id: id,
            task_type: task.task_type(),
            status: TaskStatus::Waiting,
            additional_information: task.additional_information(),
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let (sender, _) = watch::channel(details);
        let entry = Arc::new(Entry {
            task,
            details: Arc::new(sender),
            cancel: CancellationToken::new(),
        });

        self.tasks
            .write()
            .map_err(|_| StoreError::Storage(anyhow!("task registry lock poisoned")))?
            .insert(id, entry.clone());

        tokio::spawn(execute(id, entry));
        debug!("Submitted task {}", id);
        Ok(id)
    }

    async fn get(&self, id: &TaskId) -> Result<TaskExecutionDetails> {
        let entry = self.entry(id)?;
        Ok(snapshot(&entry))
    }

    async fn await_task(&self, id: &TaskId, timeout: Duration) -> Result<TaskExecutionDetails> {
        let entry = self.entry(id)?;
        let mut receiver = entry.details.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|details| details.status.is_terminal())
                .await
                .map(|_| ())
        })
        .await;
        if waited.is_err() {
            debug!("Timed out waiting for task {}", id);
        }
        Ok(snapshot(&entry))
    }

    async fn cancel(&self, id: &TaskId) -> Result<()> {
        let entry = self.entry(id)?;
        if !entry.details.borrow().status.is_terminal() {
            info!("Cancelling task {}", id);
            entry.cancel.cancel();
        }
        Ok(())
    }
}
