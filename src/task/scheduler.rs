//! Task scheduler: bounded worker pool over a FIFO queue.
//!
//! Workers share one queue receiver behind a mutex, so admission into
//! `running` follows strict submission order. Cancellation is a watch flag
//! the executor polls between chunks; a pending task is cancelled in place
//! without ever starting.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::error::{Result, ZmigrateError};
use crate::store::KvStore;
use crate::task::{Task, TaskParams, TaskStatus, TaskStore};

/// How an executor run ended. Errors are returned separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed,
    Cancelled,
}

/// Per-task work, supplied by the migration executor (or a test double).
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        task: &Task,
        tasks: TaskStore,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome>;
}

type CancelMap = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

pub struct Scheduler {
    tasks: TaskStore,
    queue_tx: mpsc::UnboundedSender<String>,
    cancels: CancelMap,
}

impl Scheduler {
    /// Starts `workers` worker tasks and returns the scheduler handle.
    pub fn start(
        workers: usize,
        store: Arc<dyn KvStore>,
        task_ttl: Duration,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        let tasks = TaskStore::new(store, task_ttl);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<String>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));

        let scheduler = Arc::new(Self {
            tasks: tasks.clone(),
            queue_tx,
            cancels: cancels.clone(),
        });

        for worker_id in 0..workers {
            let queue_rx = queue_rx.clone();
            let tasks = tasks.clone();
            let cancels = cancels.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                info!(worker_id, "Scheduler worker started");
                loop {
                    // Holding the lock across recv keeps dequeue strictly FIFO.
                    let next = { queue_rx.lock().await.recv().await };
                    let Some(task_id) = next else {
                        break;
                    };
                    run_one(worker_id, &task_id, &tasks, &cancels, executor.as_ref()).await;
                }
                info!(worker_id, "Scheduler worker stopped");
            });
        }

        scheduler
    }

    /// Validates parameters, persists a pending task, and enqueues it.
    pub async fn submit(&self, params: TaskParams) -> Result<Task> {
        params.validate()?;
        let task = Task::new(params);
        self.tasks.save(&task).await?;

        let (cancel_tx, _cancel_rx) = watch::channel(false);
        self.cancels.lock().await.insert(task.id.clone(), cancel_tx);

        self.queue_tx
            .send(task.id.clone())
            .map_err(|_| ZmigrateError::Store("scheduler queue closed".into()))?;
        info!(task_id = %task.id, source = %task.params.source, "Migration task queued");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .load(id)
            .await?
            .ok_or_else(|| ZmigrateError::NotFound(format!("task {id}")))
    }

    /// Tasks newest first, with the total match count before truncation.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<(Vec<Task>, usize)> {
        let mut tasks: Vec<Task> = self
            .tasks
            .load_all()
            .await?
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = tasks.len();
        tasks.truncate(limit);
        Ok((tasks, total))
    }

    /// Cancels a task. Pending tasks go straight to `cancelled`; running
    /// tasks get the cooperative flag and stop within one sampling tick.
    /// Returns false if the task is already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        // The status check and the cancelled write happen under the registry
        // lock, which worker admission also holds across its pending check
        // and running write. The two can therefore never interleave.
        let cancels = self.cancels.lock().await;
        let mut task = self.get(id).await?;
        match task.status {
            TaskStatus::Pending => {
                // Flag too, so a worker that already dequeued the id skips it.
                if let Some(tx) = cancels.get(id) {
                    let _ = tx.send(true);
                }
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                self.tasks.save(&task).await?;
                info!(task_id = %id, "Cancelled pending task");
                Ok(true)
            }
            TaskStatus::Running => match cancels.get(id) {
                Some(tx) => {
                    let _ = tx.send(true);
                    info!(task_id = %id, "Cancellation requested for running task");
                    Ok(true)
                }
                None => {
                    warn!(task_id = %id, "Running task has no cancel channel");
                    Ok(false)
                }
            },
            _ => Ok(false),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }
}

async fn run_one(
    worker_id: usize,
    task_id: &str,
    tasks: &TaskStore,
    cancels: &CancelMap,
    executor: &dyn TaskExecutor,
) {
    // Admission runs under the registry lock so `cancel` sees either the
    // pending record (and cancels in place) or the running record, never a
    // half-admitted task it could overwrite.
    let (task, cancel_rx) = {
        let mut registry = cancels.lock().await;
        let task = match tasks.load(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(worker_id, task_id, "Dequeued task no longer in store");
                registry.remove(task_id);
                return;
            }
            Err(e) => {
                error!(worker_id, task_id, error = %e, "Failed to load dequeued task");
                return;
            }
        };

        // Cancelled-while-pending, or a duplicate enqueue.
        if task.status != TaskStatus::Pending {
            registry.remove(task_id);
            return;
        }

        let cancel_rx = match registry.get(task_id) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(false).1,
        };

        let mut task = task;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        if tasks.save(&task).await.is_err() {
            error!(task_id, "Failed to persist running state");
            return;
        }
        (task, cancel_rx)
    };
    info!(worker_id, task_id, "Task running");

    let outcome = executor.execute(&task, tasks.clone(), cancel_rx).await;

    // The executor may have updated progress; re-read before the terminal write.
    let mut task = match tasks.load(task_id).await {
        Ok(Some(t)) => t,
        _ => task,
    };
    match outcome {
        Ok(ExecOutcome::Completed) => {
            task.status = TaskStatus::Completed;
            info!(worker_id, task_id, "Task completed");
        }
        Ok(ExecOutcome::Cancelled) => {
            task.status = TaskStatus::Cancelled;
            info!(worker_id, task_id, "Task cancelled");
        }
        Err(e) => {
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
            error!(worker_id, task_id, error = %e, "Task failed");
        }
    }
    task.completed_at = Some(Utc::now());
    if let Err(e) = tasks.save(&task).await {
        error!(task_id, error = %e, "Failed to persist terminal state");
    }

    cancels.lock().await.remove(task_id);
}
