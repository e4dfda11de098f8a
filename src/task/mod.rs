//! Migration task data model and persistence.
//!
//! A task record is owned by the scheduler for lifecycle fields and mutated
//! only by its single executor while running. Records are persisted as JSON
//! in the key-value store under `task:<id>` so they survive restarts and
//! support listing.

pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, ZmigrateError};
use crate::store::KvStore;

pub const TASK_KEY_PREFIX: &str = "task:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Caller-supplied migration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParams {
    /// `dataset@snapshot` to send.
    pub source: String,
    /// Destination dataset path.
    pub destination: String,
    /// Remote host for cross-host migration; local pipeline when absent.
    #[serde(default)]
    pub remote: Option<String>,
    /// Pre-issued transfer token; selects the token-gated data path.
    #[serde(default)]
    pub token: Option<String>,
    /// Bandwidth cap in MB/s.
    #[serde(default)]
    pub limit_mbps: Option<u64>,
    /// Compression hint; `None` auto-selects from dataset properties.
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    /// Keep sync-point markers for incremental chains.
    #[serde(default = "default_true")]
    pub sync: bool,
    /// Allow resuming an interrupted transfer.
    #[serde(default = "default_true")]
    pub resumable: bool,
}

impl TaskParams {
    pub fn validate(&self) -> Result<()> {
        let (dataset, snapshot) = self
            .source
            .split_once('@')
            .ok_or_else(|| ZmigrateError::Validation("source must be dataset@snapshot".into()))?;
        if dataset.is_empty() || snapshot.is_empty() {
            return Err(ZmigrateError::Validation(
                "source must be dataset@snapshot".into(),
            ));
        }
        if self.destination.is_empty() {
            return Err(ZmigrateError::Validation("destination is required".into()));
        }
        if self.limit_mbps == Some(0) {
            return Err(ZmigrateError::Validation(
                "bandwidth limit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn dataset(&self) -> &str {
        self.source.split('@').next().unwrap_or("")
    }

    pub fn snapshot(&self) -> &str {
        self.source.split('@').nth(1).unwrap_or("")
    }

    /// Host identity of the destination, used as the sync-point tag suffix.
    pub fn destination_host(&self) -> &str {
        self.remote.as_deref().unwrap_or("local")
    }
}

/// Latest progress snapshot. Only the most recent value is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub timestamp: DateTime<Utc>,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub percentage: f64,
    pub rate_mbps: f64,
    pub eta_seconds: u64,
    pub elapsed_seconds: u64,
}

impl Progress {
    /// Derives a new sample from the running byte counters. Percentage is
    /// clamped to [0, 100] and never drops below the previous sample.
    pub fn sample(
        bytes_transferred: u64,
        bytes_total: Option<u64>,
        elapsed: Duration,
        previous: Option<&Progress>,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let rate_mbps = if elapsed_secs > 0.0 {
            bytes_transferred as f64 / elapsed_secs / (1024.0 * 1024.0)
        } else {
            0.0
        };

        let mut percentage = match bytes_total {
            Some(total) if total > 0 => {
                (bytes_transferred as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        if let Some(prev) = previous {
            percentage = percentage.max(prev.percentage);
        }

        let eta_seconds = match bytes_total {
            Some(total) if rate_mbps > 0.0 && total > bytes_transferred => {
                let remaining = (total - bytes_transferred) as f64;
                (remaining / (rate_mbps * 1024.0 * 1024.0)) as u64
            }
            _ => 0,
        };

        Self {
            timestamp: Utc::now(),
            bytes_transferred,
            bytes_total,
            percentage,
            rate_mbps,
            eta_seconds,
            elapsed_seconds: elapsed.as_secs(),
        }
    }
}

/// One orchestrated migration request and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub params: TaskParams,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(params: TaskParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            params,
            progress: None,
            error: None,
        }
    }
}

/// Task persistence over the injected store.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn save(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_string(task)
            .map_err(|e| ZmigrateError::Store(format!("serialize task: {e}")))?;
        self.store
            .set_ex(&format!("{TASK_KEY_PREFIX}{}", task.id), &json, self.ttl)
            .await
    }

    pub async fn load(&self, id: &str) -> Result<Option<Task>> {
        let Some(json) = self.store.get(&format!("{TASK_KEY_PREFIX}{id}")).await? else {
            return Ok(None);
        };
        let task = serde_json::from_str(&json)
            .map_err(|e| ZmigrateError::Store(format!("deserialize task {id}: {e}")))?;
        Ok(Some(task))
    }

    pub async fn load_all(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for key in self.store.keys(TASK_KEY_PREFIX).await? {
            let id = &key[TASK_KEY_PREFIX.len()..];
            if let Some(task) = self.load(id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }
}
