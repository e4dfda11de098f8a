//! Migration executor: one instance drives one running task.
//!
//! The executor decides full vs incremental mode from the retained sync
//! point, builds the send/receive pipeline, copies the stream in fixed
//! chunks while sampling progress once per interval, applies the bandwidth
//! cap, and commits the new sync point only after the transfer succeeded.
//! Failure and cancellation leave sync state exactly as it was.

pub mod limiter;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::{Result, ZmigrateError};
use crate::migrate::limiter::RateLimiter;
use crate::syncpoint::SyncPoints;
use crate::task::scheduler::{ExecOutcome, TaskExecutor};
use crate::task::{Progress, Task, TaskParams, TaskStore};
use crate::token::{Operation, TransferFlags};
use crate::transport::{handshake_direct, handshake_token, Connector, DataStream, TransferMeta};
use crate::zfs::{command, ProcessHandle, ReceiveSpec, SendSpec, Zfs};

pub struct Executor {
    zfs: Zfs,
    syncpoints: SyncPoints,
    connector: Arc<dyn Connector>,
    chunk_size: usize,
    progress_interval: Duration,
}

/// Where the send stream goes.
enum DataPath {
    /// Piped into a local `zfs receive`.
    Local {
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        handle: Box<dyn ProcessHandle>,
    },
    /// Written to a remote daemon's data socket.
    Remote { stream: Box<dyn DataStream> },
}

impl Executor {
    pub fn new(
        zfs: Zfs,
        syncpoints: SyncPoints,
        connector: Arc<dyn Connector>,
        chunk_size: usize,
        progress_interval: Duration,
    ) -> Self {
        Self {
            zfs,
            syncpoints,
            connector,
            chunk_size,
            progress_interval,
        }
    }

    /// Builds the send spec: incremental from the current marker when the
    /// sync flag is on, raw/compressed auto-selected from dataset
    /// properties unless the caller overrode them, resume token picked up
    /// for resumable local targets.
    async fn plan(&self, params: &TaskParams) -> Result<SendSpec> {
        let dataset = params.dataset();
        let snapshot = params.snapshot();

        let marker = if params.sync {
            self.syncpoints
                .current(dataset, params.destination_host())
                .await?
        } else {
            None
        };
        let base = marker
            .as_ref()
            .map(|m| m.snapshot.clone())
            .filter(|b| b != snapshot);

        // A resume token on the destination means an interrupted receive
        // is waiting; `zfs send -t` continues it. Only queryable locally.
        let resume_token = if params.resumable && params.remote.is_none() {
            self.zfs
                .property(&params.destination, "receive_resume_token")
                .await
                .unwrap_or(None)
        } else {
            None
        };

        let raw = matches!(
            self.zfs.property(dataset, "encryption").await?,
            Some(v) if v != "off"
        );
        let compressed = match params.compression.as_deref() {
            Some("off") | Some("none") => false,
            Some(_) => true,
            None => matches!(
                self.zfs.property(dataset, "compression").await?,
                Some(v) if v != "off"
            ),
        };

        match (&base, &resume_token) {
            (_, Some(_)) => info!(dataset, snapshot, "Resuming interrupted send"),
            (Some(base), _) => {
                info!(dataset, snapshot, base = %base, "Incremental send from sync point")
            }
            (None, None) => info!(dataset, snapshot, "Full send"),
        }

        Ok(SendSpec {
            dataset: dataset.to_string(),
            snapshot: snapshot.to_string(),
            from_snapshot: if resume_token.is_some() { None } else { base },
            recursive: params.recursive,
            raw,
            compressed,
            resume_token,
        })
    }

    async fn open_data_path(&self, params: &TaskParams) -> Result<DataPath> {
        match &params.remote {
            None => {
                let spec = ReceiveSpec {
                    dataset: params.destination.clone(),
                    force: true,
                    resumable: params.resumable,
                };
                let mut process = self
                    .zfs
                    .runner()
                    .spawn(&command::receive(&spec), true)
                    .await?;
                let stdin = process.stdin.take().ok_or_else(|| {
                    ZmigrateError::ReceiveFailed("receive process has no stdin".into())
                })?;
                Ok(DataPath::Local {
                    stdin,
                    handle: process.handle,
                })
            }
            Some(host) => {
                let mut stream = self.connector.connect(host).await?;
                match &params.token {
                    Some(token) => handshake_token(&mut stream, token).await?,
                    None => {
                        let meta = TransferMeta {
                            dataset: params.destination.clone(),
                            snapshot: None,
                            flags: TransferFlags {
                                force: true,
                                resumable: params.resumable,
                                recursive: params.recursive,
                                ..Default::default()
                            },
                        };
                        handshake_direct(&mut stream, Operation::Receive, &meta).await?;
                    }
                }
                Ok(DataPath::Remote { stream })
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for Executor {
    async fn execute(
        &self,
        task: &Task,
        tasks: TaskStore,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome> {
        let params = &task.params;
        let dataset = params.dataset();
        let snapshot = params.snapshot();

        if !self.zfs.snapshot_exists(dataset, snapshot).await? {
            return Err(ZmigrateError::NotFound(format!(
                "snapshot {}@{}",
                dataset, snapshot
            )));
        }

        let spec = self.plan(params).await?;
        let bytes_total = if spec.resume_token.is_none() {
            self.zfs.estimate_send_size(&spec).await?
        } else {
            None
        };

        let mut send = self
            .zfs
            .runner()
            .spawn(&command::send(&spec), false)
            .await?;
        let mut send_out = send.stdout.take().ok_or_else(|| {
            ZmigrateError::TransferFailed("send process has no stdout".into())
        })?;

        let mut path = match self.open_data_path(params).await {
            Ok(path) => path,
            Err(e) => {
                send.handle.terminate().await;
                return Err(e);
            }
        };

        // Copy loop: fixed chunks, progress once per interval, cancellation
        // observed between chunks/ticks.
        let started = Instant::now();
        let limiter = RateLimiter::new(params.limit_mbps);
        let mut buf = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;
        let mut last_progress: Option<Progress> = None;
        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate

        let copy_result: Result<()> = loop {
            tokio::select! {
                _ = cancelled(&mut cancel) => {
                    info!(task_id = %task.id, "Cancellation observed, terminating pipeline");
                    send.handle.terminate().await;
                    if let DataPath::Local { handle, .. } = &mut path {
                        handle.terminate().await;
                    }
                    return Ok(ExecOutcome::Cancelled);
                }
                _ = ticker.tick() => {
                    let progress = Progress::sample(
                        total,
                        bytes_total,
                        started.elapsed(),
                        last_progress.as_ref(),
                    );
                    record_progress(&tasks, &task.id, &progress).await;
                    last_progress = Some(progress);
                }
                read = send_out.read(&mut buf) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    if n == 0 {
                        break Ok(());
                    }
                    let write = match &mut path {
                        DataPath::Local { stdin, .. } => stdin.write_all(&buf[..n]).await,
                        DataPath::Remote { stream } => stream.write_all(&buf[..n]).await,
                    };
                    if let Err(e) = write {
                        break Err(ZmigrateError::ReceiveFailed(format!(
                            "receive side rejected stream: {e}"
                        )));
                    }
                    total += n as u64;
                    limiter.throttle(total).await;
                }
            }
        };

        if let Err(e) = copy_result {
            send.handle.terminate().await;
            if let DataPath::Local { handle, .. } = &mut path {
                handle.terminate().await;
            }
            return Err(e);
        }

        // Drain the pipeline: half-close toward the receiver, then collect
        // both exit codes. Receive failures carry their stderr.
        match path {
            DataPath::Local {
                mut stdin,
                mut handle,
            } => {
                stdin.shutdown().await?;
                drop(stdin);
                let out = handle.wait().await?;
                if !out.success() {
                    send.handle.terminate().await;
                    return Err(ZmigrateError::ReceiveFailed(format!(
                        "zfs receive exited {}: {}",
                        out.code,
                        out.stderr.trim()
                    )));
                }
            }
            DataPath::Remote { mut stream } => {
                stream.shutdown().await?;
            }
        }

        let out = send.handle.wait().await?;
        if !out.success() {
            return Err(ZmigrateError::TransferFailed(format!(
                "zfs send exited {}: {}",
                out.code,
                out.stderr.trim()
            )));
        }

        let final_progress = Progress::sample(
            total,
            bytes_total.or(Some(total)),
            started.elapsed(),
            last_progress.as_ref(),
        );
        record_progress(&tasks, &task.id, &final_progress).await;
        info!(task_id = %task.id, bytes = total, "Transfer complete");

        // Create-then-retire: the new marker is durable before any old one
        // is released. A marker failure is reported but the transfer
        // itself already succeeded.
        if params.sync {
            if let Err(e) = self
                .syncpoints
                .commit(dataset, params.destination_host(), snapshot)
                .await
            {
                warn!(task_id = %task.id, error = %e, "Sync point update failed after transfer");
                if let Ok(Some(mut t)) = tasks.load(&task.id).await {
                    t.error = Some(e.to_string());
                    let _ = tasks.save(&t).await;
                }
            }
        }

        Ok(ExecOutcome::Completed)
    }
}

/// Resolves when cancellation is requested; never resolves otherwise.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn record_progress(tasks: &TaskStore, task_id: &str, progress: &Progress) {
    match tasks.load(task_id).await {
        Ok(Some(mut task)) => {
            task.progress = Some(progress.clone());
            if let Err(e) = tasks.save(&task).await {
                warn!(task_id, error = %e, "Failed to persist progress");
            }
        }
        _ => warn!(task_id, "Task record missing during progress update"),
    }
}
