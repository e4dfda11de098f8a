//! ZFS command translation and execution.
//!
//! `command` builds argv lines, `runner` executes them; this module's `Zfs`
//! facade wraps the two so callers never parse CLI output themselves.

pub mod command;
pub mod runner;

pub use command::{ReceiveSpec, SendSpec};
pub use runner::{CommandOutput, CommandRunner, ProcessHandle, SystemRunner, TransferProcess};

use std::sync::Arc;

use crate::error::{Result, ZmigrateError};

/// One hold on one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub snapshot: String,
    pub tag: String,
}

/// Queries and mutations against the host's ZFS state.
#[derive(Clone)]
pub struct Zfs {
    runner: Arc<dyn CommandRunner>,
}

impl Zfs {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let out = self.runner.run(&command::dataset_exists(dataset)).await?;
        Ok(out.success())
    }

    pub async fn snapshot_exists(&self, dataset: &str, snapshot: &str) -> Result<bool> {
        let out = self
            .runner
            .run(&command::snapshot_exists(dataset, snapshot))
            .await?;
        Ok(out.success())
    }

    /// Snapshot names (without the dataset prefix), oldest first.
    pub async fn snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self.runner.run(&command::list_snapshots(dataset)).await?;
        if !out.success() {
            return Err(command_error("list snapshots", &out));
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.split('@').nth(1))
            .map(|s| s.trim().to_string())
            .collect())
    }

    /// A property value, with ZFS's `-` placeholder mapped to `None`.
    pub async fn property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let out = self
            .runner
            .run(&command::get_property(dataset, property))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let value = out.stdout.trim();
        if value.is_empty() || value == "-" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    /// Estimated stream size in bytes from a dry-run send, if reported.
    pub async fn estimate_send_size(&self, spec: &SendSpec) -> Result<Option<u64>> {
        let out = self.runner.run(&command::send_estimate(spec)).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_estimate(&out.stdout))
    }

    pub async fn hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        let out = self
            .runner
            .run(&command::hold(dataset, snapshot, tag))
            .await?;
        if !out.success() {
            return Err(ZmigrateError::MarkerFailed(format!(
                "hold {tag} on {dataset}@{snapshot}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn release(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        let out = self
            .runner
            .run(&command::release(dataset, snapshot, tag))
            .await?;
        if !out.success() {
            return Err(ZmigrateError::MarkerFailed(format!(
                "release {tag} on {dataset}@{snapshot}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// All holds across every snapshot of the dataset.
    pub async fn holds(&self, dataset: &str) -> Result<Vec<Hold>> {
        let mut all = Vec::new();
        for snapshot in self.snapshots(dataset).await? {
            let out = self
                .runner
                .run(&command::holds(dataset, &snapshot))
                .await?;
            if !out.success() {
                continue;
            }
            // `zfs holds -H` lines: <dataset@snapshot>\t<tag>\t<creation>
            for line in out.stdout.lines() {
                let mut fields = line.split('\t');
                let _name = fields.next();
                if let Some(tag) = fields.next() {
                    all.push(Hold {
                        snapshot: snapshot.clone(),
                        tag: tag.trim().to_string(),
                    });
                }
            }
        }
        Ok(all)
    }
}

/// Maps a failed command to the error taxonomy, keeping stderr.
pub fn command_error(operation: &str, out: &CommandOutput) -> ZmigrateError {
    let stderr = out.stderr.trim();
    if stderr.to_ascii_lowercase().contains("permission denied") {
        ZmigrateError::PermissionDenied(format!("{operation}: {stderr}"))
    } else {
        ZmigrateError::TransferFailed(format!(
            "{operation} exited {}: {stderr}",
            out.code
        ))
    }
}

/// Parses the `size\t<bytes>` line of `zfs send -nvP` output.
fn parse_estimate(stdout: &str) -> Option<u64> {
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("size") {
            if let Some(Ok(bytes)) = fields.next().map(str::parse) {
                return Some(bytes);
            }
        }
    }
    None
}
