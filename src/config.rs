//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! none at all) yields a working local setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bounded worker pool size for the task scheduler.
    pub workers: usize,
    /// Token-gated data-plane socket listen address.
    pub listen: String,
    /// Management control socket listen address.
    pub control_listen: String,
    /// Optional direct (trusted host-to-host) data socket address.
    pub direct_listen: Option<String>,
    /// Port used when dialing a remote daemon's data socket.
    pub remote_port: u16,
    /// Fixed copy buffer for socket/subprocess streaming.
    pub chunk_size: usize,
    /// Progress sampling interval in seconds. Also bounds cancellation latency.
    pub progress_interval_secs: u64,
    /// Task records expire from the store after this many seconds.
    pub task_ttl_secs: u64,
    /// Default ttl for issued transfer tokens.
    pub token_default_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            listen: "0.0.0.0:9999".to_string(),
            control_listen: "127.0.0.1:9997".to_string(),
            direct_listen: None,
            remote_port: 9999,
            chunk_size: 256 * 1024,
            progress_interval_secs: 1,
            task_ttl_secs: 7 * 24 * 3600,
            token_default_ttl_secs: 3600,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("workers = 2").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.progress_interval_secs, 1);
        assert_eq!(config.chunk_size, 256 * 1024);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = \"not a number\"").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
