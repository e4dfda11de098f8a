//! Key-value store seam.
//!
//! Task records, token claims, and counters live in an external store with
//! get/set/delete/expire semantics. The trait is injected into each component
//! rather than reached for as ambient state, so tests and embedded use run
//! against [`MemoryStore`] while a deployment can plug in a networked one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a ttl; the key disappears after `ttl` elapses.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// (Re)arm expiry on an existing key. No-op if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomic counter increment, used for token statistics.
    async fn incr(&self, key: &str, field: &str) -> Result<i64>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store with per-key expiry. Expired entries are evicted lazily
/// on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    counters: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) => Ok(!entry.expired()),
            None => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.expired());
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn incr(&self, key: &str, field: &str) -> Result<i64> {
        let mut counters = self.counters.lock().await;
        let count = counters.entry(format!("{key}:{field}")).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}
