//! In-memory key-value store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KeyValueStore, Versioned};
use crate::error::SpoolError;

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// HashMap behind a tokio mutex. Expired entries read as absent but are
/// kept in place as version tombstones until overwritten, so per-key
/// versions stay monotonic across expiry and a swap guarded by a
/// pre-expiry version can never succeed. No background eviction thread.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, SpoolError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let version = match entries.get(key) {
            Some(existing) if !existing.is_expired(now) => return Ok(false),
            Some(tombstone) => tombstone.version + 1,
            None => 1,
        };
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>, SpoolError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(entry) => Ok(Some(Versioned {
                version: entry.version,
                value: entry.value.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<bool, SpoolError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        if entry.version != expected_version {
            return Ok(false);
        }
        entry.value = value;
        entry.version += 1;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), SpoolError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, SpoolError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut matches: Vec<(String, Versioned)> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Versioned {
                        version: entry.version,
                        value: entry.value.clone(),
                    },
                )
            })
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }
}
