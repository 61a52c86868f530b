//! Idempotency reservations: one task per key, for the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::KeyValueStore;
use crate::domain::TaskId;
use crate::error::SpoolError;

const KEY_PREFIX: &str = "idem:";

/// What an idempotency key maps to: the task it reserved, the payload
/// fingerprint it was reserved with, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub task_id: TaskId,
    pub fingerprint: u64,
    pub reserved_at: DateTime<Utc>,
}

/// Outcome of a reserve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reserve {
    /// The key was free; the caller's reservation is now committed.
    Created,
    /// The key is held; here is the prior reservation.
    Existing(Reservation),
}

pub struct IdempotencyStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn storage_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Atomic insert-if-absent on the key. The loop covers the narrow race
    /// where a concurrent reservation expires between our failed insert and
    /// the follow-up read.
    pub async fn reserve(&self, key: &str, reservation: Reservation) -> Result<Reserve, SpoolError> {
        let storage_key = Self::storage_key(key);
        let value = serde_json::to_value(&reservation)?;
        for _ in 0..3 {
            if self
                .kv
                .put_if_absent(&storage_key, value.clone(), Some(self.ttl))
                .await?
            {
                return Ok(Reserve::Created);
            }
            if let Some(existing) = self.kv.get(&storage_key).await? {
                let prior: Reservation = serde_json::from_value(existing.value)?;
                return Ok(Reserve::Existing(prior));
            }
        }
        Err(SpoolError::StoreUnavailable(
            "idempotency reservation raced with expiry".to_string(),
        ))
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<Reservation>, SpoolError> {
        match self.kv.get(&Self::storage_key(key)).await? {
            Some(versioned) => Ok(Some(serde_json::from_value(versioned.value)?)),
            None => Ok(None),
        }
    }

    /// Drop a reservation. Only the reconciliation sweep calls this; the
    /// hot path relies on TTL expiry.
    pub async fn release(&self, key: &str) -> Result<(), SpoolError> {
        self.kv.remove(&Self::storage_key(key)).await
    }

    /// All live reservations, with their caller-facing keys.
    pub async fn scan(&self) -> Result<Vec<(String, Reservation)>, SpoolError> {
        let mut out = Vec::new();
        for (storage_key, versioned) in self.kv.scan_prefix(KEY_PREFIX).await? {
            let key = storage_key
                .strip_prefix(KEY_PREFIX)
                .unwrap_or(&storage_key)
                .to_string();
            out.push((key, serde_json::from_value(versioned.value)?));
        }
        Ok(out)
    }
}
