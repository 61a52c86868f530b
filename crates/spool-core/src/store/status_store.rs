//! Task status records behind versioned CAS, with transition events.
//!
//! Per-task transitions are totally ordered: every mutation rereads the
//! record, applies a state-machine method, and commits with a version
//! guard. Losing the guard means someone else moved the task first, so we
//! reread and re-apply; the state machine then decides whether the
//! transition is still legal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::KeyValueStore;
use crate::domain::{StatusRecord, TaskId, TaskStatus, TransitionError};
use crate::error::SpoolError;

const KEY_PREFIX: &str = "task:";
const EVENT_CHANNEL_CAPACITY: usize = 256;
const CAS_RETRY_LIMIT: u32 = 16;

/// One observed status transition. `from` is `None` for admission.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub task_id: TaskId,
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub record: StatusRecord,
}

pub struct TaskStatusStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    events: broadcast::Sender<TransitionEvent>,
}

impl TaskStatusStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { kv, ttl, events }
    }

    /// Observers (stats) subscribe here. Slow observers may lag and miss
    /// events; the store itself is always authoritative.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    fn storage_key(task_id: TaskId) -> String {
        format!("{KEY_PREFIX}{task_id}")
    }

    fn emit(&self, from: Option<TaskStatus>, record: &StatusRecord) {
        // No receivers is fine.
        let _ = self.events.send(TransitionEvent {
            task_id: record.task_id,
            from,
            to: record.status,
            record: record.clone(),
        });
    }

    /// Insert the admission record. The task must not exist yet.
    pub async fn insert(&self, record: StatusRecord) -> Result<(), SpoolError> {
        let value = serde_json::to_value(&record)?;
        let inserted = self
            .kv
            .put_if_absent(&Self::storage_key(record.task_id), value, Some(self.ttl))
            .await?;
        if !inserted {
            return Err(SpoolError::StoreUnavailable(format!(
                "status record for {} already exists",
                record.task_id
            )));
        }
        self.emit(None, &record);
        Ok(())
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Option<StatusRecord>, SpoolError> {
        match self.kv.get(&Self::storage_key(task_id)).await? {
            Some(versioned) => Ok(Some(serde_json::from_value(versioned.value)?)),
            None => Ok(None),
        }
    }

    /// Apply a state-machine transition under CAS.
    ///
    /// `apply` runs against the freshest copy of the record on every retry.
    /// An `Err` from `apply` (illegal transition, e.g. the task went
    /// terminal underneath us) aborts without writing.
    pub async fn transition<F>(&self, task_id: TaskId, apply: F) -> Result<StatusRecord, SpoolError>
    where
        F: Fn(&mut StatusRecord) -> Result<(), TransitionError>,
    {
        let storage_key = Self::storage_key(task_id);
        for _ in 0..CAS_RETRY_LIMIT {
            let Some(versioned) = self.kv.get(&storage_key).await? else {
                return Err(SpoolError::NotFound(task_id));
            };
            let current: StatusRecord = serde_json::from_value(versioned.value)?;
            let from = current.status;
            let mut next = current;
            apply(&mut next)?;
            let value = serde_json::to_value(&next)?;
            if self
                .kv
                .compare_and_swap(&storage_key, versioned.version, value)
                .await?
            {
                self.emit(Some(from), &next);
                return Ok(next);
            }
            // Lost the race; reread and re-apply.
        }
        Err(SpoolError::StoreUnavailable(format!(
            "status CAS for {task_id} kept losing races"
        )))
    }

    /// Snapshot of all live records, for the reaper.
    pub async fn scan(&self) -> Result<Vec<StatusRecord>, SpoolError> {
        let mut out = Vec::new();
        for (_, versioned) in self.kv.scan_prefix(KEY_PREFIX).await? {
            out.push(serde_json::from_value(versioned.value)?);
        }
        Ok(out)
    }
}
