//! Ingestion gateway: the webhook-facing admission path.
//!
//! Side effects are strictly ordered: idempotency reservation, then status
//! record, then enqueue. A crash after the reservation leaves an orphan
//! that the reaper's reconciliation sweep releases; a crash after the
//! status insert leaves a task a later identical admission re-enqueues
//! (the broker deduplicates by task id). At no point can a queued task
//! exist without a discoverable status.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{JobPayload, StatusRecord, TaskId, TaskStatus};
use crate::error::SpoolError;
use crate::queue::{TaskDescriptor, TaskQueue};
use crate::store::{IdempotencyStore, Reservation, Reserve, TaskStatusStore};

/// What the caller gets back from `admit`. Both new and duplicate
/// admissions succeed; only validation and conflicts fail.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub is_new: bool,
}

pub struct IngestionGateway {
    idempotency: Arc<IdempotencyStore>,
    statuses: Arc<TaskStatusStore>,
    queue: Arc<dyn TaskQueue>,
}

impl IngestionGateway {
    pub fn new(
        idempotency: Arc<IdempotencyStore>,
        statuses: Arc<TaskStatusStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            idempotency,
            statuses,
            queue,
        }
    }

    /// Admit one webhook request: create-and-enqueue on first sight of the
    /// idempotency key, return the prior task on repeats, reject on
    /// fingerprint mismatch.
    pub async fn admit(&self, payload: JobPayload) -> Result<Admission, SpoolError> {
        payload.validate().map_err(SpoolError::Validation)?;

        let key = payload.idempotency_key.clone();
        let fingerprint = payload.fingerprint();
        let task_id = TaskId::generate();
        let reservation = Reservation {
            task_id,
            fingerprint,
            reserved_at: Utc::now(),
        };

        match self.idempotency.reserve(&key, reservation).await? {
            Reserve::Created => {
                let record = StatusRecord::new(task_id, &payload, Utc::now());
                self.statuses.insert(record).await?;
                self.queue
                    .enqueue(TaskDescriptor { task_id, payload })
                    .await?;
                info!(task_id = %task_id, idempotency_key = %key, "task admitted");
                Ok(Admission {
                    task_id,
                    status: TaskStatus::Queued,
                    is_new: true,
                })
            }
            Reserve::Existing(prior) => {
                if prior.fingerprint != fingerprint {
                    warn!(
                        task_id = %prior.task_id,
                        idempotency_key = %key,
                        "idempotency key reused with a different payload"
                    );
                    return Err(SpoolError::IdempotencyConflict { key });
                }
                let status = match self.statuses.get(prior.task_id).await? {
                    Some(record) => record.status,
                    None => {
                        // Reservation committed but the status insert never
                        // ran (crash window). Report Queued; the sweep will
                        // release the orphan and a retry re-admits cleanly.
                        debug!(task_id = %prior.task_id, "reservation without status record");
                        TaskStatus::Queued
                    }
                };
                debug!(task_id = %prior.task_id, idempotency_key = %key, "duplicate admission");
                Ok(Admission {
                    task_id: prior.task_id,
                    status,
                    is_new: false,
                })
            }
        }
    }

    /// Status query. Unknown and evicted tasks are both not-found.
    pub async fn status(&self, task_id: TaskId) -> Result<StatusRecord, SpoolError> {
        self.statuses
            .get(task_id)
            .await?
            .ok_or(SpoolError::NotFound(task_id))
    }
}
