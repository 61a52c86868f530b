//! Task status state machine.
//!
//! Transitions:
//! - Queued -> Running (worker claims, attempt_count += 1)
//! - Running -> Succeeded | Failed
//! - Running -> Queued (transient failure, bounded retry)
//! - Queued | Running -> Expired (reaper timeout)
//!
//! Succeeded, Failed and Expired are terminal. An attempted transition out
//! of a terminal state is a programming error: it is rejected with
//! `TransitionError`, never silently applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::payload::JobPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, waiting for a worker.
    Queued,

    /// A worker holds the lease and is executing the pipeline.
    Running,

    /// Terminal: pipeline produced a result.
    Succeeded,

    /// Terminal: permanent failure or retry budget exhausted.
    Failed,

    /// Terminal: sat in Queued/Running beyond the expiry bound.
    Expired,
}

impl TaskStatus {
    /// Terminal states are sticky: no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Expired
        )
    }
}

/// Caller-safe classification of a terminal failure. Raw downstream error
/// text never travels through here; it stays in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Retryable failures that exhausted the retry budget.
    Transient,
    /// The pipeline reported a non-retryable failure.
    Permanent,
    /// One or more attempts hit the per-attempt timeout.
    Timeout,
    /// The reaper expired the task.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFault {
    pub kind: FaultKind,
    pub message: String,
}

impl TaskFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Single source of truth for one task's observable state.
///
/// All mutation goes through the transition methods below; they enforce the
/// state machine so no caller can move a task backward or off a terminal
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFault>,

    // Denormalized metadata for status queries and logs.
    pub video_id: String,
    pub user_id: String,
    pub prompt_preview: String,
}

impl StatusRecord {
    pub fn new(task_id: TaskId, payload: &JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Queued,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            video_id: payload.video_id.clone(),
            user_id: payload.user_id.clone(),
            prompt_preview: payload.prompt_preview(),
        }
    }

    fn ensure(&self, allowed_from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status == allowed_from {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    /// Queued -> Running. The only transition that bumps `attempt_count`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(TaskStatus::Queued, TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Succeeded with a result.
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure(TaskStatus::Running, TaskStatus::Succeeded)?;
        self.status = TaskStatus::Succeeded;
        self.result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Failed with a structured fault.
    pub fn fail(&mut self, fault: TaskFault, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(TaskStatus::Running, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(fault);
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Queued: the explicit retry path after a transient failure.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(TaskStatus::Running, TaskStatus::Queued)?;
        self.status = TaskStatus::Queued;
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal state -> Expired (reaper only).
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: TaskStatus::Expired,
            });
        }
        self.status = TaskStatus::Expired;
        self.error = Some(TaskFault::new(
            FaultKind::Expired,
            "task exceeded the processing time bound",
        ));
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record() -> StatusRecord {
        StatusRecord::new(TaskId::generate(), &JobPayload::sample(), Utc::now())
    }

    #[test]
    fn new_record_is_queued_with_zero_attempts() {
        let r = record();
        assert_eq!(r.status, TaskStatus::Queued);
        assert_eq!(r.attempt_count, 0);
        assert!(r.result.is_none());
        assert!(r.error.is_none());
    }

    #[test]
    fn begin_attempt_bumps_attempt_count() {
        let mut r = record();
        r.begin_attempt(Utc::now()).unwrap();
        assert_eq!(r.status, TaskStatus::Running);
        assert_eq!(r.attempt_count, 1);
    }

    #[test]
    fn retry_loop_counts_each_claim() {
        let mut r = record();
        for expected in 1..=3 {
            r.begin_attempt(Utc::now()).unwrap();
            assert_eq!(r.attempt_count, expected);
            r.requeue(Utc::now()).unwrap();
        }
    }

    #[test]
    fn complete_records_result() {
        let mut r = record();
        r.begin_attempt(Utc::now()).unwrap();
        r.complete(serde_json::json!({"video_url": "u"}), Utc::now())
            .unwrap();
        assert_eq!(r.status, TaskStatus::Succeeded);
        assert!(r.result.is_some());
    }

    #[test]
    fn fail_records_fault() {
        let mut r = record();
        r.begin_attempt(Utc::now()).unwrap();
        r.fail(
            TaskFault::new(FaultKind::Permanent, "execution failed"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.status, TaskStatus::Failed);
        assert_eq!(r.error.as_ref().unwrap().kind, FaultKind::Permanent);
    }

    #[rstest]
    #[case::queued(TaskStatus::Queued)]
    #[case::running(TaskStatus::Running)]
    fn expire_applies_to_non_terminal(#[case] from: TaskStatus) {
        let mut r = record();
        if from == TaskStatus::Running {
            r.begin_attempt(Utc::now()).unwrap();
        }
        r.expire(Utc::now()).unwrap();
        assert_eq!(r.status, TaskStatus::Expired);
        assert_eq!(r.error.as_ref().unwrap().kind, FaultKind::Expired);
    }

    #[rstest]
    #[case::succeeded(TaskStatus::Succeeded)]
    #[case::failed(TaskStatus::Failed)]
    #[case::expired(TaskStatus::Expired)]
    fn terminal_states_are_sticky(#[case] terminal: TaskStatus) {
        let mut r = record();
        r.begin_attempt(Utc::now()).unwrap();
        match terminal {
            TaskStatus::Succeeded => r.complete(serde_json::json!({}), Utc::now()).unwrap(),
            TaskStatus::Failed => r
                .fail(TaskFault::new(FaultKind::Transient, "x"), Utc::now())
                .unwrap(),
            TaskStatus::Expired => r.expire(Utc::now()).unwrap(),
            _ => unreachable!(),
        }
        let before = r.clone();
        assert!(r.begin_attempt(Utc::now()).is_err());
        assert!(r.complete(serde_json::json!({}), Utc::now()).is_err());
        assert!(r.requeue(Utc::now()).is_err());
        assert!(r.expire(Utc::now()).is_err());
        assert_eq!(r, before);
    }

    #[test]
    fn cannot_complete_without_claiming() {
        let mut r = record();
        let err = r.complete(serde_json::json!({}), Utc::now()).unwrap_err();
        assert_eq!(err.from, TaskStatus::Queued);
        assert_eq!(err.to, TaskStatus::Succeeded);
    }
}
