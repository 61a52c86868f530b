use thiserror::Error;

use crate::domain::{TaskId, TransitionError};

#[derive(Debug, Error)]
pub enum SpoolError {
    /// Malformed admission payload. The task was never created.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// Same idempotency key, different payload fingerprint.
    #[error("idempotency key {key:?} was already used with a different payload")]
    IdempotencyConflict { key: String },

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// A store operation could not complete. Admission fails closed on
    /// this: no partial state was committed, the caller may retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The delivery being acked/nacked is no longer leased to the caller
    /// (lease timed out and the task was handed to someone else).
    #[error("delivery for task {0} is no longer leased")]
    LostLease(TaskId),

    #[error("encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),
}
