//! The task queue: durable intent to process, with at-least-once delivery.
//!
//! The broker is the only coordination point between admission rate and
//! execution rate. Delivery hands the consumer a lease; an unacked lease
//! times out and the task becomes deliverable again, so a consumer that
//! dies mid-execution cannot strand work. Identity and idempotency, not
//! ordering, are what the rest of the system relies on; FIFO is best
//! effort.

mod memory;
mod retry;

pub use memory::InMemoryTaskQueue;
pub use retry::RetryPolicy;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobPayload, TaskId};
use crate::error::SpoolError;

/// What travels through the queue: task identity plus everything the
/// execution pipeline needs. Status lives in the status store, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub payload: JobPayload,
}

/// A leased delivery. `generation` identifies this particular lease;
/// ack/nack with a stale generation are rejected, which is how a consumer
/// that lost its lease to a timeout is prevented from acting on the task.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub descriptor: TaskDescriptor,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
    pub dead: usize,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make a task deliverable. Re-enqueueing a task id already tracked by
    /// the broker is a no-op, so a crashed-and-retried admission cannot
    /// duplicate work.
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<(), SpoolError>;

    /// Wait up to `timeout` for a deliverable task. `None` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, SpoolError>;

    /// Done with the task; the broker forgets it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), SpoolError>;

    /// Give the task back. `requeue = true` schedules redelivery after
    /// backoff; `requeue = false` routes it to the dead-letter list.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), SpoolError>;

    /// Broker depth by slot state, for observability.
    async fn depth(&self) -> Result<QueueDepth, SpoolError>;
}
