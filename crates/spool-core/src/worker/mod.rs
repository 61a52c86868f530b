//! Worker pool: leases tasks from the queue, runs the pipeline, commits
//! the outcome.
//!
//! The status store is authoritative at every step. A worker first claims
//! the task with a `Queued -> Running` transition; losing that claim means
//! the delivery is stale (another lease won, or the reaper expired the
//! task) and it is dropped without side effects. The terminal status
//! commit always happens before the queue ack and before any callback, so
//! a crash can cause redelivery but never a lost or contradicted result.

mod pipeline;

pub use pipeline::{
    CallbackError, CallbackEvent, CallbackSink, NoopCallbackSink, Pipeline, PipelineError,
};

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SpoolConfig;
use crate::domain::{FaultKind, JobPayload, TaskFault, TaskStatus};
use crate::error::SpoolError;
use crate::queue::{Delivery, TaskQueue};
use crate::store::TaskStatusStore;

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub queue: Arc<dyn TaskQueue>,
    pub statuses: Arc<TaskStatusStore>,
    pub pipeline: Arc<dyn Pipeline>,
    pub callbacks: Arc<dyn CallbackSink>,
    pub config: SpoolConfig,
}

/// Pool handle. Shutdown is cooperative: workers stop taking new leases
/// but finish the attempt they hold.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(ctx.config.workers);
        for worker_id in 0..ctx.config.workers {
            let ctx = Arc::clone(&ctx);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let dequeued = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            dequeued = ctx.queue.dequeue(ctx.config.dequeue_timeout) => dequeued,
        };

        let delivery = match dequeued {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker_id, error = %err, "dequeue failed");
                continue;
            }
        };

        let task_id = delivery.descriptor.task_id;
        if let Err(err) = process_delivery(&ctx, worker_id, &delivery).await {
            // Store or broker trouble; the lease will time out and the
            // task will be redelivered.
            warn!(worker_id, task_id = %task_id, error = %err, "delivery handling failed");
        }
    }
}

async fn process_delivery(
    ctx: &Arc<WorkerContext>,
    worker_id: usize,
    delivery: &Delivery,
) -> Result<(), SpoolError> {
    let task_id = delivery.descriptor.task_id;
    let payload = &delivery.descriptor.payload;

    // Claim. Failure here means the delivery is stale: the task is
    // already running, already terminal, or its record was evicted.
    let record = match ctx
        .statuses
        .transition(task_id, |r| r.begin_attempt(Utc::now()))
        .await
    {
        Ok(record) => record,
        Err(SpoolError::InvalidTransition(err)) => {
            if err.from == TaskStatus::Running {
                // Lease-expiry redelivery raced an attempt that is still
                // in flight. Keep the broker slot alive: the running
                // holder's requeue or terminal commit needs an entry to
                // resolve against.
                debug!(worker_id, task_id = %task_id, %err, "redelivery raced a running attempt");
                return ctx.queue.nack(delivery, true).await;
            }
            debug!(worker_id, task_id = %task_id, %err, "stale delivery dropped");
            return ctx.queue.ack(delivery).await;
        }
        Err(SpoolError::NotFound(_)) => {
            debug!(worker_id, task_id = %task_id, "delivery for an evicted task dropped");
            return ctx.queue.ack(delivery).await;
        }
        Err(other) => return Err(other),
    };
    let attempt = record.attempt_count;
    info!(worker_id, task_id = %task_id, attempt, "attempt started");

    let outcome =
        tokio::time::timeout(ctx.config.attempt_timeout, ctx.pipeline.execute(payload)).await;

    match outcome {
        Ok(Ok(result)) => commit_success(ctx, delivery, result).await,
        Ok(Err(err)) if err.is_transient() => {
            warn!(worker_id, task_id = %task_id, attempt, error = %err, "transient failure");
            commit_retryable(ctx, delivery, attempt, FaultKind::Transient).await
        }
        Ok(Err(err)) => {
            warn!(worker_id, task_id = %task_id, attempt, error = %err, "permanent failure");
            commit_failure(ctx, delivery, TaskFault::new(FaultKind::Permanent, "execution failed"))
                .await
        }
        Err(_) => {
            warn!(worker_id, task_id = %task_id, attempt, "attempt timed out");
            commit_retryable(ctx, delivery, attempt, FaultKind::Timeout).await
        }
    }
}

async fn commit_success(
    ctx: &Arc<WorkerContext>,
    delivery: &Delivery,
    result: serde_json::Value,
) -> Result<(), SpoolError> {
    let task_id = delivery.descriptor.task_id;
    match ctx
        .statuses
        .transition(task_id, |r| r.complete(result.clone(), Utc::now()))
        .await
    {
        Ok(record) => {
            // The terminal state is committed; a stale-generation ack only
            // means the slot resolves on its next delivery.
            if let Err(err) = ctx.queue.ack(delivery).await {
                debug!(task_id = %task_id, error = %err, "ack after success deferred to redelivery");
            }
            info!(task_id = %task_id, attempts = record.attempt_count, "task succeeded");

            let payload = &delivery.descriptor.payload;
            let video_url = result
                .get("video_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            dispatch_callback(
                ctx,
                payload,
                CallbackEvent::Completed {
                    video_url,
                    video_id: payload.video_id.clone(),
                    chat_id: payload.chat_id.clone(),
                    user_id: payload.user_id.clone(),
                    is_revision: payload.is_revision,
                },
            );
            Ok(())
        }
        Err(SpoolError::InvalidTransition(err)) => {
            // The task went terminal mid-run (expired). The result is
            // late; discard it, no callback.
            debug!(task_id = %task_id, %err, "late result discarded");
            ctx.queue.ack(delivery).await
        }
        Err(other) => Err(other),
    }
}

async fn commit_retryable(
    ctx: &Arc<WorkerContext>,
    delivery: &Delivery,
    attempt: u32,
    kind: FaultKind,
) -> Result<(), SpoolError> {
    let task_id = delivery.descriptor.task_id;
    if attempt < ctx.config.max_attempts {
        match ctx
            .statuses
            .transition(task_id, |r| r.requeue(Utc::now()))
            .await
        {
            Ok(_) => {
                info!(task_id = %task_id, attempt, "retry scheduled");
                match ctx.queue.nack(delivery, true).await {
                    Err(SpoolError::LostLease(_)) => {
                        // The lease expired mid-attempt. The record is
                        // Queued again; make sure the broker still tracks
                        // the task (enqueue is a no-op if it does).
                        ctx.queue.enqueue(delivery.descriptor.clone()).await
                    }
                    other => other,
                }
            }
            Err(SpoolError::InvalidTransition(err)) => {
                debug!(task_id = %task_id, %err, "retry abandoned, task went terminal");
                ctx.queue.ack(delivery).await
            }
            Err(other) => Err(other),
        }
    } else {
        // Retry budget spent. The fault message is caller-safe; the raw
        // pipeline error stays in the logs.
        commit_failure(
            ctx,
            delivery,
            TaskFault::new(kind, format!("execution failed after {attempt} attempts")),
        )
        .await
    }
}

async fn commit_failure(
    ctx: &Arc<WorkerContext>,
    delivery: &Delivery,
    fault: TaskFault,
) -> Result<(), SpoolError> {
    let task_id = delivery.descriptor.task_id;
    let message = fault.message.clone();
    match ctx
        .statuses
        .transition(task_id, |r| r.fail(fault.clone(), Utc::now()))
        .await
    {
        Ok(record) => {
            if let Err(err) = ctx.queue.nack(delivery, false).await {
                debug!(task_id = %task_id, error = %err, "dead-letter nack deferred to redelivery");
            }
            warn!(task_id = %task_id, attempts = record.attempt_count, "task failed");

            let payload = &delivery.descriptor.payload;
            dispatch_callback(
                ctx,
                payload,
                CallbackEvent::Failed {
                    error: message,
                    video_id: payload.video_id.clone(),
                    chat_id: payload.chat_id.clone(),
                    user_id: payload.user_id.clone(),
                    is_revision: payload.is_revision,
                },
            );
            Ok(())
        }
        Err(SpoolError::InvalidTransition(err)) => {
            debug!(task_id = %task_id, %err, "failure commit raced a terminal state");
            ctx.queue.ack(delivery).await
        }
        Err(other) => Err(other),
    }
}

/// Fire-and-forget terminal notification. Delivery failures are logged
/// and never affect task state.
fn dispatch_callback(ctx: &Arc<WorkerContext>, payload: &JobPayload, event: CallbackEvent) {
    let Some(url) = payload.callback_target() else {
        return;
    };
    let url = url.to_string();
    let sink = Arc::clone(&ctx.callbacks);
    let video_id = payload.video_id.clone();
    tokio::spawn(async move {
        if let Err(err) = sink.deliver(&url, &event).await {
            warn!(video_id = %video_id, url = %url, error = %err, "callback delivery failed");
        }
    });
}
