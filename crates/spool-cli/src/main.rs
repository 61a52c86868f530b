//! End-to-end demo: admit a webhook payload, watch the worker pool retry
//! it to success, exercise deduplication and conflict rejection, then
//! print the final status and processing stats.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;
use tracing::info;

use spool_core::config::SpoolConfig;
use spool_core::domain::JobPayload;
use spool_core::error::SpoolError;
use spool_core::gateway::IngestionGateway;
use spool_core::queue::{InMemoryTaskQueue, RetryPolicy, TaskQueue};
use spool_core::reaper::Reaper;
use spool_core::stats::StatsAggregator;
use spool_core::store::{IdempotencyStore, InMemoryKvStore, TaskStatusStore};
use spool_core::worker::{
    CallbackError, CallbackEvent, CallbackSink, Pipeline, PipelineError, WorkerContext, WorkerPool,
};

/// Stand-in for the real video pipeline: fails transiently a fixed number
/// of times, then produces a result.
struct FlakyPipeline {
    remaining_failures: AtomicU32,
}

impl FlakyPipeline {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Pipeline for FlakyPipeline {
    async fn execute(&self, payload: &JobPayload) -> Result<serde_json::Value, PipelineError> {
        // Simulate some work.
        sleep(Duration::from_millis(200)).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(PipelineError::Transient(format!(
                "upstream still warming up ({left} failures left)"
            )));
        }

        Ok(json!({
            "video_url": format!("https://cdn.example.com/{}.mp4", payload.video_id),
            "aspect_ratio": payload.aspect_ratio,
        }))
    }
}

/// POSTs the terminal-state event to the payload's callback URL.
struct HttpCallbackSink {
    client: reqwest::Client,
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    async fn deliver(&self, url: &str, event: &CallbackEvent) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(url)
            .json(&event.to_json())
            .send()
            .await
            .map_err(|err| CallbackError(err.to_string()))?;
        response
            .error_for_status()
            .map_err(|err| CallbackError(err.to_string()))?;
        Ok(())
    }
}

fn demo_payload() -> JobPayload {
    serde_json::from_value(json!({
        "idempotency_key": "demo-key-1",
        "prompt": "a slow product spin on a marble table, soft daylight",
        "image_url": "https://img.example.com/product.png",
        "video_id": "vid-demo-1",
        "chat_id": "chat-demo-1",
        "user_id": "user-demo-1",
        "user_email": "demo@example.com",
        "user_name": "Demo",
        "source": "web_app",
    }))
    .expect("demo payload is valid JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Short backoff so the retry loop is visible without the wait.
    let config = SpoolConfig {
        workers: 2,
        retry: RetryPolicy {
            base_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        },
        ..SpoolConfig::default()
    };

    let kv = Arc::new(InMemoryKvStore::new());
    let idempotency = Arc::new(IdempotencyStore::new(kv.clone(), config.retention_ttl));
    let statuses = Arc::new(TaskStatusStore::new(kv, config.retention_ttl));
    let queue: Arc<InMemoryTaskQueue> = Arc::new(InMemoryTaskQueue::new(
        config.retry.clone(),
        config.lease_timeout,
    ));
    let gateway = IngestionGateway::new(idempotency.clone(), statuses.clone(), queue.clone());

    let stats = StatsAggregator::spawn(&statuses, config.latency_window);
    let reaper = Reaper::new(statuses.clone(), idempotency.clone(), config.clone()).spawn();
    let pool = WorkerPool::spawn(Arc::new(WorkerContext {
        queue: queue.clone(),
        statuses: statuses.clone(),
        pipeline: Arc::new(FlakyPipeline::new(2)),
        callbacks: Arc::new(HttpCallbackSink {
            client: reqwest::Client::new(),
        }),
        config,
    }));

    // First admission creates the task.
    let admission = gateway.admit(demo_payload()).await?;
    info!(task_id = %admission.task_id, is_new = admission.is_new, "admitted");

    // Same payload again: same task back, nothing re-enqueued.
    let duplicate = gateway.admit(demo_payload()).await?;
    info!(task_id = %duplicate.task_id, is_new = duplicate.is_new, "duplicate admission");
    assert_eq!(duplicate.task_id, admission.task_id);

    // Same key, different payload: rejected, original untouched.
    let mut conflicting = demo_payload();
    conflicting.prompt = "something else entirely".to_string();
    match gateway.admit(conflicting).await {
        Err(SpoolError::IdempotencyConflict { key }) => {
            info!(%key, "conflicting reuse rejected");
        }
        other => anyhow::bail!("expected an idempotency conflict, got {other:?}"),
    }

    // Poll until the worker pool drives the task to a terminal state.
    let record = loop {
        let record = gateway.status(admission.task_id).await?;
        if record.status.is_terminal() {
            break record;
        }
        sleep(Duration::from_millis(100)).await;
    };
    println!("final status: {}", serde_json::to_string_pretty(&record)?);
    println!(
        "stats: {}",
        serde_json::to_string_pretty(&stats.snapshot())?
    );
    println!("queue depth: {:?}", queue.depth().await?);

    pool.shutdown_and_join().await;
    reaper.shutdown_and_join().await;
    Ok(())
}
