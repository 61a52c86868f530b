//! Processing stats derived from status transition events.
//!
//! The aggregator is a passive observer on the status store's broadcast
//! channel: gauges for Queued/Running, monotonic counters for admissions
//! and terminal outcomes, and completion-latency percentiles over a
//! bounded window of recent finishes. If the observer lags and drops
//! events the numbers drift; the status store stays authoritative.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::TaskStatus;
use crate::store::{TaskStatusStore, TransitionEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Admissions observed, including ones since finished.
    pub total_requests: u64,
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub expired: u64,
    /// Admission-to-success latency percentiles over the recent window.
    /// `None` until at least one task has succeeded.
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    queued: u64,
    running: u64,
    succeeded: u64,
    failed: u64,
    expired: u64,
    latencies_ms: VecDeque<u64>,
}

impl StatsInner {
    fn apply(&mut self, event: &TransitionEvent, window: usize) {
        match event.from {
            None => self.total_requests += 1,
            Some(TaskStatus::Queued) => self.queued = self.queued.saturating_sub(1),
            Some(TaskStatus::Running) => self.running = self.running.saturating_sub(1),
            // Terminal states never transition again.
            Some(_) => {}
        }
        match event.to {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => {
                self.succeeded += 1;
                let elapsed = event
                    .record
                    .updated_at
                    .signed_duration_since(event.record.created_at)
                    .num_milliseconds()
                    .max(0) as u64;
                self.latencies_ms.push_back(elapsed);
                while self.latencies_ms.len() > window {
                    self.latencies_ms.pop_front();
                }
            }
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Expired => self.expired += 1,
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        StatsSnapshot {
            total_requests: self.total_requests,
            queued: self.queued,
            running: self.running,
            succeeded: self.succeeded,
            failed: self.failed,
            expired: self.expired,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[u64], q: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

pub struct StatsAggregator {
    inner: Arc<Mutex<StatsInner>>,
    join: JoinHandle<()>,
}

impl StatsAggregator {
    /// Subscribe to the store and start consuming events.
    pub fn spawn(statuses: &TaskStatusStore, latency_window: usize) -> Self {
        let inner = Arc::new(Mutex::new(StatsInner::default()));
        let mut events = statuses.subscribe();
        let consumer_inner = Arc::clone(&inner);
        let join = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Ok(mut inner) = consumer_inner.lock() {
                            inner.apply(&event, latency_window);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "stats observer lagged, counters may drift");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { inner, join }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .lock()
            .map(|inner| inner.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for StatsAggregator {
    fn drop(&mut self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, StatusRecord, TaskFault, TaskId};
    use crate::store::InMemoryKvStore;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.50), Some(50));
        assert_eq!(percentile(&sorted, 0.95), Some(95));
        assert_eq!(percentile(&sorted, 0.99), Some(99));
        assert_eq!(percentile(&[42], 0.50), Some(42));
        assert_eq!(percentile(&[], 0.50), None);
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut inner = StatsInner::default();
        let payload = JobPayload::sample();
        for _ in 0..10 {
            let record = StatusRecord::new(TaskId::generate(), &payload, Utc::now());
            inner.apply(
                &TransitionEvent {
                    task_id: record.task_id,
                    from: Some(TaskStatus::Running),
                    to: TaskStatus::Succeeded,
                    record,
                },
                4,
            );
        }
        assert_eq!(inner.latencies_ms.len(), 4);
        assert_eq!(inner.succeeded, 10);
    }

    fn store() -> TaskStatusStore {
        TaskStatusStore::new(Arc::new(InMemoryKvStore::new()), Duration::from_secs(3600))
    }

    async fn admit(statuses: &TaskStatusStore) -> TaskId {
        let task_id = TaskId::generate();
        let record = StatusRecord::new(task_id, &JobPayload::sample(), Utc::now());
        statuses.insert(record).await.unwrap();
        task_id
    }

    async fn wait_for<F>(stats: &StatsAggregator, predicate: F) -> StatsSnapshot
    where
        F: Fn(&StatsSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = stats.snapshot();
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stats never reached the expected shape")
    }

    #[tokio::test]
    async fn admission_counts_and_queued_gauge() {
        let statuses = store();
        let stats = StatsAggregator::spawn(&statuses, 64);
        admit(&statuses).await;
        admit(&statuses).await;

        let snapshot = wait_for(&stats, |s| s.total_requests == 2).await;
        assert_eq!(snapshot.queued, 2);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.p50_ms, None);
    }

    #[tokio::test]
    async fn full_lifecycle_moves_gauges_to_counters() {
        let statuses = store();
        let stats = StatsAggregator::spawn(&statuses, 64);
        let task_id = admit(&statuses).await;
        statuses
            .transition(task_id, |r| r.begin_attempt(Utc::now()))
            .await
            .unwrap();
        statuses
            .transition(task_id, |r| r.complete(serde_json::json!({}), Utc::now()))
            .await
            .unwrap();

        let snapshot = wait_for(&stats, |s| s.succeeded == 1).await;
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.running, 0);
        assert!(snapshot.p50_ms.is_some());
    }

    #[tokio::test]
    async fn failures_and_expiries_are_counted_separately() {
        let statuses = store();
        let stats = StatsAggregator::spawn(&statuses, 64);

        let failed = admit(&statuses).await;
        statuses
            .transition(failed, |r| r.begin_attempt(Utc::now()))
            .await
            .unwrap();
        statuses
            .transition(failed, |r| {
                r.fail(
                    TaskFault::new(crate::domain::FaultKind::Permanent, "x"),
                    Utc::now(),
                )
            })
            .await
            .unwrap();

        let expired = admit(&statuses).await;
        statuses
            .transition(expired, |r| r.expire(Utc::now()))
            .await
            .unwrap();

        let snapshot = wait_for(&stats, |s| s.failed == 1 && s.expired == 1).await;
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.succeeded, 0);
        // Failures contribute no latency sample.
        assert_eq!(snapshot.p50_ms, None);
    }

    #[tokio::test]
    async fn retry_cycle_keeps_gauges_consistent() {
        let statuses = store();
        let stats = StatsAggregator::spawn(&statuses, 64);
        let task_id = admit(&statuses).await;
        statuses
            .transition(task_id, |r| r.begin_attempt(Utc::now()))
            .await
            .unwrap();
        statuses
            .transition(task_id, |r| r.requeue(Utc::now()))
            .await
            .unwrap();

        let snapshot = wait_for(&stats, |s| s.queued == 1 && s.running == 0).await;
        assert_eq!(snapshot.total_requests, 1);
    }
}
