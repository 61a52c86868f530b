//! Runtime configuration. Every tunable lives here with a default;
//! nothing is hard-coded at a call site.

use std::time::Duration;

use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Worker pool size; caps simultaneously Running tasks.
    pub workers: usize,

    /// Executions per task before it goes to Failed.
    pub max_attempts: u32,

    /// Backoff schedule between redeliveries.
    pub retry: RetryPolicy,

    /// Unacked deliveries become deliverable again after this.
    pub lease_timeout: Duration,

    /// Per-attempt bound on the execution pipeline; timeout counts as a
    /// transient failure.
    pub attempt_timeout: Duration,

    /// Tasks sitting in Queued/Running longer than this are expired.
    pub expiry_bound: Duration,

    /// How long idempotency and status records stay queryable.
    pub retention_ttl: Duration,

    /// Reservations with no status record older than this are released by
    /// the reconciliation sweep.
    pub reservation_grace: Duration,

    /// Cadence of the expiry + reconciliation sweep.
    pub reaper_interval: Duration,

    /// Worker poll bound; also the worst-case shutdown latency per worker.
    pub dequeue_timeout: Duration,

    /// Completion latency samples kept for the percentile window.
    pub latency_window: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            lease_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(300),
            expiry_bound: Duration::from_secs(30 * 60),
            retention_ttl: Duration::from_secs(3600),
            reservation_grace: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(60),
            dequeue_timeout: Duration::from_secs(1),
            latency_window: 1024,
        }
    }
}

#[cfg(test)]
impl SpoolConfig {
    /// Tight timings so tests exercise retry/expiry paths in milliseconds.
    pub(crate) fn fast() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_delay: Duration::from_millis(100),
                jitter: 0.0,
            },
            lease_timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(2),
            expiry_bound: Duration::from_millis(200),
            retention_ttl: Duration::from_secs(60),
            reservation_grace: Duration::from_millis(100),
            reaper_interval: Duration::from_millis(50),
            dequeue_timeout: Duration::from_millis(20),
            latency_window: 64,
        }
    }
}
