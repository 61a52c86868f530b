//! Reaper: periodic expiry and reconciliation sweep.
//!
//! Two jobs, both idempotent so overlapping or repeated sweeps are
//! harmless:
//!
//! - Expiry: any task still non-terminal past the expiry bound is moved
//!   to Expired. The broker is not touched here; the next delivery of an
//!   expired task fails its claim and is dropped by the worker.
//! - Reconciliation: an idempotency reservation whose task has no status
//!   record is the footprint of an admission that crashed between the
//!   reservation and the status insert. Past a grace period the
//!   reservation is released so the caller's retry can go through.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SpoolConfig;
use crate::error::SpoolError;
use crate::store::{IdempotencyStore, TaskStatusStore};

/// What one sweep did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub released: usize,
}

pub struct Reaper {
    statuses: Arc<TaskStatusStore>,
    idempotency: Arc<IdempotencyStore>,
    config: SpoolConfig,
}

impl Reaper {
    pub fn new(
        statuses: Arc<TaskStatusStore>,
        idempotency: Arc<IdempotencyStore>,
        config: SpoolConfig,
    ) -> Self {
        Self {
            statuses,
            idempotency,
            config,
        }
    }

    /// One full pass. Exposed so callers (and tests) can sweep on demand
    /// without waiting for the interval.
    pub async fn sweep(&self) -> Result<SweepReport, SpoolError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for record in self.statuses.scan().await? {
            if record.status.is_terminal() {
                continue;
            }
            let age = now
                .signed_duration_since(record.created_at)
                .to_std()
                .unwrap_or_default();
            if age < self.config.expiry_bound {
                continue;
            }
            match self
                .statuses
                .transition(record.task_id, |r| r.expire(Utc::now()))
                .await
            {
                Ok(_) => {
                    warn!(task_id = %record.task_id, age_secs = age.as_secs(), "task expired");
                    report.expired += 1;
                }
                // The task finished or was evicted while we swept.
                Err(SpoolError::InvalidTransition(_)) | Err(SpoolError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }

        for (key, reservation) in self.idempotency.scan().await? {
            if self.statuses.get(reservation.task_id).await?.is_some() {
                continue;
            }
            let age = now
                .signed_duration_since(reservation.reserved_at)
                .to_std()
                .unwrap_or_default();
            if age < self.config.reservation_grace {
                // Could be an admission currently in flight.
                continue;
            }
            self.idempotency.release(&key).await?;
            info!(task_id = %reservation.task_id, idempotency_key = %key, "orphan reservation released");
            report.released += 1;
        }

        Ok(report)
    }

    /// Run the sweep on `reaper_interval` until shutdown.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reaper_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) if report != SweepReport::default() => {
                                info!(expired = report.expired, released = report.released, "sweep finished");
                            }
                            Ok(_) => debug!("sweep found nothing to do"),
                            Err(err) => warn!(error = %err, "sweep failed"),
                        }
                    }
                }
            }
        });
        ReaperHandle { shutdown_tx, join }
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
