//! spool-core
//!
//! Core building blocks for an idempotent webhook-ingestion and task
//! execution runtime.
//!
//! # Module layout
//! - **domain**: identifiers, the webhook payload, the status state machine
//! - **store**: the `KeyValueStore` port plus the idempotency and status
//!   stores built on it
//! - **queue**: the `TaskQueue` port with leases, backoff and dead letters
//! - **gateway**: the admission path (validate, reserve, record, enqueue)
//! - **worker**: the worker pool, the `Pipeline` port and callback delivery
//! - **reaper**: periodic expiry and reconciliation sweep
//! - **stats**: counters and latency percentiles from transition events
//! - **config**: every tunable, with defaults

pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod reaper;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::SpoolConfig;
pub use error::SpoolError;
