//! Shared mutable state lives behind the `KeyValueStore` port.
//!
//! All cross-component coordination is expressed with two key-scoped atomic
//! operations: insert-if-absent and version-guarded compare-and-swap. No
//! multi-key transactions; every invariant is per task. The in-memory
//! implementation here is the development backend; an external store slots
//! in behind the same trait.

mod idempotency;
mod memory;
mod status_store;

pub use idempotency::{IdempotencyStore, Reservation, Reserve};
pub use memory::InMemoryKvStore;
pub use status_store::{TaskStatusStore, TransitionEvent};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SpoolError;

/// A stored value together with its write version.
///
/// The version is a per-key counter bumped on every successful write.
/// Guarding swaps on it (rather than on value equality) keeps the
/// comparison O(1) and rules out ABA.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Insert `value` only when `key` has no live entry. Returns true when
    /// the insert happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, SpoolError>;

    async fn get(&self, key: &str) -> Result<Option<Versioned>, SpoolError>;

    /// Replace the value only when the stored version still equals
    /// `expected_version`. Returns false when the entry moved (or is gone).
    /// The entry's expiry is not extended.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<bool, SpoolError>;

    async fn remove(&self, key: &str) -> Result<(), SpoolError>;

    /// Snapshot all live entries whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, SpoolError>;
}
