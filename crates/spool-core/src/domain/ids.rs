//! Task identifier.
//!
//! ULID-backed: time-sortable, generatable without coordination, and
//! UUID-sized. The `task-` prefix only appears in the `Display` form; the
//! serialized representation is the bare ULID string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Identifier of a task (the unit of deferred work).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generate a fresh identifier from the current time.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid task id {0:?}")]
pub struct ParseTaskIdError(String);

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("task-").unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| ParseTaskIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_from_str() {
        let id = TaskId::generate();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_accepts_bare_ulid() {
        let id = TaskId::generate();
        let parsed: TaskId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
        assert!("".parse::<TaskId>().is_err());
    }

    #[test]
    fn ids_are_time_sortable() {
        let a = TaskId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TaskId::generate();
        assert!(a < b);
    }

    #[test]
    fn serde_uses_bare_ulid() {
        let id = TaskId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert!(!json.contains("task-"));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
