//! Domain model: identifiers, payloads, the status state machine.

pub mod ids;
pub mod payload;
pub mod status;

pub use ids::{ParseTaskIdError, TaskId};
pub use payload::JobPayload;
pub use status::{FaultKind, StatusRecord, TaskFault, TaskStatus, TransitionError};
