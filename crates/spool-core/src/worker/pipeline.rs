//! External collaborator boundaries: the execution pipeline and the
//! result-callback sink.
//!
//! The pipeline is the one place the AI/image providers are invoked; the
//! core sees it as a single opaque, timeout-bounded call. Callback
//! delivery is a fire-and-forget side effect issued after the terminal
//! state commits; its failures never touch task state.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::domain::JobPayload;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Worth retrying: rate limits, flaky upstreams, timeouts.
    #[error("transient pipeline failure: {0}")]
    Transient(String),

    /// Retrying cannot help: bad input, provider rejected the job.
    #[error("permanent pipeline failure: {0}")]
    Permanent(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

/// The delegated execution pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn execute(&self, payload: &JobPayload) -> Result<serde_json::Value, PipelineError>;
}

/// Terminal-state notification for the caller's callback URL.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Completed {
        video_url: String,
        video_id: String,
        chat_id: String,
        user_id: String,
        is_revision: bool,
    },
    Failed {
        error: String,
        video_id: String,
        chat_id: String,
        user_id: String,
        is_revision: bool,
    },
}

impl CallbackEvent {
    /// Wire shape expected by the receiving frontend. Regular completions
    /// carry both `video_id` and the legacy camelCase `videoId`; revision
    /// payloads are slimmer and flagged with `is_revision`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CallbackEvent::Completed {
                video_url,
                video_id,
                chat_id,
                user_id: _,
                is_revision: true,
            } => json!({
                "video_id": video_id,
                "chat_id": chat_id,
                "video_url": video_url,
                "is_revision": true,
            }),
            CallbackEvent::Completed {
                video_url,
                video_id,
                chat_id,
                user_id,
                is_revision: false,
            } => json!({
                "video_url": video_url,
                "video_id": video_id,
                "videoId": video_id,
                "chat_id": chat_id,
                "user_id": user_id,
            }),
            CallbackEvent::Failed {
                error,
                video_id,
                chat_id,
                user_id,
                is_revision: true,
            } => json!({
                "error": error,
                "video_id": video_id,
                "chat_id": chat_id,
                "user_id": user_id,
                "is_revision": true,
            }),
            CallbackEvent::Failed {
                error,
                video_id,
                chat_id,
                user_id,
                is_revision: false,
            } => json!({
                "error": error,
                "video_id": video_id,
                "videoId": video_id,
                "chat_id": chat_id,
                "user_id": user_id,
                "status": "failed",
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("callback delivery failed: {0}")]
pub struct CallbackError(pub String);

#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, url: &str, event: &CallbackEvent) -> Result<(), CallbackError>;
}

/// Sink for deployments without callbacks (and for tests).
pub struct NoopCallbackSink;

#[async_trait]
impl CallbackSink for NoopCallbackSink {
    async fn deliver(&self, _url: &str, _event: &CallbackEvent) -> Result<(), CallbackError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_completion_carries_both_id_spellings() {
        let event = CallbackEvent::Completed {
            video_url: "https://cdn.example.com/v.mp4".to_string(),
            video_id: "vid-1".to_string(),
            chat_id: "chat-1".to_string(),
            user_id: "u-1".to_string(),
            is_revision: false,
        };
        let body = event.to_json();
        assert_eq!(body["video_id"], "vid-1");
        assert_eq!(body["videoId"], "vid-1");
        assert_eq!(body["video_url"], "https://cdn.example.com/v.mp4");
        assert!(body.get("is_revision").is_none());
    }

    #[test]
    fn revision_completion_is_flagged() {
        let event = CallbackEvent::Completed {
            video_url: "u".to_string(),
            video_id: "v".to_string(),
            chat_id: "c".to_string(),
            user_id: "x".to_string(),
            is_revision: true,
        };
        let body = event.to_json();
        assert_eq!(body["is_revision"], true);
        assert!(body.get("videoId").is_none());
    }

    #[test]
    fn failure_event_reports_failed_status() {
        let event = CallbackEvent::Failed {
            error: "execution failed".to_string(),
            video_id: "v".to_string(),
            chat_id: "c".to_string(),
            user_id: "x".to_string(),
            is_revision: false,
        };
        let body = event.to_json();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "execution failed");
    }
}
