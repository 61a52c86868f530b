//! Webhook payload: the opaque-but-shaped data a task carries.
//!
//! The inbound webhook is duck-typed JSON. We pin down the recognized
//! fields as a fixed struct and keep everything else in `extra`, so the
//! boundary validates shape once and the core never digs into raw JSON.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

fn default_aspect_ratio() -> String {
    "9:16".to_string()
}

/// Structured view of an inbound admission request.
///
/// Required for admission: `idempotency_key`, `prompt`, `image_url`,
/// `video_id`, `user_id`, `user_email`. The rest is optional context the
/// execution pipeline and callback delivery may use. Unrecognized fields
/// land in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub video_id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub is_revision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, alias = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, alias = "executionMode", skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    /// Structural validation only. Semantic checks (does the image exist,
    /// is the prompt sensible) belong to the execution pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.idempotency_key.trim().is_empty() {
            return Err("idempotency_key must be non-empty".to_string());
        }
        let required = [
            ("prompt", &self.prompt),
            ("image_url", &self.image_url),
            ("video_id", &self.video_id),
            ("user_id", &self.user_id),
            ("user_email", &self.user_email),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }

    /// Cheap comparable digest used to detect conflicting reuse of an
    /// idempotency key. serde_json maps are ordered, so the encoding is
    /// canonical for equal payloads.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        encoded.hash(&mut hasher);
        hasher.finish()
    }

    /// First 100 chars of the prompt, for status metadata.
    pub fn prompt_preview(&self) -> String {
        if self.prompt.chars().count() > 100 {
            let head: String = self.prompt.chars().take(100).collect();
            format!("{head}...")
        } else {
            self.prompt.clone()
        }
    }

    /// Where the terminal result should be delivered, if anywhere.
    /// `callback_url` wins over the legacy `webhookUrl` field.
    pub fn callback_target(&self) -> Option<&str> {
        self.callback_url
            .as_deref()
            .or(self.webhook_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

#[cfg(test)]
impl JobPayload {
    /// Minimal valid payload for tests across the crate.
    pub(crate) fn sample() -> Self {
        serde_json::from_value(serde_json::json!({
            "idempotency_key": "k1",
            "prompt": "a product spin on a marble table",
            "image_url": "https://img.example.com/p.png",
            "video_id": "vid-1",
            "chat_id": "chat-1",
            "user_id": "u-1",
            "user_email": "u@example.com",
            "user_name": "U",
            "source": "web_app",
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JobPayload {
        JobPayload::sample()
    }

    #[test]
    fn valid_payload_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_idempotency_key_is_rejected() {
        let mut p = sample();
        p.idempotency_key = "  ".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn missing_required_fields_are_named() {
        let mut p = sample();
        p.image_url.clear();
        p.user_email.clear();
        let err = p.validate().unwrap_err();
        assert!(err.contains("image_url"));
        assert!(err.contains("user_email"));
    }

    #[test]
    fn webhook_url_alias_is_accepted() {
        let p: JobPayload = serde_json::from_value(json!({
            "idempotency_key": "k",
            "prompt": "p",
            "image_url": "i",
            "video_id": "v",
            "user_id": "u",
            "user_email": "e",
            "webhookUrl": "https://hooks.example.com/x",
        }))
        .unwrap();
        assert_eq!(p.callback_target(), Some("https://hooks.example.com/x"));
    }

    #[test]
    fn callback_url_wins_over_webhook_url() {
        let mut p = sample();
        p.callback_url = Some("https://a.example.com".to_string());
        p.webhook_url = Some("https://b.example.com".to_string());
        assert_eq!(p.callback_target(), Some("https://a.example.com"));
    }

    #[test]
    fn aspect_ratio_defaults_to_portrait() {
        let p = sample();
        assert_eq!(p.aspect_ratio, "9:16");
    }

    #[test]
    fn unknown_fields_are_kept_in_extra() {
        let p: JobPayload = serde_json::from_value(json!({
            "idempotency_key": "k",
            "prompt": "p",
            "image_url": "i",
            "video_id": "v",
            "user_id": "u",
            "user_email": "e",
            "model": "wan",
        }))
        .unwrap();
        assert_eq!(p.extra.get("model"), Some(&json!("wan")));
    }

    #[test]
    fn equal_payloads_share_a_fingerprint() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
    }

    #[test]
    fn different_prompts_differ_in_fingerprint() {
        let a = sample();
        let mut b = sample();
        b.prompt = "something else entirely".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn prompt_preview_truncates_long_prompts() {
        let mut p = sample();
        p.prompt = "x".repeat(250);
        let preview = p.prompt_preview();
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));
    }
}
