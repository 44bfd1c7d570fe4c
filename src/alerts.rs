//! Best-effort out-of-band alerting for inbound calls.
//!
//! After an inbound call with an assigned user ends, the supervisor posts a
//! summary to a per-user private channel on the chat gateway, creating the
//! channel on first use. Every failure here is logged and swallowed;
//! alerting must never interfere with call teardown.

use crate::records::{CallLogStore, CallRecord};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the chat gateway's channels API.
#[derive(Debug, Clone)]
pub struct AlertGateway {
    base_url: String,
    token: String,
    channel_name: String,
    http: reqwest::Client,
}

impl AlertGateway {
    /// Create a gateway client. `base_url` is the chat gateway root (the
    /// text-generation URL with any `/v1` suffix removed).
    pub fn new(base_url: &str, token: &str, channel_name: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        Self {
            base_url: base.to_owned(),
            token: token.to_owned(),
            channel_name: channel_name.to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// Whether alerting is configured at all.
    pub fn enabled(&self) -> bool {
        !self.token.is_empty()
    }

    /// Deliver a call summary to the user's alert channel. Best effort:
    /// returns whether the post succeeded, never errors.
    pub async fn deliver_call_summary(&self, store: &CallLogStore, record: &CallRecord) -> bool {
        let Some(user_id) = record.user_id.as_deref() else {
            return false;
        };

        let channel_id = match store.channel_for(user_id, &self.channel_name) {
            Some(cached) => cached,
            None => {
                let Some(resolved) = self.find_or_create_channel(user_id).await else {
                    warn!("could not find or create alert channel for user {user_id}");
                    return false;
                };
                if let Err(e) = store.cache_channel(user_id, &self.channel_name, &resolved) {
                    warn!("failed to cache alert channel: {e}");
                }
                resolved
            }
        };

        let message = format!(
            "**Inbound Call Alert**\n\n\
             **From:** {}\n\
             **To:** {}\n\
             **Duration:** {}s\n\
             **Status:** {}\n\n\
             **Transcription:**\n{}",
            record.from_number,
            record.to_number,
            record.duration_secs.unwrap_or(0),
            record.status,
            record
                .transcript
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or("(No transcription available)")
        );
        self.post_message(&channel_id, &message).await
    }

    async fn find_or_create_channel(&self, user_id: &str) -> Option<String> {
        if let Some(found) = self.find_channel(user_id).await {
            return Some(found);
        }
        self.create_channel(user_id).await
    }

    async fn find_channel(&self, user_id: &str) -> Option<String> {
        let resp = self
            .http
            .get(format!("{}/api/v1/channels/", self.base_url))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            warn!("channel listing returned {}", resp.status());
            return None;
        }
        let channels: Vec<serde_json::Value> = resp.json().await.ok()?;
        for channel in channels {
            let name = channel["name"].as_str().unwrap_or_default();
            if !name.eq_ignore_ascii_case(&self.channel_name) {
                continue;
            }
            let is_member = channel["user_ids"]
                .as_array()
                .is_some_and(|ids| ids.iter().any(|v| v.as_str() == Some(user_id)))
                || channel["user_id"].as_str() == Some(user_id);
            if is_member && let Some(id) = channel["id"].as_str() {
                debug!("found alert channel {id} for user {user_id}");
                return Some(id.to_owned());
            }
        }
        None
    }

    async fn create_channel(&self, user_id: &str) -> Option<String> {
        let resp = self
            .http
            .post(format!("{}/api/v1/channels/create", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": self.channel_name,
                "description": "Call alerts from the voice bridge",
                "is_private": true,
                "user_ids": [user_id],
                "access_control": {},
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            warn!("channel creation returned {}", resp.status());
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        body["id"].as_str().map(str::to_owned)
    }

    async fn post_message(&self, channel_id: &str, content: &str) -> bool {
        let result = self
            .http
            .post(format!(
                "{}/api/v1/channels/{channel_id}/messages/post",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .json(&json!({ "content": content }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!("alert delivered to channel {channel_id}");
                true
            }
            Ok(resp) => {
                warn!("alert post returned {}", resp.status());
                false
            }
            Err(e) => {
                warn!("alert post failed: {e}");
                false
            }
        }
    }
}
