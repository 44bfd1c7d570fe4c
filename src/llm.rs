//! Text generation via an OpenAI-compatible chat completions API.
//!
//! Requests always stream (`stream: true`), but the reply is reassembled in
//! full before the caller acts on it: a partial reply must never be spoken
//! or parsed for an embedded directive.

use crate::config::LlmConfig;
use crate::error::{BridgeError, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// HTTP client for the text-generation backend.
#[derive(Debug, Clone)]
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a client from config.
    pub fn new(config: &LlmConfig) -> Self {
        // Accept base URLs with or without the /v1 suffix.
        let base = config.url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        Self {
            base_url: base.to_owned(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    /// Stream a chat completion and return the fully reassembled reply.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, or a non-success
    /// status from the backend.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .timeout(self.timeout);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BridgeError::Llm(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::Llm(format!(
                "backend returned {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut reply = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BridgeError::Llm(format!("stream error: {e}")))?;
            line_buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim_end();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                    reply.push_str(delta);
                }
                if event["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break 'outer;
                }
            }
        }

        info!(
            "generated {} chars in {:.1}s",
            reply.len(),
            started.elapsed().as_secs_f64()
        );
        debug!("full reply: {reply:?}");
        Ok(reply)
    }
}
