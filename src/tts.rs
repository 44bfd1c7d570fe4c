//! Text-to-speech over HTTP.
//!
//! The synthesis service streams a WAV byte stream from
//! `/v1/audio/speech/stream`; the caller feeds the chunks through
//! [`crate::codec::outbound::OutboundEncoder`] as they arrive.

use crate::config::TtsConfig;
use crate::error::{BridgeError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tracing::debug;

/// HTTP client for the synthesis backend.
#[derive(Debug, Clone)]
pub struct TtsClient {
    base_url: String,
    voice_id: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<serde_json::Value>,
}

impl TtsClient {
    /// Create a client from config.
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_owned(),
            voice_id: config.voice_id.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    /// Start a streaming synthesis request for `text`.
    ///
    /// The returned stream yields raw WAV bytes (44-byte header first).
    /// The configured timeout covers the whole response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the backend
    /// rejects it.
    pub async fn synthesize(
        &self,
        text: &str,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Unpin + use<>> {
        debug!("synthesizing {} chars with voice {}", text.len(), self.voice_id);
        let resp = self
            .http
            .post(format!("{}/v1/audio/speech/stream", self.base_url))
            .json(&serde_json::json!({
                "input": text,
                "voice": self.voice_id,
                "response_format": "wav",
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BridgeError::Tts(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(BridgeError::Tts(format!(
                "backend returned {}",
                resp.status()
            )));
        }
        Ok(resp
            .bytes_stream()
            .map(|item| item.map_err(|e| BridgeError::Tts(format!("stream error: {e}")))))
    }

    /// List available voices (thin pass-through for the HTTP proxy).
    pub async fn list_voices(&self) -> Result<Vec<serde_json::Value>> {
        let resp = self
            .http
            .get(format!("{}/v1/voices", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| BridgeError::Tts(format!("request failed: {e}")))?;
        let body: VoicesResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::Tts(format!("bad response body: {e}")))?;
        Ok(body.voices)
    }
}
