//! Speech-to-text over HTTP.
//!
//! The transcription service accepts a multipart WAV upload on
//! `/transcribe` and returns `{"text": "..."}`. One request per utterance;
//! no streaming.

use crate::codec::WIRE_SAMPLE_RATE;
use crate::config::SttConfig;
use crate::error::{BridgeError, Result};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the transcription backend.
#[derive(Debug, Clone)]
pub struct SttClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
}

impl SttClient {
    /// Create a client from config.
    pub fn new(config: &SttConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_owned(),
            timeout: Duration::from_secs(config.timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    /// Transcribe a WAV buffer to text.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, or a non-success
    /// status from the backend.
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| BridgeError::Stt(format!("multipart: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .http
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BridgeError::Stt(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(BridgeError::Stt(format!(
                "backend returned {}",
                resp.status()
            )));
        }
        let body: TranscribeResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::Stt(format!("bad response body: {e}")))?;
        debug!("transcribed: {:?}", body.text);
        Ok(body.text)
    }

    /// Whether the backend answers its health endpoint.
    pub async fn health(&self) -> bool {
        self.http
            .get(format!("{}/healthz", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Wrap raw 16-bit mono PCM at the wire rate in a WAV container.
///
/// # Errors
///
/// Returns an error if the buffer has an odd length.
pub fn wav_container(pcm: &[u8]) -> Result<Vec<u8>> {
    if pcm.len() % 2 != 0 {
        return Err(BridgeError::Codec(format!(
            "odd-length PCM buffer: {} bytes",
            pcm.len()
        )));
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: WIRE_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| BridgeError::Codec(format!("wav writer: {e}")))?;
        for chunk in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))
                .map_err(|e| BridgeError::Codec(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| BridgeError::Codec(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}
