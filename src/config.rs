//! Configuration types for the voice bridge.
//!
//! A [`BridgeConfig`] is loaded once at startup and snapshotted per call
//! session; sessions never observe config changes mid-call.

use crate::codec::WireCodec;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// HTTP/WebSocket server settings.
    pub server: ServerConfig,
    /// Telephony provider settings.
    pub provider: ProviderConfig,
    /// Text-generation backend settings.
    pub llm: LlmConfig,
    /// Speech-to-text backend settings.
    pub stt: SttConfig,
    /// Text-to-speech backend settings.
    pub tts: TtsConfig,
    /// Turn segmentation (voice activity detection) settings.
    pub vad: VadConfig,
    /// Per-call limits and teardown behavior.
    pub call: CallConfig,
}

/// Server edge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener.
    pub bind_addr: String,
    /// Public base URL handed to the provider for stream/webhook callbacks
    /// (e.g. `https://bridge.example.com`). A `https` scheme selects `wss`
    /// for the stream URL.
    pub public_url: String,
    /// Shared secret expected as the `token` query parameter on the media
    /// socket and webhook endpoints.
    pub stream_secret: String,
    /// Seconds an unconnected stream registration stays resolvable.
    pub registration_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            public_url: "http://localhost:8080".to_owned(),
            stream_secret: String::new(),
            registration_ttl_secs: 600,
        }
    }
}

/// Telephony provider (call control) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the provider's call-control REST API.
    pub api_base: String,
    /// Bearer token for provider API calls.
    pub api_key: String,
    /// Call-control application (connection) id used for outbound dials.
    pub app_id: String,
    /// Caller id for outbound dials.
    pub from_number: String,
    /// Whether inbound calls are answered at all.
    pub inbound_enabled: bool,
    /// System prompt applied to inbound calls (also drives the inbound
    /// greeting preload).
    pub inbound_prompt: Option<String>,
    /// User auto-assigned to inbound calls, for teardown alerting.
    pub assigned_user_id: Option<String>,
    /// Wire codec negotiated with the provider for the media stream.
    pub codec: WireCodec,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telnyx.com/v2".to_owned(),
            api_key: String::new(),
            app_id: String::new(),
            from_number: String::new(),
            inbound_enabled: true,
            inbound_prompt: None,
            assigned_user_id: None,
            codec: WireCodec::Pcmu,
        }
    }
}

/// Text-generation backend configuration (OpenAI-style chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL including `/v1` (e.g. `http://open-webui:8080/v1`).
    pub url: String,
    /// Bearer token. Empty disables the Authorization header.
    pub api_key: String,
    /// Model identifier sent in requests.
    pub model: String,
    /// Deployment-wide system prompt prepended to every call.
    pub system_prompt: Option<String>,
    /// Whether the full conversation history is forwarded each turn.
    /// When false, each turn sends only the system prompt and the
    /// current user utterance.
    pub forward_context: bool,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "http://open-webui:8080/v1".to_owned(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_owned(),
            system_prompt: None,
            forward_context: true,
            timeout_secs: 10,
        }
    }
}

/// Speech-to-text backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Base URL of the transcription service.
    pub url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "http://parakeet:8000".to_owned(),
            timeout_secs: 10,
        }
    }
}

/// Text-to-speech backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of the synthesis service.
    pub url: String,
    /// Voice identifier passed to the synthesis service.
    pub voice_id: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "http://chatterbox:8000".to_owned(),
            voice_id: "default".to_owned(),
            timeout_secs: 10,
        }
    }
}

/// Turn segmentation configuration.
///
/// Thresholds are tuned for 16-bit PCM at the 8 kHz telephony rate. The
/// relationships matter more than the absolute values: the trailing-silence
/// window must exceed natural mid-sentence pauses, and the minimum utterance
/// must filter out line clicks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold on i16 samples; chunks below count as silence.
    pub energy_threshold: f64,
    /// Trailing silence in ms that ends an utterance.
    pub min_trailing_silence_ms: u64,
    /// Minimum buffered speech in ms for a silence-triggered boundary.
    pub min_utterance_ms: u64,
    /// Hard ceiling in ms; the buffer is dispatched regardless of silence.
    pub max_utterance_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 500.0,
            min_trailing_silence_ms: 1200,
            min_utterance_ms: 500,
            max_utterance_ms: 15_000,
        }
    }
}

/// Per-call limits and teardown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Maximum call duration in seconds before forced termination.
    pub max_duration_secs: u64,
    /// Message spoken when the duration limit fires.
    pub limit_message: String,
    /// Estimated cost per minute of call time, written to the call log.
    pub cost_per_minute: f64,
    /// Name of the alert channel used for inbound call summaries.
    pub alert_channel_name: String,
    /// Admin token for the alert gateway. Empty disables alerting.
    pub alert_token: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 600,
            limit_message: "This call has reached its time limit. Goodbye.".to_owned(),
            cost_per_minute: 0.005,
            alert_channel_name: "Voice Bridge Alerts".to_owned(),
            alert_token: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Total seconds the initial-audio sender may wait for a preload queue
    /// that has not been created yet (inbound greeting generation races
    /// socket attachment).
    pub fn preload_wait_secs(&self) -> u64 {
        self.llm.timeout_secs + self.tts.timeout_secs
    }
}
