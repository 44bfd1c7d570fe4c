//! Error types for the voice bridge.

/// Top-level error type for the telephony bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Audio transcoding error (bad header, odd-length buffer, encode failure).
    #[error("codec error: {0}")]
    Codec(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Text-generation backend error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Telephony provider action error (dial/answer/hangup rejected).
    #[error("provider error: {0}")]
    Provider(String),

    /// Stream registry error (unknown, duplicate, or expired stream id).
    #[error("registry error: {0}")]
    Registry(String),

    /// Preload queue error (duplicate producer for a call id).
    #[error("preload error: {0}")]
    Preload(String),

    /// Media socket session error.
    #[error("session error: {0}")]
    Session(String),

    /// Call log persistence error.
    #[error("records error: {0}")]
    Records(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
