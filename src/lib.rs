//! Switchboard: a real-time telephony voice bridge.
//!
//! A provider streams live call audio over a WebSocket; the bridge decodes
//! it, detects speech turns, transcribes them, generates a reply, and
//! streams synthesized speech back, in real time, for the duration of a
//! phone call.
//!
//! # Architecture
//!
//! Each call gets one socket session supervising a handful of tasks:
//! - **Transcoding**: μ-law/A-law/L16 ↔ linear PCM, with streaming
//!   resampling on the synthesis path ([`codec`])
//! - **Turn segmentation**: energy-based voice activity detection ([`vad`])
//! - **Conversation**: STT → LLM → directive stripping → TTS per turn
//!   ([`turn`], [`stt`], [`llm`], [`tts`], [`directive`])
//! - **Supervision**: handshake, initial audio, duration limit, teardown,
//!   persistence ([`session`])
//! - **Routing**: short-lived stream ids and pre-generated greeting audio
//!   ([`registry`], [`preload`])

pub mod alerts;
pub mod codec;
pub mod config;
pub mod directive;
pub mod error;
pub mod llm;
pub mod preload;
pub mod provider;
pub mod records;
pub mod registry;
pub mod server;
pub mod session;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod wire;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use server::{AppState, router};
