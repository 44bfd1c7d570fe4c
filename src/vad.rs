//! Turn segmentation using RMS energy analysis.
//!
//! Consumes decoded 16-bit PCM from the inbound leg and decides where one
//! user utterance ends. A boundary fires on sustained trailing silence (once
//! enough speech is buffered) or on a hard buffering ceiling. A buffer that
//! never crossed the energy threshold is discarded as line noise instead of
//! being dispatched to transcription.

use crate::codec::{WIRE_SAMPLE_RATE, rms};
use crate::config::VadConfig;
use tracing::debug;

/// Bytes per second of buffered 16-bit mono PCM at the wire rate.
const PCM_BYTES_PER_SEC: f64 = WIRE_SAMPLE_RATE as f64 * 2.0;

/// Why a turn boundary fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryReason {
    /// Trailing silence after a sufficiently long utterance.
    SilenceDetected,
    /// The hard buffering ceiling was hit.
    MaxDuration,
}

/// A complete utterance ready for transcription.
#[derive(Debug)]
pub struct Utterance {
    /// Concatenated 16-bit little-endian PCM at the wire rate.
    pub pcm: Vec<u8>,
    /// What ended the utterance.
    pub reason: BoundaryReason,
}

/// Energy-based turn segmenter.
///
/// State is cleared after every decision, dispatch and discard alike.
pub struct TurnSegmenter {
    config: VadConfig,
    buffer: Vec<u8>,
    silence_secs: f64,
    has_speech: bool,
}

impl TurnSegmenter {
    /// Create a segmenter with the given thresholds.
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            silence_secs: 0.0,
            has_speech: false,
        }
    }

    /// Feed one decoded PCM chunk. Returns a complete utterance when a turn
    /// boundary fires; silent buffers are discarded internally.
    pub fn push(&mut self, pcm: &[u8]) -> Option<Utterance> {
        self.buffer.extend_from_slice(pcm);

        let energy = rms(pcm);
        let chunk_secs = pcm.len() as f64 / PCM_BYTES_PER_SEC;
        if energy < self.config.energy_threshold {
            self.silence_secs += chunk_secs;
        } else {
            self.silence_secs = 0.0;
            self.has_speech = true;
        }

        let buffered_secs = self.buffer.len() as f64 / PCM_BYTES_PER_SEC;
        let reason = if buffered_secs > self.config.max_utterance_ms as f64 / 1000.0 {
            BoundaryReason::MaxDuration
        } else if self.silence_secs > self.config.min_trailing_silence_ms as f64 / 1000.0
            && buffered_secs > self.config.min_utterance_ms as f64 / 1000.0
        {
            BoundaryReason::SilenceDetected
        } else {
            return None;
        };

        if reason == BoundaryReason::SilenceDetected && !self.has_speech {
            debug!("discarding silent buffer ({buffered_secs:.2}s, never crossed threshold)");
            self.reset();
            return None;
        }

        debug!(
            "turn boundary ({reason:?}): {buffered_secs:.2}s buffered, {:.2}s trailing silence",
            self.silence_secs
        );
        let pcm = std::mem::take(&mut self.buffer);
        self.reset();
        Some(Utterance { pcm, reason })
    }

    /// Drop buffered audio and timers, e.g. when the bot starts speaking.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.silence_secs = 0.0;
        self.has_speech = false;
    }
}
