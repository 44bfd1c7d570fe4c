//! Outbound transcoding: framed TTS audio → wire-codec blocks.
//!
//! The synthesis backend streams a WAV byte stream: a fixed 44-byte header
//! carrying the source sample rate, then raw 16-bit little-endian PCM. The
//! encoder parses the header once, accumulates PCM into fixed-size blocks,
//! resamples each block down to the 8 kHz wire rate with state carried
//! across blocks, and compresses to the active wire codec.

use super::resample::StreamResampler;
use super::{WIRE_SAMPLE_RATE, WireCodec};
use crate::error::{BridgeError, Result};
use tracing::warn;

/// Length of the RIFF/WAVE header prefix on the synthesis stream.
pub const WAV_HEADER_LEN: usize = 44;

/// Byte offset of the little-endian u32 sample rate within the header.
const SAMPLE_RATE_OFFSET: usize = 24;

/// PCM bytes accumulated before each resample/encode step. Divisible by the
/// 2-byte sample width so no block ever splits a sample.
pub const BLOCK_SIZE: usize = 960;

/// Source rate assumed when the header cannot be parsed.
const DEFAULT_SOURCE_RATE: u32 = 24_000;

/// Streaming encoder for the TTS → wire direction.
pub struct OutboundEncoder {
    codec: WireCodec,
    header: Vec<u8>,
    header_parsed: bool,
    source_rate: u32,
    pcm: Vec<u8>,
    resampler: Option<StreamResampler>,
}

impl OutboundEncoder {
    /// Create an encoder targeting the given wire codec.
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            header: Vec::with_capacity(WAV_HEADER_LEN),
            header_parsed: false,
            source_rate: DEFAULT_SOURCE_RATE,
            pcm: Vec::new(),
            resampler: None,
        }
    }

    /// Source sample rate detected from the stream header.
    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Feed a chunk of the synthesis stream. Returns zero or more encoded
    /// wire blocks. A block that fails to convert is dropped and logged;
    /// the stream continues.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut data = chunk;
        if !self.header_parsed {
            let need = WAV_HEADER_LEN - self.header.len();
            let take = need.min(data.len());
            self.header.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.header.len() < WAV_HEADER_LEN {
                return Vec::new();
            }
            self.parse_header();
        }
        self.pcm.extend_from_slice(data);

        let mut out = Vec::new();
        while self.pcm.len() >= BLOCK_SIZE {
            let block: Vec<u8> = self.pcm.drain(..BLOCK_SIZE).collect();
            match self.convert(&block) {
                Ok(encoded) if !encoded.is_empty() => out.push(encoded),
                Ok(_) => {}
                Err(e) => warn!("dropping outbound block: {e}"),
            }
        }
        out
    }

    /// Flush any buffered partial block at end-of-stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if !self.header_parsed || self.pcm.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.pcm);
        if rest.len() % 2 != 0 {
            warn!("trailing half-sample at end of synthesis stream; dropping one byte");
            rest.pop();
        }
        match self.convert(&rest) {
            Ok(encoded) if !encoded.is_empty() => Some(encoded),
            Ok(_) => None,
            Err(e) => {
                warn!("dropping final outbound block: {e}");
                None
            }
        }
    }

    fn parse_header(&mut self) {
        self.header_parsed = true;
        if &self.header[..4] == b"RIFF" {
            let rate_bytes: [u8; 4] = self.header[SAMPLE_RATE_OFFSET..SAMPLE_RATE_OFFSET + 4]
                .try_into()
                .expect("fixed-width slice");
            let rate = u32::from_le_bytes(rate_bytes);
            if (8_000..=96_000).contains(&rate) {
                self.source_rate = rate;
            } else {
                warn!(
                    "implausible sample rate {rate} in synthesis header; using {DEFAULT_SOURCE_RATE}"
                );
            }
        } else {
            warn!(
                "synthesis stream missing RIFF header; assuming raw PCM at {DEFAULT_SOURCE_RATE} Hz"
            );
            // Whatever we buffered is audio, not a header.
            let buffered = std::mem::take(&mut self.header);
            self.pcm.extend_from_slice(&buffered);
        }
        if self.source_rate != WIRE_SAMPLE_RATE {
            self.resampler = Some(StreamResampler::new(self.source_rate, WIRE_SAMPLE_RATE));
        }
    }

    fn convert(&mut self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() % 2 != 0 {
            return Err(BridgeError::Codec(format!(
                "odd-length block: {} bytes",
                block.len()
            )));
        }
        let pcm_bytes = match self.resampler.as_mut() {
            Some(rs) => {
                let samples: Vec<i16> = block
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                rs.process(&samples)
                    .into_iter()
                    .flat_map(i16::to_le_bytes)
                    .collect()
            }
            None => block.to_vec(),
        };
        self.codec.encode(&pcm_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_header(rate: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(WAV_HEADER_LEN);
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&0u32.to_le_bytes());
        h.extend_from_slice(b"WAVEfmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&rate.to_le_bytes());
        h.extend_from_slice(&(rate * 2).to_le_bytes());
        h.extend_from_slice(&2u16.to_le_bytes());
        h.extend_from_slice(&16u16.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(h.len(), WAV_HEADER_LEN);
        h
    }

    fn tone_bytes(rate: u32, samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let t = i as f64 / f64::from(rate);
                let v = (9_000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16;
                v.to_le_bytes()
            })
            .collect()
    }

    #[test]
    fn detects_source_rate_and_downsamples() {
        let mut enc = OutboundEncoder::new(WireCodec::Pcmu);
        let mut stream = wav_header(24_000);
        stream.extend(tone_bytes(24_000, 2_400)); // 100ms

        let mut blocks = Vec::new();
        // Deliberately awkward chunking across the header boundary.
        for chunk in stream.chunks(700) {
            blocks.extend(enc.push(chunk));
        }
        if let Some(last) = enc.finish() {
            blocks.push(last);
        }

        assert_eq!(enc.source_rate(), 24_000);
        let total: usize = blocks.iter().map(Vec::len).sum();
        // 100ms at 8kHz μ-law is 800 bytes, minus resampler edge effects.
        assert!((790..=800).contains(&total), "total {total}");
        // Full blocks are one 20ms wire frame each.
        assert_eq!(blocks[0].len(), 160);
    }

    #[test]
    fn l16_at_wire_rate_is_passthrough() {
        let mut enc = OutboundEncoder::new(WireCodec::L16);
        let pcm = tone_bytes(8_000, 480);
        let mut stream = wav_header(8_000);
        stream.extend(&pcm);

        let mut out = Vec::new();
        for block in enc.push(&stream) {
            out.extend(block);
        }
        if let Some(last) = enc.finish() {
            out.extend(last);
        }
        assert_eq!(out, pcm);
    }

    #[test]
    fn missing_riff_header_falls_back_to_raw_pcm() {
        let mut enc = OutboundEncoder::new(WireCodec::L16);
        let pcm = tone_bytes(24_000, 2_400);
        let mut out = Vec::new();
        for block in enc.push(&pcm) {
            out.extend(block);
        }
        if let Some(last) = enc.finish() {
            out.extend(last);
        }
        assert_eq!(enc.source_rate(), 24_000);
        // Downsampled 3:1 from the assumed default rate.
        assert!(out.len() >= 1_580 && out.len() <= 1_600, "len {}", out.len());
    }

    #[test]
    fn short_stream_without_full_header_yields_nothing() {
        let mut enc = OutboundEncoder::new(WireCodec::Pcmu);
        assert!(enc.push(&[0u8; 20]).is_empty());
        assert!(enc.finish().is_none());
    }

    #[test]
    fn remainder_is_flushed_not_dropped() {
        let mut enc = OutboundEncoder::new(WireCodec::Pcmu);
        let mut stream = wav_header(8_000);
        stream.extend(tone_bytes(8_000, 500)); // 1000 bytes: one block + 40 bytes
        let blocks = enc.push(&stream);
        assert_eq!(blocks.len(), 1);
        let tail = enc.finish().expect("remainder");
        assert_eq!(tail.len(), 20);
    }
}
