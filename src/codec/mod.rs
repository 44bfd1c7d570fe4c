//! Audio transcoding between the telephony wire codecs and linear PCM.
//!
//! The telephony leg always runs at 8 kHz, carrying μ-law (PCMU), A-law
//! (PCMA), or 16-bit little-endian linear (L16) frames. STT consumes 16-bit
//! linear at the same rate; TTS produces 16-bit linear at its own source
//! rate (commonly 24 kHz), which the outbound path resamples down.

pub mod outbound;
pub mod resample;

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Sample rate of the telephony leg, in Hz.
pub const WIRE_SAMPLE_RATE: u32 = 8_000;

/// Duration of one media frame in milliseconds.
pub const FRAME_MS: u64 = 20;

/// The audio encoding used on the telephony leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    /// G.711 μ-law, 8 bits per sample.
    Pcmu,
    /// G.711 A-law, 8 bits per sample.
    Pcma,
    /// 16-bit little-endian linear PCM.
    L16,
}

impl WireCodec {
    /// Provider-facing codec name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::L16 => "L16",
        }
    }

    /// Wire bytes per second at 8 kHz.
    pub fn byte_rate(self) -> u32 {
        match self {
            Self::Pcmu | Self::Pcma => 8_000,
            Self::L16 => 16_000,
        }
    }

    /// Wire bytes in one 20 ms frame.
    pub fn frame_len(self) -> usize {
        (self.byte_rate() as u64 * FRAME_MS / 1000) as usize
    }

    /// The byte value representing silence on the wire.
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::Pcmu => 0xFF,
            Self::Pcma => 0xD5,
            Self::L16 => 0x00,
        }
    }

    /// One 20 ms frame of silence.
    pub fn silence_frame(self) -> Vec<u8> {
        vec![self.silence_byte(); self.frame_len()]
    }

    /// Encode 16-bit linear PCM bytes (little-endian) to this codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer has an odd length.
    pub fn encode(self, pcm: &[u8]) -> Result<Vec<u8>> {
        if pcm.len() % 2 != 0 {
            return Err(BridgeError::Codec(format!(
                "odd-length PCM buffer: {} bytes",
                pcm.len()
            )));
        }
        match self {
            Self::L16 => Ok(pcm.to_vec()),
            Self::Pcmu => Ok(samples(pcm).map(linear_to_ulaw).collect()),
            Self::Pcma => Ok(samples(pcm).map(linear_to_alaw).collect()),
        }
    }

    /// Decode wire bytes to 16-bit linear PCM bytes (little-endian).
    pub fn decode(self, wire: &[u8]) -> Vec<u8> {
        match self {
            Self::L16 => wire.to_vec(),
            Self::Pcmu => wire
                .iter()
                .flat_map(|&b| ulaw_to_linear(b).to_le_bytes())
                .collect(),
            Self::Pcma => wire
                .iter()
                .flat_map(|&b| alaw_to_linear(b).to_le_bytes())
                .collect(),
        }
    }
}

/// Iterate a little-endian PCM byte buffer as i16 samples.
fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]))
}

/// RMS energy of a 16-bit little-endian PCM buffer.
pub fn rms(pcm: &[u8]) -> f64 {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for s in samples(pcm) {
        let v = f64::from(s);
        sum += v * v;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

const ULAW_BIAS: i32 = 0x84;
const G711_CLIP: i32 = 32_635;

/// G.711 μ-law compression of one sample.
fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > G711_CLIP {
        pcm = G711_CLIP;
    }
    pcm += ULAW_BIAS;

    // Segment = position of the highest set bit above bit 7.
    let mut exponent = 7;
    while exponent > 0 && pcm & (1 << (exponent + 7)) == 0 {
        exponent -= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// G.711 μ-law expansion of one byte.
fn ulaw_to_linear(byte: u8) -> i16 {
    let u = i32::from(!byte);
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// G.711 A-law compression of one sample.
fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm >= 0 { 0x80 } else { 0x00 };
    if sign == 0 {
        pcm = -pcm;
    }
    if pcm > G711_CLIP {
        pcm = G711_CLIP;
    }

    let compressed = if pcm >= 256 {
        let mut exponent = 6;
        while exponent > 0 && pcm & (1 << (exponent + 8)) == 0 {
            exponent -= 1;
        }
        let mantissa = (pcm >> (exponent + 4)) & 0x0F;
        ((exponent + 1) << 4) | mantissa
    } else {
        pcm >> 4
    };
    ((compressed ^ sign) ^ 0x55) as u8
}

/// G.711 A-law expansion of one byte.
fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let segment = (a >> 4) & 0x07;
    let mantissa = i32::from(a & 0x0F);
    let magnitude = if segment == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (segment - 1)
    };
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_pcm(amplitude: f64, samples: usize) -> Vec<u8> {
        // 1 kHz tone at the wire rate.
        (0..samples)
            .flat_map(|i| {
                let t = i as f64 / f64::from(WIRE_SAMPLE_RATE);
                let v = (amplitude * (2.0 * std::f64::consts::PI * 1000.0 * t).sin()) as i16;
                v.to_le_bytes()
            })
            .collect()
    }

    fn max_error(original: &[u8], decoded: &[u8]) -> i32 {
        original
            .chunks_exact(2)
            .zip(decoded.chunks_exact(2))
            .map(|(a, b)| {
                let a = i32::from(i16::from_le_bytes([a[0], a[1]]));
                let b = i32::from(i16::from_le_bytes([b[0], b[1]]));
                (a - b).abs()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn ulaw_round_trip_within_quantization_error() {
        let pcm = tone_pcm(8_000.0, 800);
        let wire = WireCodec::Pcmu.encode(&pcm).expect("encode");
        assert_eq!(wire.len(), pcm.len() / 2);
        let back = WireCodec::Pcmu.decode(&wire);
        assert_eq!(back.len(), pcm.len());
        // Top segment for this amplitude has a 256-unit step.
        assert!(max_error(&pcm, &back) <= 256, "error {}", max_error(&pcm, &back));
    }

    #[test]
    fn alaw_round_trip_within_quantization_error() {
        let pcm = tone_pcm(8_000.0, 800);
        let wire = WireCodec::Pcma.encode(&pcm).expect("encode");
        let back = WireCodec::Pcma.decode(&wire);
        assert!(max_error(&pcm, &back) <= 512, "error {}", max_error(&pcm, &back));
    }

    #[test]
    fn l16_round_trip_is_lossless() {
        let pcm = tone_pcm(12_000.0, 320);
        let wire = WireCodec::L16.encode(&pcm).expect("encode");
        assert_eq!(wire, pcm);
        assert_eq!(WireCodec::L16.decode(&wire), pcm);
    }

    #[test]
    fn silence_bytes_decode_to_near_zero() {
        assert_eq!(ulaw_to_linear(0xFF), 0);
        // A-law has no true zero; 0xD5 decodes to the smallest magnitude.
        assert_eq!(alaw_to_linear(0xD5).abs(), 8);
    }

    #[test]
    fn ulaw_extremes_survive() {
        for s in [i16::MIN, -32_635, -1, 0, 1, 32_635, i16::MAX] {
            let decoded = ulaw_to_linear(linear_to_ulaw(s));
            assert!((i32::from(s) - i32::from(decoded)).abs() <= 1_024, "sample {s}");
        }
    }

    #[test]
    fn encode_rejects_odd_buffer() {
        assert!(WireCodec::Pcmu.encode(&[0, 1, 2]).is_err());
    }

    #[test]
    fn frame_geometry() {
        assert_eq!(WireCodec::Pcmu.frame_len(), 160);
        assert_eq!(WireCodec::Pcma.frame_len(), 160);
        assert_eq!(WireCodec::L16.frame_len(), 320);
        assert_eq!(WireCodec::Pcmu.silence_frame()[0], 0xFF);
        assert_eq!(WireCodec::Pcma.silence_frame()[0], 0xD5);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0u8; 320]), 0.0);
        let pcm = tone_pcm(8_000.0, 160);
        assert!(rms(&pcm) > 500.0);
    }
}
