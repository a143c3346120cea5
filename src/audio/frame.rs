//! PCM framing for the wire
//!
//! Outbound microphone audio is 16 kHz mono signed 16-bit little-endian PCM,
//! base64 encoded. Inbound model audio is the same sample format at 24 kHz.

use base64::engine::general_purpose;
use base64::Engine;
use std::time::Duration;

/// A fixed window of mono or interleaved samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let per_channel = (self.samples.len() / usize::from(self.channels)) as u64;
        Duration::from_nanos(per_channel * 1_000_000_000 / u64::from(self.sample_rate))
    }
}

/// An outbound frame ready for a realtime-input message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Base64 of the little-endian PCM bytes.
    pub data: String,
    pub mime_type: String,
    pub sample_count: usize,
}

/// Convert a float sample to 16-bit PCM: `round(sample * 32768)`, clamped.
pub fn sample_to_i16(sample: f32) -> i16 {
    let scaled = (sample * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Encode a captured frame into the wire format.
pub fn encode_frame(frame: &AudioFrame) -> EncodedFrame {
    let pcm = to_pcm16_le(frame.samples());
    EncodedFrame {
        data: general_purpose::STANDARD.encode(pcm),
        mime_type: format!("audio/pcm;rate={}", frame.sample_rate()),
        sample_count: frame.samples().len(),
    }
}

/// Decode raw little-endian PCM bytes into a playable mono frame.
///
/// A trailing odd byte cannot form a sample and is dropped.
pub fn decode_pcm16_le(bytes: &[u8], sample_rate: u32) -> AudioFrame {
    let samples = bytes
        .chunks_exact(2)
        .map(|chunk| f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / 32768.0)
        .collect();
    AudioFrame::mono(samples, sample_rate)
}
