//! Engine configuration
//!
//! Tuning values for capture, playback and tool logging. The level-meter
//! scaling and the drain guard margin are empirical and kept adjustable.

use serde::Deserialize;
use std::time::Duration;

/// Sample rate of outbound microphone frames.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of inbound model audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture frame (~256 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Configuration for the voice engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub capture_frame_samples: usize,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    /// Multiplier applied to frame RMS before clamping to `max_level`.
    pub level_scale: f32,
    pub max_level: f32,
    /// Extra wait after the last scheduled buffer ends before listening again.
    pub drain_guard_ms: u64,
    /// Upper bound on waiting for the microphone (covers a permission prompt).
    pub mic_acquire_timeout_ms: u64,
    pub recent_actions_capacity: usize,
    /// Keep streaming microphone frames while the model speaks so the
    /// server can detect barge-in.
    pub stream_while_speaking: bool,
    pub capture_channel_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_frame_samples: CAPTURE_FRAME_SAMPLES,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            level_scale: 10.0,
            max_level: 1.0,
            drain_guard_ms: 200,
            mic_acquire_timeout_ms: 30_000,
            recent_actions_capacity: 5,
            stream_while_speaking: true,
            capture_channel_depth: 32,
        }
    }
}

impl EngineConfig {
    pub fn drain_guard(&self) -> Duration {
        Duration::from_millis(self.drain_guard_ms)
    }

    pub fn mic_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.mic_acquire_timeout_ms)
    }
}
