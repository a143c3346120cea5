//! Input level meter for visualization

/// Root mean square of a block of samples. Empty blocks are silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Maps frame RMS to a bounded visualization level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMeter {
    scale: f32,
    max_level: f32,
}

impl LevelMeter {
    pub fn new(scale: f32, max_level: f32) -> Self {
        Self { scale, max_level }
    }

    /// `min(rms * scale, max_level)`
    pub fn level(&self, samples: &[f32]) -> f32 {
        (rms(samples) * self.scale).min(self.max_level)
    }
}
