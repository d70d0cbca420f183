use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Root-mean-square of one capture block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    energy.sqrt()
}

/// Maps a block RMS to the host-facing level in [0, 1].
pub fn level_from_rms(rms: f32, gain: f32) -> f32 {
    let level = rms * gain;
    if level.is_nan() {
        return 0.0;
    }
    level.clamp(0.0, 1.0)
}

/// Latest input level, written from the capture thread and read by the host.
#[derive(Clone, Debug)]
pub struct LevelMeter {
    level_bits: Arc<AtomicU32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    pub fn set(&self, level: f32) {
        self.level_bits.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Measures a block and publishes its level.
    pub fn observe(&self, block: &[f32], gain: f32) -> f32 {
        let level = level_from_rms(rms(block), gain);
        self.set(level);
        level
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}
