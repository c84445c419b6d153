use crate::adjust::Adjustment;
use crate::smoother::{DEFAULT_ANTI_SHAKE_SAMPLES, DEFAULT_JITTER_DELTA};
use serde::{Deserialize, Serialize};

/// Default number of jittered copies averaged into an enrollment embedding.
pub const DEFAULT_ENROLL_JITTER: usize = 5;

/// Per-pipeline settings. Every field can be changed between calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source color space code (0 = RGB, 1 = BGR, 2 = RGBA, 3 = YUV, 4 = Gray).
    pub color_space: i32,
    /// Uniform resize factor; values ≤ 0 disable resizing.
    pub scale_factor: f64,
    /// 0 = 90° clockwise, 1 = 180°, 2 = 90° counter-clockwise; others disable.
    pub rotation: i32,
    /// 0 = vertical, 1 = horizontal, -1 = both; others disable.
    pub flip: i32,
    /// Report rectangle corners instead of 68 landmarks.
    pub rectangle_only: bool,
    /// History capacity of each face slot's smoother.
    pub anti_shake_samples: usize,
    /// Smoother reset threshold in pixels; 0 disables resets.
    pub jitter_delta: i32,
    /// Jittered copies averaged into an enrollment embedding; 0 embeds once.
    pub enroll_jitter: usize,
    /// Upper bound on embedding workers per call; 0 means available parallelism.
    pub embedding_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            color_space: 0,
            scale_factor: -1.0,
            rotation: -1,
            flip: -2,
            rectangle_only: true,
            anti_shake_samples: DEFAULT_ANTI_SHAKE_SAMPLES,
            jitter_delta: DEFAULT_JITTER_DELTA,
            enroll_jitter: DEFAULT_ENROLL_JITTER,
            embedding_workers: 0,
        }
    }
}

impl PipelineConfig {
    pub fn adjustment(&self) -> Adjustment {
        Adjustment::from_codes(self.color_space, self.scale_factor, self.rotation, self.flip)
    }

    /// Worker count for `jobs` embedding jobs.
    pub fn worker_count(&self, jobs: usize) -> usize {
        let limit = match self.embedding_workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        jobs.min(limit).max(1)
    }
}
