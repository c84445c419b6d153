//! facelink-core: face pose detection and face recognition engine.
//!
//! SCRFD finds faces, a 68-point regressor places landmarks and a metric
//! network embeds aligned face chips, all on ONNX Runtime. Per-face point
//! streams are stabilized by an anti-shake smoother; embeddings are matched
//! against an in-memory identity registry.

pub mod adjust;
pub mod alignment;
pub mod config;
pub mod detector;
pub mod frame;
pub mod jitter;
pub mod landmarks;
pub mod model;
pub mod pose;
pub mod recognition;
pub mod recognizer;
pub mod registry;
pub mod render;
pub mod smoother;
pub mod training;
pub mod types;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub use config::PipelineConfig;
pub use frame::{ColorSpace, Frame, FrameError};
pub use model::{ModelError, ModelSource};
pub use pose::{FacePosePipeline, OverlapAssigner, PosePoints};
pub use recognition::{ComparedFace, EnrollOutcome, FaceCrop, FaceRecognitionPipeline};
pub use registry::{FaceRecord, IdentityRegistry, MATCH_THRESHOLD};
pub use types::{Embedding, FaceRect};

/// `$XDG_DATA_HOME/facelink/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/facelink`, falling back to `~/.local/share/facelink`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelink")
}
