use anyhow::{Context, Result};
use facelink_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: an optional TOML file, then `FACELINK_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub landmark_model: String,
    pub embedding_model: String,
    /// JSON file holding enrolled identities.
    pub registry_path: PathBuf,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: facelink_core::default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            landmark_model: "landmarks_68.onnx".to_string(),
            embedding_model: "face_metric_128.onnx".to_string(),
            registry_path: facelink_core::data_dir().join("registry.json"),
            intra_threads: 2,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load `$FACELINK_CONFIG` (default `<data dir>/facelink.toml`) if it
    /// exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("FACELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facelink_core::data_dir().join("facelink.toml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACELINK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("FACELINK_DETECTOR_MODEL") {
            self.detector_model = name;
        }
        if let Ok(name) = std::env::var("FACELINK_LANDMARK_MODEL") {
            self.landmark_model = name;
        }
        if let Ok(name) = std::env::var("FACELINK_EMBEDDING_MODEL") {
            self.embedding_model = name;
        }
        if let Ok(path) = std::env::var("FACELINK_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(path);
        }
        self.intra_threads = env_usize("FACELINK_INTRA_THREADS", self.intra_threads);
        self.pipeline.anti_shake_samples =
            env_usize("FACELINK_ANTI_SHAKE_SAMPLES", self.pipeline.anti_shake_samples);
        self.pipeline.jitter_delta = env_i32("FACELINK_JITTER_DELTA", self.pipeline.jitter_delta);
        self.pipeline.enroll_jitter = env_usize("FACELINK_ENROLL_JITTER", self.pipeline.enroll_jitter);
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.landmark_model)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
