//! Face embeddings: the `EmbeddingNetwork` seam and an ONNX metric network.
//!
//! The network maps a 150×150 RGB face chip to a 128-dimensional vector in
//! which faces of the same person lie within Euclidean distance 0.6.

use crate::alignment::FACE_CHIP_SIZE;
use crate::model::{load_session, ModelError, ModelSource};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

pub const EMBEDDING_DIM: usize = 128;

const METRIC_MEAN: f32 = 127.5;
const METRIC_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding network not loaded")]
    NotLoaded,
    #[error("face chip is empty")]
    EmptyChip,
    #[error("face rect is degenerate")]
    DegenerateFace,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps face chips to embeddings. Shared across worker threads.
pub trait EmbeddingNetwork: Send + Sync {
    fn embed(&self, chip: &RgbImage) -> Result<Embedding, RecognizerError>;

    /// Length of every embedding this network produces.
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Element-wise mean of the embeddings of `chips`.
    fn embed_mean(&self, chips: &[RgbImage]) -> Result<Embedding, RecognizerError> {
        let embeddings = chips
            .iter()
            .map(|chip| self.embed(chip))
            .collect::<Result<Vec<_>, _>>()?;
        Embedding::mean(&embeddings).ok_or(RecognizerError::EmptyChip)
    }
}

/// ONNX metric network with a small pool of sessions so concurrent callers
/// do not serialize on one session.
pub struct OnnxEmbeddingNetwork {
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
}

impl OnnxEmbeddingNetwork {
    /// Load `pool_size` sessions of the same model.
    pub fn load(
        source: &ModelSource,
        intra_threads: usize,
        pool_size: usize,
    ) -> Result<Self, RecognizerError> {
        let sessions = (0..pool_size.max(1))
            .map(|_| load_session(source, intra_threads).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(sessions = sessions.len(), "metric network ready");
        Ok(Self {
            sessions,
            next: AtomicUsize::new(0),
        })
    }

    /// Preprocess a chip into a normalized NCHW tensor, resizing if needed.
    fn preprocess(chip: &RgbImage) -> Array4<f32> {
        let size = FACE_CHIP_SIZE;
        let resized;
        let chip = if chip.dimensions() == (size, size) {
            chip
        } else {
            resized = imageops::resize(chip, size, size, FilterType::Triangle);
            &resized
        };

        let s = size as usize;
        Array4::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
            (chip.get_pixel(x as u32, y as u32).0[c] as f32 - METRIC_MEAN) / METRIC_STD
        })
    }
}

impl EmbeddingNetwork for OnnxEmbeddingNetwork {
    fn embed(&self, chip: &RgbImage) -> Result<Embedding, RecognizerError> {
        if chip.width() == 0 || chip.height() == 0 {
            return Err(RecognizerError::EmptyChip);
        }
        let input = Self::preprocess(chip);

        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[slot]
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}
