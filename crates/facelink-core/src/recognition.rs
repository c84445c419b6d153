//! Face recognition pipeline: face chips, embeddings, matching against the
//! identity registry, and enrollment.

use crate::adjust::adjust;
use crate::alignment::{extract_face_chip, FACE_CHIP_PADDING, FACE_CHIP_SIZE};
use crate::config::PipelineConfig;
use crate::detector::{DetectorError, FaceDetector, ScrfdDetector};
use crate::frame::Frame;
use crate::jitter::jitter_copies;
use crate::landmarks::{LandmarkError, LandmarkPredictor, OnnxLandmarkPredictor};
use crate::model::ModelSource;
use crate::pose::encode_or_empty;
use crate::recognizer::{EmbeddingNetwork, OnnxEmbeddingNetwork, RecognizerError, EMBEDDING_DIM};
use crate::registry::{FaceRecord, IdentityRegistry, Probe, RegistryError};
use crate::types::{Embedding, FaceRect};
use image::RgbImage;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Upper bound on metric network sessions held by one pipeline.
pub const MAX_NETWORK_SESSIONS: usize = 4;

/// An aligned face chip and the rectangle it was cut from.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub crop: RgbImage,
    pub rect: FaceRect,
}

/// A registry identity recognized in a frame.
#[derive(Debug, Clone)]
pub struct ComparedFace {
    /// The matched face chip, BMP-encoded.
    pub crop_bmp: Vec<u8>,
    pub rect: FaceRect,
    pub name: String,
    pub distance: f32,
}

/// Result of a successful [`FaceRecognitionPipeline::enroll`].
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub crop_bmp: Vec<u8>,
    pub rect: FaceRect,
    /// The enrolled name, or the existing identity's name when the face was
    /// already known.
    pub name: String,
    pub already_exists: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Embed one face chip.
///
/// With `jitter_iterations > 0` the result is the mean over that many
/// jittered copies; otherwise the chip is embedded once as is.
pub fn embed_crop(
    network: &dyn EmbeddingNetwork,
    face: &FaceCrop,
    jitter_iterations: usize,
) -> Result<Embedding, RecognizerError> {
    if face.crop.width() == 0 || face.crop.height() == 0 {
        return Err(RecognizerError::EmptyChip);
    }
    if face.rect.is_empty() {
        return Err(RecognizerError::DegenerateFace);
    }

    if jitter_iterations == 0 {
        return network.embed(&face.crop);
    }
    let copies = jitter_copies(&face.crop, jitter_iterations, &mut rand::thread_rng());
    network.embed_mean(&copies)
}

/// Single-pass embeddings of `faces` on at most `workers` threads.
///
/// A face whose embedding fails is logged and yields `None`; the other
/// faces still proceed.
pub fn embed_all(network: &dyn EmbeddingNetwork, faces: &[FaceCrop], workers: usize) -> Vec<Option<Embedding>> {
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    for index in 0..faces.len() {
        let _ = job_tx.send(index);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, faces.len().max(1)) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for index in job_rx.iter() {
                    let _ = result_tx.send((index, embed_crop(network, &faces[index], 0)));
                }
            });
        }
    });
    drop(result_tx);

    let mut embeddings = vec![None; faces.len()];
    for (index, result) in result_rx.iter() {
        match result {
            Ok(embedding) => embeddings[index] = Some(embedding),
            Err(err) => tracing::warn!(face = index, error = %err, "embedding failed, face skipped"),
        }
    }
    embeddings
}

pub struct FaceRecognitionPipeline {
    config: PipelineConfig,
    detector: Option<Mutex<Box<dyn FaceDetector>>>,
    predictor: Option<Mutex<Box<dyn LandmarkPredictor>>>,
    network: Option<Arc<dyn EmbeddingNetwork>>,
    registry: Mutex<IdentityRegistry>,
}

impl FaceRecognitionPipeline {
    /// A pipeline with no models and an empty registry.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: None,
            predictor: None,
            network: None,
            registry: Mutex::new(IdentityRegistry::new()),
        }
    }

    pub fn with_models(
        config: PipelineConfig,
        detector: Box<dyn FaceDetector>,
        predictor: Box<dyn LandmarkPredictor>,
        network: Arc<dyn EmbeddingNetwork>,
    ) -> Self {
        let mut pipeline = Self::new(config);
        pipeline.detector = Some(Mutex::new(detector));
        pipeline.predictor = Some(Mutex::new(predictor));
        pipeline.network = Some(network);
        pipeline
    }

    pub fn load_detector(&mut self, source: &ModelSource, intra_threads: usize) -> Result<(), DetectorError> {
        let detector = ScrfdDetector::load(source, intra_threads)?;
        self.detector = Some(Mutex::new(Box::new(detector)));
        Ok(())
    }

    pub fn load_predictor(&mut self, source: &ModelSource, intra_threads: usize) -> Result<(), LandmarkError> {
        let predictor = OnnxLandmarkPredictor::load(source, intra_threads)?;
        self.predictor = Some(Mutex::new(Box::new(predictor)));
        Ok(())
    }

    /// Load the metric network with one session per embedding worker, up
    /// to [`MAX_NETWORK_SESSIONS`].
    pub fn load_network(&mut self, source: &ModelSource, intra_threads: usize) -> Result<(), RecognizerError> {
        let pool = self.config.worker_count(MAX_NETWORK_SESSIONS);
        self.network = Some(Arc::new(OnnxEmbeddingNetwork::load(source, intra_threads, pool)?));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_some() && self.predictor.is_some() && self.network.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn set_color_space(&mut self, code: i32) {
        self.config.color_space = code;
    }

    pub fn set_scale_factor(&mut self, scale_factor: f64) {
        self.config.scale_factor = scale_factor;
    }

    pub fn set_rotation(&mut self, code: i32) {
        self.config.rotation = code;
    }

    pub fn set_flip(&mut self, code: i32) {
        self.config.flip = code;
    }

    pub fn set_enroll_jitter(&mut self, iterations: usize) {
        self.config.enroll_jitter = iterations;
    }

    /// Exclusive access to the registry.
    pub fn registry(&self) -> MutexGuard<'_, IdentityRegistry> {
        lock(&self.registry)
    }

    /// Replace the registry with the identities stored at `path`. Embeddings
    /// must match the loaded network's dimension, or [`EMBEDDING_DIM`] when
    /// no network is loaded.
    pub fn load_registry(&self, path: &Path) -> Result<usize, RegistryError> {
        let dimension = self.network.as_ref().map_or(EMBEDDING_DIM, |n| n.dimension());
        let loaded = IdentityRegistry::load(path, dimension)?;
        let count = loaded.len();
        *lock(&self.registry) = loaded;
        Ok(count)
    }

    pub fn save_registry(&self, path: &Path) -> Result<(), RegistryError> {
        lock(&self.registry).save(path)
    }

    /// Adjust `frame`, detect faces and cut an aligned chip for each.
    ///
    /// Faces whose landmarks fail are skipped. Without models the result
    /// is empty.
    pub fn detect_faces(&self, frame: &mut Frame) -> Vec<FaceCrop> {
        let (Some(detector), Some(predictor)) = (&self.detector, &self.predictor) else {
            tracing::debug!("recognition pipeline has no models, skipping detection");
            return Vec::new();
        };

        adjust(frame, &self.config.adjustment());
        if frame.is_empty() {
            return Vec::new();
        }
        let rgb = frame.to_rgb();

        let rects = match lock(detector).detect(&rgb) {
            Ok(rects) => rects,
            Err(err) => {
                tracing::warn!(error = %err, "face detection failed");
                return Vec::new();
            }
        };

        let mut predictor = lock(predictor);
        let faces: Vec<FaceCrop> = rects
            .into_iter()
            .filter_map(|rect| {
                let shape = predictor
                    .predict(&rgb, &rect)
                    .map_err(|err| tracing::warn!(error = %err, "landmark prediction failed"))
                    .ok()?;
                let crop = extract_face_chip(&rgb, &shape, FACE_CHIP_SIZE, FACE_CHIP_PADDING)?;
                Some(FaceCrop { crop, rect })
            })
            .collect();

        tracing::debug!(faces = faces.len(), "recognition detection");
        faces
    }

    /// Embed one face; see [`embed_crop`].
    pub fn embed(&self, face: &FaceCrop, jitter_iterations: usize) -> Result<Embedding, RecognizerError> {
        let network = self.network.as_ref().ok_or(RecognizerError::NotLoaded)?;
        embed_crop(network.as_ref(), face, jitter_iterations)
    }

    /// Match `faces` against `registry` with single-pass embeddings.
    ///
    /// Returns the number of registry entries matched.
    pub fn match_faces(&self, registry: &mut IdentityRegistry, faces: &[FaceCrop]) -> usize {
        let Some(network) = &self.network else {
            registry.clear_matches();
            return 0;
        };
        let workers = self.config.worker_count(faces.len());
        let embeddings = embed_all(network.as_ref(), faces, workers);

        let probes: Vec<Probe> = faces
            .iter()
            .zip(embeddings)
            .map(|(face, embedding)| Probe {
                crop: face.crop.clone(),
                rect: face.rect,
                embedding,
            })
            .collect();
        registry.match_probes(&probes)
    }

    /// Append an identity for `face` using its jittered embedding.
    pub fn enroll_face(
        &self,
        registry: &mut IdentityRegistry,
        face: &FaceCrop,
        name: &str,
        jitter_iterations: usize,
    ) -> Result<(), RecognizerError> {
        let embedding = self.embed(face, jitter_iterations)?;
        registry.enroll(name, face.crop.clone(), face.rect, embedding);
        Ok(())
    }

    /// Recognize enrolled identities in `frame`.
    ///
    /// Returns one entry per identity matched in this frame.
    pub fn compare(&self, frame: &mut Frame) -> Vec<ComparedFace> {
        let faces = self.detect_faces(frame);
        let mut registry = lock(&self.registry);
        if faces.is_empty() {
            registry.clear_matches();
            return Vec::new();
        }

        self.match_faces(&mut registry, &faces);
        registry
            .matched()
            .map(|record| ComparedFace {
                crop_bmp: encode_crop(&record.crop),
                rect: record.rect,
                name: record.name.clone(),
                distance: record.distance.unwrap_or_default(),
            })
            .collect()
    }

    /// Enroll the single face in `frame` under `name`.
    ///
    /// Returns `None` unless the frame holds exactly one face. If the face
    /// already matches an identity, nothing is added and the existing name
    /// is returned with `already_exists` set.
    pub fn enroll(&self, frame: &mut Frame, name: &str) -> Option<EnrollOutcome> {
        let faces = self.detect_faces(frame);
        if faces.len() != 1 {
            tracing::info!(faces = faces.len(), "enrollment needs exactly one face");
            return None;
        }
        let face = &faces[0];

        let mut registry = lock(&self.registry);
        if self.match_faces(&mut registry, &faces) > 0 {
            let existing: &FaceRecord = registry.matched().next()?;
            tracing::info!(name = %existing.name, "face already enrolled");
            return Some(EnrollOutcome {
                crop_bmp: encode_crop(&face.crop),
                rect: face.rect,
                name: existing.name.clone(),
                already_exists: true,
            });
        }

        if let Err(err) = self.enroll_face(&mut registry, face, name, self.config.enroll_jitter) {
            tracing::warn!(error = %err, "enrollment embedding failed");
            return None;
        }
        Some(EnrollOutcome {
            crop_bmp: encode_crop(&face.crop),
            rect: face.rect,
            name: name.to_string(),
            already_exists: false,
        })
    }

    /// Apply the configured adjustment and return the frame as BMP.
    pub fn adjust_and_encode(&self, frame: &mut Frame) -> Vec<u8> {
        adjust(frame, &self.config.adjustment());
        encode_or_empty(frame)
    }
}

fn encode_crop(crop: &RgbImage) -> Vec<u8> {
    encode_or_empty(&Frame::from_rgb(crop.clone()))
}
