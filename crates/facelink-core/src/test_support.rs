//! Model-free stand-ins for the detector, landmark predictor and embedding
//! network, used by pipeline tests.

use crate::detector::{DetectorError, FaceDetector};
use crate::landmarks::{FaceShape, LandmarkError, LandmarkPredictor, LANDMARK_COUNT};
use crate::recognizer::{EmbeddingNetwork, RecognizerError};
use crate::types::{Embedding, FaceRect};
use image::{Rgb, RgbImage};

const BRIGHT: u8 = 200;

/// Treats every horizontally separated group of bright pixels as one face.
pub struct BlobDetector;

impl FaceDetector for BlobDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRect>, DetectorError> {
        let is_bright = |p: &Rgb<u8>| p.0.iter().any(|&c| c >= BRIGHT);
        let column_extent = |x: u32| {
            let rows: Vec<u32> = (0..image.height())
                .filter(|&y| is_bright(image.get_pixel(x, y)))
                .collect();
            Some((*rows.first()?, *rows.last()?))
        };

        let mut faces = Vec::new();
        let mut current: Option<FaceRect> = None;
        for x in 0..image.width() {
            match (column_extent(x), current.as_mut()) {
                (Some((top, bottom)), Some(face)) => {
                    face.right = x as i32;
                    face.top = face.top.min(top as i32);
                    face.bottom = face.bottom.max(bottom as i32);
                }
                (Some((top, bottom)), None) => {
                    current = Some(FaceRect::new(x as i32, top as i32, x as i32, bottom as i32));
                }
                (None, _) => faces.extend(current.take()),
            }
        }
        faces.extend(current);
        Ok(faces)
    }
}

/// Always fails.
pub struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceRect>, DetectorError> {
        Err(DetectorError::InferenceFailed("broken".into()))
    }
}

/// Places the 68 points at fixed fractions of the face rectangle, with the
/// alignment anchors where a frontal face would have them.
pub struct TemplateLandmarks;

impl LandmarkPredictor for TemplateLandmarks {
    fn predict(&mut self, _image: &RgbImage, face: &FaceRect) -> Result<FaceShape, LandmarkError> {
        let w = face.width() as f32;
        let h = face.height() as f32;
        let at = |fx: f32, fy: f32| {
            (
                (face.left as f32 + fx * w).round() as i32,
                (face.top as f32 + fy * h).round() as i32,
            )
        };

        let mut points = Vec::with_capacity(LANDMARK_COUNT);
        for i in 0..LANDMARK_COUNT {
            let point = match i {
                36..=41 => at(0.3419, 0.4616),
                42..=47 => at(0.6565, 0.4598),
                30 => at(0.5002, 0.6405),
                48 => at(0.3710, 0.8247),
                54 => at(0.6315, 0.8232),
                _ => at(i as f32 / LANDMARK_COUNT as f32, 0.9),
            };
            points.push(point);
        }
        Ok(FaceShape::new(*face, points))
    }
}

/// Embeds a chip as its mean color, scaled so that distinct saturated
/// colors land well beyond the match threshold.
pub struct MeanColorNetwork;

impl EmbeddingNetwork for MeanColorNetwork {
    fn embed(&self, chip: &RgbImage) -> Result<Embedding, RecognizerError> {
        let n = (chip.width() * chip.height()) as f32;
        if n == 0.0 {
            return Err(RecognizerError::EmptyChip);
        }
        let mut sums = [0.0f32; 3];
        for p in chip.pixels() {
            for c in 0..3 {
                sums[c] += p.0[c] as f32;
            }
        }
        Ok(Embedding::new(sums.iter().map(|s| s / n / 128.0).collect()))
    }

    fn dimension(&self) -> usize {
        3
    }
}

/// Fails on every chip whose mean red channel is above one half.
pub struct RedIntolerantNetwork;

impl EmbeddingNetwork for RedIntolerantNetwork {
    fn embed(&self, chip: &RgbImage) -> Result<Embedding, RecognizerError> {
        let embedding = MeanColorNetwork.embed(chip)?;
        if embedding.values[0] > 0.5 {
            return Err(RecognizerError::InferenceFailed("red".into()));
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        MeanColorNetwork.dimension()
    }
}

/// A black frame with one filled square per `(left, top, side, color)`.
pub fn frame_with_faces(width: u32, height: u32, faces: &[(u32, u32, u32, [u8; 3])]) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    for &(left, top, side, color) in faces {
        for y in top..top + side {
            for x in left..left + side {
                image.put_pixel(x, y, Rgb(color));
            }
        }
    }
    image
}
