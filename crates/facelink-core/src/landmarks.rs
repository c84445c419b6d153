//! 68-point facial landmark prediction.
//!
//! Points follow the iBUG 300-W ordering: jaw, eyebrows, nose, eyes, lips.

use crate::model::{load_session, ModelError, ModelSource};
use crate::types::FaceRect;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::Range;
use thiserror::Error;

/// Number of landmark points per face.
pub const LANDMARK_COUNT: usize = 68;

const LANDMARK_INPUT_SIZE: u32 = 112;
/// Face rect enlargement before cropping the model input.
const LANDMARK_CROP_SCALE: f32 = 1.2;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face rect {0:?} does not intersect the frame")]
    OutOfFrame(FaceRect),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Facial regions drawn as polylines, in 68-point index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkRegion {
    Jaw,
    RightEyebrow,
    LeftEyebrow,
    NoseBridge,
    LowerNose,
    RightEye,
    LeftEye,
    OuterLip,
    InnerLip,
}

impl LandmarkRegion {
    pub const ALL: [LandmarkRegion; 9] = [
        Self::Jaw,
        Self::RightEyebrow,
        Self::LeftEyebrow,
        Self::NoseBridge,
        Self::LowerNose,
        Self::RightEye,
        Self::LeftEye,
        Self::OuterLip,
        Self::InnerLip,
    ];

    /// Point indices covered by the region. The lower nose starts at the
    /// nose tip (30), which it shares with the bridge.
    pub fn indices(self) -> Range<usize> {
        match self {
            Self::Jaw => 0..17,
            Self::RightEyebrow => 17..22,
            Self::LeftEyebrow => 22..27,
            Self::NoseBridge => 27..31,
            Self::LowerNose => 30..36,
            Self::RightEye => 36..42,
            Self::LeftEye => 42..48,
            Self::OuterLip => 48..60,
            Self::InnerLip => 60..68,
        }
    }

    /// Whether the last point connects back to the first.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::LowerNose | Self::RightEye | Self::LeftEye | Self::OuterLip | Self::InnerLip
        )
    }
}

/// A face rectangle with its 68 landmark points.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceShape {
    pub rect: FaceRect,
    pub points: Vec<(i32, i32)>,
}

impl FaceShape {
    pub fn new(rect: FaceRect, points: Vec<(i32, i32)>) -> Self {
        Self { rect, points }
    }

    pub fn is_complete(&self) -> bool {
        self.points.len() == LANDMARK_COUNT
    }

    /// Interleaved `[x0, y0, x1, y1, ...]`.
    pub fn flatten(&self) -> Vec<i32> {
        self.points.iter().flat_map(|&(x, y)| [x, y]).collect()
    }

    pub fn point(&self, index: usize) -> Option<(i32, i32)> {
        self.points.get(index).copied()
    }

    /// Mean position of the points in `range`.
    pub fn centroid(&self, range: Range<usize>) -> Option<(f32, f32)> {
        let points = self.points.get(range)?;
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), &(x, y)| (sx + x as f32, sy + y as f32));
        Some((sx / n, sy / n))
    }
}

/// Predicts landmark points for a detected face.
pub trait LandmarkPredictor: Send {
    fn predict(&mut self, image: &RgbImage, face: &FaceRect) -> Result<FaceShape, LandmarkError>;
}

/// Square crop around `face`, enlarged by `scale` and clipped to the frame.
///
/// Returns `(x, y, side_w, side_h)` in frame coordinates.
fn crop_region(face: &FaceRect, scale: f32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let (cx, cy) = face.center();
    let side = face.width().max(face.height()) as f32 * scale;
    let half = side / 2.0;

    let x0 = (cx - half).round().max(0.0) as u32;
    let y0 = (cy - half).round().max(0.0) as u32;
    let x1 = ((cx + half).round().max(0.0) as u32).min(width);
    let y1 = ((cy + half).round().max(0.0) as u32).min(height);

    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

/// ONNX landmark regressor: 112×112 RGB crop in, 136 normalized coordinates out.
pub struct OnnxLandmarkPredictor {
    session: Session,
}

impl OnnxLandmarkPredictor {
    pub fn load(source: &ModelSource, intra_threads: usize) -> Result<Self, LandmarkError> {
        let session = load_session(source, intra_threads)?;
        Ok(Self { session })
    }
}

impl LandmarkPredictor for OnnxLandmarkPredictor {
    fn predict(&mut self, image: &RgbImage, face: &FaceRect) -> Result<FaceShape, LandmarkError> {
        let (x, y, w, h) = crop_region(face, LANDMARK_CROP_SCALE, image.width(), image.height())
            .ok_or(LandmarkError::OutOfFrame(*face))?;

        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let input_img = imageops::resize(
            &crop,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
            FilterType::Triangle,
        );

        let size = LANDMARK_INPUT_SIZE as usize;
        let input = Array4::from_shape_fn((1, 3, size, size), |(_, c, py, px)| {
            input_img.get_pixel(px as u32, py as u32).0[c] as f32 / 255.0
        });

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, coords) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmarks: {e}")))?;

        if coords.len() < LANDMARK_COUNT * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_COUNT * 2,
                coords.len()
            )));
        }

        Ok(FaceShape::new(*face, denormalize(coords, (x, y, w, h))))
    }
}

/// Map normalized `[0, 1]` crop coordinates back to frame pixels.
fn denormalize(coords: &[f32], (x, y, w, h): (u32, u32, u32, u32)) -> Vec<(i32, i32)> {
    coords
        .chunks_exact(2)
        .take(LANDMARK_COUNT)
        .map(|p| {
            (
                (x as f32 + p[0] * w as f32).round() as i32,
                (y as f32 + p[1] * h as f32).round() as i32,
            )
        })
        .collect()
}
