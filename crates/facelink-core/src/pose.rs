//! Face pose pipeline: detection, landmarks and per-face anti-shake.
//!
//! Each detected face is tracked in a slot that owns a [`TemporalSmoother`].
//! Slots follow detection order; which face lands in which slot is decided
//! by a [`SlotAssigner`].

use crate::adjust::adjust;
use crate::config::PipelineConfig;
use crate::detector::{DetectorError, FaceDetector, ScrfdDetector};
use crate::frame::Frame;
use crate::landmarks::{LandmarkError, LandmarkPredictor, OnnxLandmarkPredictor, LANDMARK_COUNT};
use crate::model::ModelSource;
use crate::render::render_face;
use crate::smoother::TemporalSmoother;
use crate::types::FaceRect;
use image::DynamicImage;

/// A tracked face position with its smoothing history.
#[derive(Debug, Clone)]
pub struct FaceSlot {
    pub smoother: TemporalSmoother,
    /// Rectangle pushed on the last frame this slot received points.
    pub last_rect: Option<FaceRect>,
}

impl FaceSlot {
    fn new(capacity: usize) -> Self {
        Self {
            smoother: TemporalSmoother::new(capacity),
            last_rect: None,
        }
    }
}

/// Decides which detection feeds which slot.
///
/// Returns the detections reordered so that index `i` feeds slot `i`.
pub trait SlotAssigner: Send {
    fn assign(&mut self, slots: &[FaceSlot], detections: Vec<FaceRect>) -> Vec<FaceRect>;
}

/// Slot `i` takes detection `i`, whatever face it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionalAssigner;

impl SlotAssigner for PositionalAssigner {
    fn assign(&mut self, _slots: &[FaceSlot], detections: Vec<FaceRect>) -> Vec<FaceRect> {
        detections
    }
}

/// Keeps a face in the slot whose last rectangle it overlaps most.
///
/// Slots claim detections in slot order; unclaimed detections fill the
/// remaining slots in detection order.
#[derive(Debug, Clone, Copy)]
pub struct OverlapAssigner {
    /// Minimum IoU for a detection to stay in a slot.
    pub min_iou: f32,
}

impl Default for OverlapAssigner {
    fn default() -> Self {
        Self { min_iou: 0.3 }
    }
}

impl SlotAssigner for OverlapAssigner {
    fn assign(&mut self, slots: &[FaceSlot], detections: Vec<FaceRect>) -> Vec<FaceRect> {
        let mut claimed = vec![false; detections.len()];
        let mut assigned: Vec<Option<FaceRect>> = vec![None; detections.len()];

        for (slot, target) in slots.iter().zip(assigned.iter_mut()) {
            let Some(last) = slot.last_rect else {
                continue;
            };
            let best = detections
                .iter()
                .enumerate()
                .filter(|(i, _)| !claimed[*i])
                .map(|(i, rect)| (i, rect.iou(&last)))
                .filter(|&(_, iou)| iou >= self.min_iou)
                .fold(None, |best: Option<(usize, f32)>, candidate| match best {
                    Some(b) if b.1 >= candidate.1 => Some(b),
                    _ => Some(candidate),
                });
            if let Some((i, _)) = best {
                claimed[i] = true;
                *target = Some(detections[i]);
            }
        }

        let mut rest = detections
            .iter()
            .zip(&claimed)
            .filter(|(_, taken)| !**taken)
            .map(|(rect, _)| *rect);
        assigned
            .into_iter()
            .filter_map(|slot| slot.or_else(|| rest.next()))
            .collect()
    }
}

/// Smoothed points of the faces found in one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosePoints {
    /// One entry per face: 4 ints (rectangle) or 136 ints (landmarks).
    pub faces: Vec<Vec<i32>>,
}

impl PosePoints {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn flatten(&self) -> Vec<i32> {
        self.faces.concat()
    }
}

pub struct FacePosePipeline {
    config: PipelineConfig,
    detector: Option<Box<dyn FaceDetector>>,
    predictor: Option<Box<dyn LandmarkPredictor>>,
    assigner: Box<dyn SlotAssigner>,
    slots: Vec<FaceSlot>,
}

impl FacePosePipeline {
    /// A pipeline with no models; it reports zero faces until models are set.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: None,
            predictor: None,
            assigner: Box::new(PositionalAssigner),
            slots: Vec::new(),
        }
    }

    pub fn with_models(
        config: PipelineConfig,
        detector: Box<dyn FaceDetector>,
        predictor: Box<dyn LandmarkPredictor>,
    ) -> Self {
        let mut pipeline = Self::new(config);
        pipeline.detector = Some(detector);
        pipeline.predictor = Some(predictor);
        pipeline
    }

    pub fn set_detector(&mut self, detector: Box<dyn FaceDetector>) {
        self.detector = Some(detector);
    }

    pub fn set_predictor(&mut self, predictor: Box<dyn LandmarkPredictor>) {
        self.predictor = Some(predictor);
    }

    pub fn set_assigner(&mut self, assigner: Box<dyn SlotAssigner>) {
        self.assigner = assigner;
        self.slots.clear();
    }

    /// Load the SCRFD detector. On failure the pipeline keeps its previous
    /// detector, if any.
    pub fn load_detector(&mut self, source: &ModelSource, intra_threads: usize) -> Result<(), DetectorError> {
        self.detector = Some(Box::new(ScrfdDetector::load(source, intra_threads)?));
        Ok(())
    }

    pub fn load_predictor(&mut self, source: &ModelSource, intra_threads: usize) -> Result<(), LandmarkError> {
        self.predictor = Some(Box::new(OnnxLandmarkPredictor::load(source, intra_threads)?));
        Ok(())
    }

    /// Whether detection can run in the current mode.
    pub fn is_ready(&self) -> bool {
        self.detector.is_some() && (self.config.rectangle_only || self.predictor.is_some())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn slots(&self) -> &[FaceSlot] {
        &self.slots
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

    /// Switch between rectangle corners and landmarks. Slots are dropped
    /// because point-set widths differ between the modes.
    pub fn set_rectangle_only(&mut self, rectangle_only: bool) {
        if self.config.rectangle_only != rectangle_only {
            self.slots.clear();
        }
        self.config.rectangle_only = rectangle_only;
    }

    /// Change the smoothing window. Existing slots are dropped so every slot
    /// runs with the new capacity.
    pub fn set_anti_shake_samples(&mut self, samples: usize) {
        if self.config.anti_shake_samples != samples {
            self.slots.clear();
        }
        self.config.anti_shake_samples = samples;
    }

    pub fn set_jitter_delta(&mut self, delta: i32) {
        self.config.jitter_delta = delta;
    }

    /// Adjust `frame`, detect faces and return each face's smoothed points.
    ///
    /// Faces whose landmarks cannot be predicted are left out and their slot
    /// does not advance.
    pub fn detect(&mut self, frame: &mut Frame) -> PosePoints {
        if !self.is_ready() {
            tracing::debug!("pose pipeline has no models, skipping detection");
            return PosePoints::default();
        }

        adjust(frame, &self.config.adjustment());

        let rgb = frame.to_rgb();
        let detections = if frame.is_empty() {
            Vec::new()
        } else {
            match self.detector.as_mut().map(|d| d.detect(&rgb)) {
                Some(Ok(faces)) => faces,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "face detection failed");
                    Vec::new()
                }
                None => Vec::new(),
            }
        };

        let detections = self.assigner.assign(&self.slots, detections);
        let capacity = self.config.anti_shake_samples;
        self.slots.truncate(detections.len());
        while self.slots.len() < detections.len() {
            self.slots.push(FaceSlot::new(capacity));
        }

        let mut result = PosePoints::default();
        for (slot, face) in self.slots.iter_mut().zip(&detections) {
            let points = if self.config.rectangle_only {
                face.corners()
            } else {
                let Some(predictor) = self.predictor.as_mut() else {
                    continue;
                };
                match predictor.predict(&rgb, face) {
                    Ok(shape) if shape.is_complete() => shape.flatten(),
                    Ok(shape) => {
                        tracing::warn!(points = shape.points.len(), "incomplete landmark shape");
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "landmark prediction failed");
                        continue;
                    }
                }
            };

            slot.smoother.add(points, self.config.jitter_delta);
            slot.last_rect = Some(*face);
            result.faces.push(slot.smoother.average());
        }

        tracing::debug!(faces = result.face_count(), "pose detection");
        result
    }

    /// Adjust, detect and draw each face's smoothed points onto the frame,
    /// returning the frame as BMP. Without models, or on failure, the buffer
    /// is empty.
    pub fn render_pose(&mut self, frame: &mut Frame) -> Vec<u8> {
        if !self.is_ready() {
            tracing::debug!("pose pipeline has no models, nothing to render");
            return Vec::new();
        }
        let pose = self.detect(frame);
        if pose.face_count() > 0 {
            let point_count = if self.config.rectangle_only { 2 } else { LANDMARK_COUNT };
            let mut rgb = frame.to_rgb().into_owned();
            for points in &pose.faces {
                render_face(&mut rgb, points, point_count);
            }
            frame.replace(DynamicImage::ImageRgb8(rgb));
        }
        encode_or_empty(frame)
    }

    /// Apply the configured adjustment and return the frame as BMP.
    pub fn adjust_and_encode(&self, frame: &mut Frame) -> Vec<u8> {
        adjust(frame, &self.config.adjustment());
        encode_or_empty(frame)
    }
}

pub(crate) fn encode_or_empty(frame: &Frame) -> Vec<u8> {
    frame.encode_bmp().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "frame encoding failed");
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::OVERLAY_COLOR;
    use crate::test_support::{frame_with_faces, BlobDetector, BrokenDetector, TemplateLandmarks};
    use image::RgbImage;

    fn pipeline(config: PipelineConfig) -> FacePosePipeline {
        FacePosePipeline::with_models(config, Box::new(BlobDetector), Box::new(TemplateLandmarks))
    }

    fn one_face_frame(left: u32) -> Frame {
        Frame::from_rgb(frame_with_faces(200, 120, &[(left, 20, 60, [255, 255, 255])]))
    }

    #[test]
    fn test_blank_frame_has_no_faces() {
        let mut p = pipeline(PipelineConfig::default());
        let pose = p.detect(&mut Frame::from_rgb(RgbImage::new(64, 48)));
        assert_eq!(pose.face_count(), 0);
        assert!(pose.flatten().is_empty());
    }

    #[test]
    fn test_empty_frame_has_no_faces() {
        let mut p = pipeline(PipelineConfig::default());
        assert_eq!(p.detect(&mut Frame::empty()).face_count(), 0);
    }

    #[test]
    fn test_one_face_rectangle_mode() {
        let mut p = pipeline(PipelineConfig::default());
        let pose = p.detect(&mut one_face_frame(30));
        assert_eq!(pose.face_count(), 1);
        assert_eq!(pose.flatten(), vec![30, 20, 89, 79]);
    }

    #[test]
    fn test_one_face_landmark_mode() {
        let mut p = pipeline(PipelineConfig {
            rectangle_only: false,
            ..Default::default()
        });
        let pose = p.detect(&mut one_face_frame(30));
        assert_eq!(pose.face_count(), 1);
        assert_eq!(pose.flatten().len(), 136);
    }

    #[test]
    fn test_without_models_reports_nothing() {
        let mut p = FacePosePipeline::new(PipelineConfig::default());
        assert!(!p.is_ready());
        assert_eq!(p.detect(&mut one_face_frame(30)).face_count(), 0);
        assert!(p.slots().is_empty());
    }

    #[test]
    fn test_landmark_mode_needs_predictor() {
        let mut p = FacePosePipeline::new(PipelineConfig::default());
        p.set_detector(Box::new(BlobDetector));
        assert!(p.is_ready());
        p.set_rectangle_only(false);
        assert!(!p.is_ready());
    }

    #[test]
    fn test_detector_failure_is_zero_faces() {
        let mut p = FacePosePipeline::with_models(
            PipelineConfig::default(),
            Box::new(BrokenDetector),
            Box::new(TemplateLandmarks),
        );
        assert_eq!(p.detect(&mut one_face_frame(30)).face_count(), 0);
    }

    #[test]
    fn test_slots_follow_face_count() {
        let mut p = pipeline(PipelineConfig::default());
        let two = frame_with_faces(200, 100, &[(10, 10, 40, [255; 3]), (120, 10, 40, [255; 3])]);

        assert_eq!(p.detect(&mut Frame::from_rgb(two.clone())).face_count(), 2);
        assert_eq!(p.slots().len(), 2);

        p.detect(&mut one_face_frame(30));
        assert_eq!(p.slots().len(), 1);

        p.detect(&mut Frame::from_rgb(RgbImage::new(20, 20)));
        assert!(p.slots().is_empty());
    }

    #[test]
    fn test_anti_shake_smooths_small_motion() {
        let mut p = pipeline(PipelineConfig {
            anti_shake_samples: 3,
            ..Default::default()
        });
        p.detect(&mut one_face_frame(30));
        let pose = p.detect(&mut one_face_frame(34));
        // Mean of left edges 30 and 34.
        assert_eq!(pose.faces[0][0], 32);
    }

    #[test]
    fn test_anti_shake_resets_on_jump() {
        let mut p = pipeline(PipelineConfig {
            anti_shake_samples: 3,
            ..Default::default()
        });
        p.detect(&mut one_face_frame(10));
        let pose = p.detect(&mut one_face_frame(100));
        assert_eq!(pose.faces[0][0], 100);
    }

    #[test]
    fn test_sample_count_change_resets_slots() {
        let mut p = pipeline(PipelineConfig::default());
        p.detect(&mut one_face_frame(30));
        assert_eq!(p.slots()[0].smoother.capacity(), 1);

        p.set_anti_shake_samples(4);
        assert!(p.slots().is_empty());
        p.detect(&mut one_face_frame(30));
        assert_eq!(p.slots()[0].smoother.capacity(), 4);
    }

    #[test]
    fn test_mode_toggle_resets_slots() {
        let mut p = pipeline(PipelineConfig::default());
        p.detect(&mut one_face_frame(30));
        p.set_rectangle_only(true);
        assert_eq!(p.slots().len(), 1);
        p.set_rectangle_only(false);
        assert!(p.slots().is_empty());
    }

    #[test]
    fn test_adjustment_applies_before_detection() {
        let mut p = pipeline(PipelineConfig {
            scale_factor: 0.5,
            ..Default::default()
        });
        let pose = p.detect(&mut one_face_frame(40));
        assert_eq!(pose.face_count(), 1);
        let rect = &pose.faces[0];
        assert!((rect[0] - 20).abs() <= 1, "left edge {}", rect[0]);
    }

    #[test]
    fn test_render_pose_draws_rectangle() {
        let mut p = pipeline(PipelineConfig::default());
        let mut frame = Frame::from_rgb(frame_with_faces(100, 100, &[(20, 20, 30, [250, 0, 0])]));

        let bmp = p.render_pose(&mut frame);
        assert_eq!(&bmp[..2], b"BM");
        assert_eq!(*frame.as_rgb().unwrap().get_pixel(20, 20), OVERLAY_COLOR);
    }

    #[test]
    fn test_render_pose_without_models_is_empty() {
        let mut p = FacePosePipeline::new(PipelineConfig::default());
        let mut frame = Frame::from_rgb(RgbImage::new(16, 16));
        assert!(p.render_pose(&mut frame).is_empty());

        p.set_detector(Box::new(BlobDetector));
        p.set_rectangle_only(false);
        assert!(p.render_pose(&mut frame).is_empty());
    }

    /// Reports faces right to left.
    struct ReversingAssigner;

    impl SlotAssigner for ReversingAssigner {
        fn assign(&mut self, _slots: &[FaceSlot], mut detections: Vec<FaceRect>) -> Vec<FaceRect> {
            detections.reverse();
            detections
        }
    }

    /// Returns its rectangle lists in turn, one per call.
    struct ScriptedDetector {
        frames: Vec<Vec<FaceRect>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceRect>, DetectorError> {
            Ok(if self.frames.is_empty() {
                Vec::new()
            } else {
                self.frames.remove(0)
            })
        }
    }

    fn two_faces() -> Frame {
        Frame::from_rgb(frame_with_faces(200, 100, &[(10, 10, 40, [255; 3]), (120, 10, 40, [255; 3])]))
    }

    #[test]
    fn test_custom_assigner_decides_slots() {
        let mut p = pipeline(PipelineConfig::default());
        p.detect(&mut two_faces());
        p.set_assigner(Box::new(ReversingAssigner));
        assert!(p.slots().is_empty());

        let pose = p.detect(&mut two_faces());
        assert_eq!(pose.faces[0], vec![120, 10, 159, 49]);
        assert_eq!(pose.faces[1], vec![10, 10, 49, 49]);
        assert_eq!(p.slots()[0].last_rect, Some(FaceRect::new(120, 10, 159, 49)));
    }

    #[test]
    fn test_overlap_assigner_keeps_faces_in_their_slots() {
        let left = FaceRect::new(10, 10, 49, 49);
        let right = FaceRect::new(120, 10, 159, 49);
        let left_moved = FaceRect::new(12, 10, 51, 49);
        let detector = ScriptedDetector {
            frames: vec![vec![left, right], vec![right, left_moved]],
        };
        let config = PipelineConfig {
            anti_shake_samples: 3,
            ..Default::default()
        };

        let mut p = FacePosePipeline::new(config);
        p.set_detector(Box::new(detector));
        p.set_assigner(Box::new(OverlapAssigner::default()));
        p.detect(&mut two_faces());
        let pose = p.detect(&mut two_faces());

        // Left edges 10 and 12 average in slot 0; slot 1 keeps the right face.
        assert_eq!(pose.faces[0][0], 11);
        assert_eq!(pose.faces[1], right.corners());
    }

    #[test]
    fn test_overlap_assigner_fills_new_and_lost_slots() {
        let mut assigner = OverlapAssigner::default();
        let mut slot = FaceSlot::new(1);
        slot.last_rect = Some(FaceRect::new(100, 0, 139, 39));
        let slots = vec![FaceSlot::new(1), slot];

        let near = FaceRect::new(102, 0, 141, 39);
        let far = FaceRect::new(0, 0, 39, 39);
        let fresh = FaceRect::new(200, 0, 239, 39);

        // Slot 1 keeps its face; the others fill remaining slots in order.
        assert_eq!(assigner.assign(&slots, vec![far, near, fresh]), vec![far, near, fresh]);
        assert_eq!(assigner.assign(&slots, vec![near, far]), vec![far, near]);
        assert!(assigner.assign(&slots, Vec::new()).is_empty());
    }

    #[test]
    fn test_adjust_and_encode() {
        let p = FacePosePipeline::new(PipelineConfig {
            rotation: 0,
            ..Default::default()
        });
        let mut frame = Frame::from_rgb(RgbImage::new(10, 4));
        let bmp = p.adjust_and_encode(&mut frame);
        assert_eq!(&bmp[..2], b"BM");
        assert_eq!((frame.width(), frame.height()), (4, 10));
        assert!(p.adjust_and_encode(&mut Frame::empty()).is_empty());
    }
}
