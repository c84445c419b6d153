use serde::{Deserialize, Serialize};

/// Face rectangle in frame pixel coordinates.
///
/// `right` and `bottom` are inclusive, so a one-pixel rectangle has
/// `left == right` and `top == bottom`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl FaceRect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top + 1
    }

    /// True when the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.left > self.right || self.top > self.bottom
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    /// The two-corner point sequence `[left, top, right, bottom]` used in
    /// rectangle-only mode.
    pub fn corners(&self) -> Vec<i32> {
        vec![self.left, self.top, self.right, self.bottom]
    }

    /// Intersection-over-Union with another rectangle.
    pub fn iou(&self, other: &FaceRect) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);

        let inter = FaceRect::new(left, top, right, bottom);
        if inter.is_empty() {
            return 0.0;
        }
        let inter_area = (inter.width() * inter.height()) as f32;
        let union_area =
            (self.width() * self.height() + other.width() * other.height()) as f32 - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector (128-dimensional for the metric network).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two embeddings, or `None` when their
    /// dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.len() != other.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }

    /// Coordinate-wise mean of a set of embeddings.
    ///
    /// Returns `None` for an empty set or when dimensions disagree.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let dim = first.len();
        if embeddings.iter().any(|e| e.len() != dim) {
            return None;
        }

        let mut values = vec![0.0f32; dim];
        for embedding in embeddings {
            for (acc, v) in values.iter_mut().zip(&embedding.values) {
                *acc += v;
            }
        }
        let n = embeddings.len() as f32;
        values.iter_mut().for_each(|v| *v /= n);

        Some(Embedding { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rect_dimensions_inclusive() {
        let r = FaceRect::new(10, 20, 19, 39);
        assert_eq!(r.width(), 10);
        assert_eq!(r.height(), 20);
        assert!(!r.is_empty());
    }

    #[test]
    fn test_rect_empty() {
        assert!(FaceRect::new(10, 10, 9, 20).is_empty());
        assert!(FaceRect::new(10, 10, 20, 9).is_empty());
        assert!(!FaceRect::new(0, 0, 0, 0).is_empty());
    }

    #[test]
    fn test_rect_corners() {
        assert_eq!(FaceRect::new(1, 2, 3, 4).corners(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_iou_identical() {
        let a = FaceRect::new(0, 0, 99, 99);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = FaceRect::new(0, 0, 9, 9);
        let b = FaceRect::new(20, 20, 29, 29);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = FaceRect::new(0, 0, 9, 9);
        let b = FaceRect::new(5, 0, 14, 9);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert_relative_eq!(a.iou(&b), 50.0 / 150.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_relative_eq!(a.euclidean_distance(&b).unwrap(), 5.0);
        assert_eq!(a.euclidean_distance(&a), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let short = Embedding::new(vec![0.0]);
        let long = Embedding::new(vec![0.0, 5.0, 5.0]);
        assert_eq!(short.euclidean_distance(&long), None);
        assert_eq!(long.euclidean_distance(&short), None);
    }

    #[test]
    fn test_mean_embedding() {
        let set = vec![
            Embedding::new(vec![1.0, 2.0]),
            Embedding::new(vec![3.0, 6.0]),
        ];
        let mean = Embedding::mean(&set).unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_rejects_mismatched_dims() {
        let set = vec![Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])];
        assert!(Embedding::mean(&set).is_none());
        assert!(Embedding::mean(&[]).is_none());
    }
}
