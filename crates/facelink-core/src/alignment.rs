//! Face chip extraction via 4-DOF similarity transform.
//!
//! Five anchors taken from the 68-point shape (eye centers, nose tip, mouth
//! corners) are mapped by least squares onto a padded canonical template,
//! and the frame is warped into a square RGB chip.

use crate::landmarks::FaceShape;
use image::{Rgb, RgbImage};

/// Side length of the chip fed to the embedding network.
pub const FACE_CHIP_SIZE: u32 = 150;

/// Fraction of the face width added as border on each side of the chip.
pub const FACE_CHIP_PADDING: f32 = 0.25;

/// Canonical anchor positions in the unit square, before padding.
const CHIP_TEMPLATE: [(f32, f32); 5] = [
    (0.3419, 0.4616), // eye center, image left
    (0.6565, 0.4598), // eye center, image right
    (0.5002, 0.6405), // nose tip
    (0.3710, 0.8247), // mouth corner, image left
    (0.6315, 0.8232), // mouth corner, image right
];

/// How to sample source pixels that fall outside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// Fill with black.
    Zero,
    /// Repeat the nearest edge pixel.
    Clamp,
}

/// Similarity transform mapping `(x, y)` to
/// `(a·x − b·y + tx, b·x + a·y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Rotation by `angle` radians and uniform `scale` about `center`,
    /// followed by a translation of `(dx, dy)`.
    pub fn about(center: (f32, f32), angle: f32, scale: f32, (dx, dy): (f32, f32)) -> Self {
        let a = scale * angle.cos();
        let b = scale * angle.sin();
        let (cx, cy) = center;
        Self {
            a,
            b,
            tx: cx - (a * cx - b * cy) + dx,
            ty: cy - (b * cx + a * cy) + dy,
        }
    }

    /// Least-squares fit from `src` points onto `dst` points.
    ///
    /// Returns `None` for fewer than two pairs or a degenerate system.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 2 {
            return None;
        }

        // Normal equations for A · [a, b, tx, ty]^T = B with rows
        //   [sx, -sy, 1, 0] -> dx
        //   [sy,  sx, 0, 1] -> dy
        let mut ata = [[0.0f64; 4]; 4];
        let mut atb = [0.0f64; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        let [a, b, tx, ty] = solve_4x4(ata, atb)?;
        Some(Self {
            a: a as f32,
            b: b as f32,
            tx: tx as f32,
            ty: ty as f32,
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp `image` into a `width`×`height` output.
///
/// `transform` maps source coordinates to output coordinates; each output
/// pixel is sampled bilinearly through its inverse.
pub fn warp_rgb(
    image: &RgbImage,
    transform: &SimilarityTransform,
    width: u32,
    height: u32,
    border: Border,
) -> Option<RgbImage> {
    let inverse = transform.inverse()?;
    let (src_w, src_h) = (image.width() as i64, image.height() as i64);
    if src_w == 0 || src_h == 0 {
        return None;
    }

    let sample = |x: i64, y: i64| -> Option<[f32; 3]> {
        let (x, y) = match border {
            Border::Clamp => (x.clamp(0, src_w - 1), y.clamp(0, src_h - 1)),
            Border::Zero if x < 0 || y < 0 || x >= src_w || y >= src_h => return None,
            Border::Zero => (x, y),
        };
        let p = image.get_pixel(x as u32, y as u32).0;
        Some([p[0] as f32, p[1] as f32, p[2] as f32])
    };

    let mut out = RgbImage::new(width, height);
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = inverse.apply((ox as f32, oy as f32));
        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let taps = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1, y0, fx * (1.0 - fy)),
            (x0, y0 + 1, (1.0 - fx) * fy),
            (x0 + 1, y0 + 1, fx * fy),
        ];
        let mut acc = [0.0f32; 3];
        for (x, y, w) in taps {
            if let Some(p) = sample(x, y) {
                for c in 0..3 {
                    acc[c] += p[c] * w;
                }
            }
        }
        *pixel = Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8));
    }
    Some(out)
}

/// The five alignment anchors of a 68-point shape, in template order.
pub fn chip_anchors(shape: &FaceShape) -> Option<[(f32, f32); 5]> {
    if !shape.is_complete() {
        return None;
    }
    let corner = |i: usize| shape.point(i).map(|(x, y)| (x as f32, y as f32));
    Some([
        shape.centroid(36..42)?,
        shape.centroid(42..48)?,
        corner(30)?,
        corner(48)?,
        corner(54)?,
    ])
}

/// Template anchor positions in a `size`-pixel chip with `padding`.
fn template_points(size: u32, padding: f32) -> [(f32, f32); 5] {
    let span = 1.0 + 2.0 * padding;
    let s = size as f32;
    CHIP_TEMPLATE.map(|(x, y)| ((x + padding) / span * s, (y + padding) / span * s))
}

/// Cut an aligned, square RGB chip of side `size` out of `image`.
///
/// Returns `None` when the shape is incomplete or its anchors are degenerate.
pub fn extract_face_chip(
    image: &RgbImage,
    shape: &FaceShape,
    size: u32,
    padding: f32,
) -> Option<RgbImage> {
    if size == 0 {
        return None;
    }
    let anchors = chip_anchors(shape)?;
    let transform = SimilarityTransform::estimate(&anchors, &template_points(size, padding))?;
    warp_rgb(image, &transform, size, size, Border::Zero)
}
