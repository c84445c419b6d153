//! Random perturbations of face chips: geometric jitter for embedding
//! averaging and color disturbance for training augmentation.

use crate::alignment::{warp_rgb, Border, SimilarityTransform};
use image::imageops;
use image::RgbImage;
use rand::Rng;

const MAX_ROTATION_DEGREES: f32 = 3.0;
const MIN_OBJECT_SCALE: f32 = 0.97;
const MAX_OBJECT_SCALE: f32 = 0.99;
const MAX_TRANSLATION: f32 = 0.02;

const COLOR_GAIN_MAGNITUDE: f32 = 0.2;
const GAMMA_MAGNITUDE: f32 = 0.5;

/// A slightly rotated, scaled, shifted and possibly mirrored copy of `image`.
///
/// Out-of-frame samples repeat the nearest edge, so a uniform image stays
/// uniform.
pub fn jitter_image<R: Rng + ?Sized>(image: &RgbImage, rng: &mut R) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }

    let angle = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES).to_radians();
    let scale = rng.gen_range(MIN_OBJECT_SCALE..=MAX_OBJECT_SCALE);
    let shift = (
        rng.gen_range(-MAX_TRANSLATION..=MAX_TRANSLATION) * w as f32,
        rng.gen_range(-MAX_TRANSLATION..=MAX_TRANSLATION) * h as f32,
    );
    let center = ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0);

    let transform = SimilarityTransform::about(center, angle, scale, shift);
    let mut out = warp_rgb(image, &transform, w, h, Border::Clamp).unwrap_or_else(|| image.clone());

    if rng.gen_bool(0.5) {
        imageops::flip_horizontal_in_place(&mut out);
    }
    out
}

/// `count` independent jittered copies of `image`.
pub fn jitter_copies<R: Rng + ?Sized>(image: &RgbImage, count: usize, rng: &mut R) -> Vec<RgbImage> {
    (0..count).map(|_| jitter_image(image, rng)).collect()
}

/// Apply a random per-channel gain and a random gamma curve in place.
pub fn disturb_colors<R: Rng + ?Sized>(image: &mut RgbImage, rng: &mut R) {
    let gains: [f32; 3] = std::array::from_fn(|_| {
        1.0 + rng.gen_range(-COLOR_GAIN_MAGNITUDE..=COLOR_GAIN_MAGNITUDE)
    });
    let gamma = 1.0 + rng.gen_range(-GAMMA_MAGNITUDE..=GAMMA_MAGNITUDE);

    let luts: [[u8; 256]; 3] = gains.map(|gain| {
        std::array::from_fn(|v| {
            let curved = (v as f32 / 255.0).powf(gamma) * 255.0;
            (curved * gain).round().clamp(0.0, 255.0) as u8
        })
    });

    for pixel in image.pixels_mut() {
        for c in 0..3 {
            pixel.0[c] = luts[c][pixel.0[c] as usize];
        }
    }
}
