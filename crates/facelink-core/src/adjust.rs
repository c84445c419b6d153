//! Frame adjustment: color conversion to RGB, uniform resize, rotation and flip.
//!
//! The steps always run in that order. Each step is also exposed on its own
//! so callers (and tests) can compose them explicitly.

use crate::frame::{frame_lock, ColorSpace, Frame, FrameError};
use image::imageops::FilterType;
use image::DynamicImage;

/// Rotation by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise90,
    Rotate180,
    CounterClockwise90,
}

impl Rotation {
    /// 0 = 90° clockwise, 1 = 180°, 2 = 270° clockwise. Other codes: no rotation.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Clockwise90),
            1 => Some(Self::Rotate180),
            2 => Some(Self::CounterClockwise90),
            _ => None,
        }
    }
}

/// Mirror axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    /// Around the x-axis (upside down).
    Vertical,
    /// Around the y-axis (mirror).
    Horizontal,
    Both,
}

impl Flip {
    /// 0 = around x-axis, 1 = around y-axis, -1 = both. Other codes: no flip.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Vertical),
            1 => Some(Self::Horizontal),
            -1 => Some(Self::Both),
            _ => None,
        }
    }
}

/// Parameters for [`adjust`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub color_space: Option<ColorSpace>,
    /// Values <= 0 mean "no resize".
    pub scale_factor: f64,
    pub rotation: Option<Rotation>,
    pub flip: Option<Flip>,
}

impl Default for Adjustment {
    fn default() -> Self {
        Self {
            color_space: Some(ColorSpace::Rgb),
            scale_factor: -1.0,
            rotation: None,
            flip: None,
        }
    }
}

impl Adjustment {
    /// Build from the integer codes callers pass across the boundary.
    pub fn from_codes(color_space: i32, scale_factor: f64, rotation: i32, flip: i32) -> Self {
        Self {
            color_space: ColorSpace::from_code(color_space),
            scale_factor,
            rotation: Rotation::from_code(rotation),
            flip: Flip::from_code(flip),
        }
    }
}

/// Adjust `frame` in place: color → resize → rotate → flip.
///
/// A color conversion that does not fit the frame's channel count is logged
/// and skipped; the frame then stays in its source layout.
pub fn adjust(frame: &mut Frame, adjustment: &Adjustment) {
    let _guard = frame_lock();

    if frame.is_empty() {
        return;
    }

    if let Some(color_space) = adjustment.color_space {
        if let Err(err) = convert_color(frame, color_space) {
            tracing::warn!(error = %err, "color conversion skipped");
        }
    }
    resize(frame, adjustment.scale_factor);
    if let Some(rotation) = adjustment.rotation {
        rotate(frame, rotation);
    }
    if let Some(flip) = adjustment.flip {
        self::flip(frame, flip);
    }
}

/// Convert `frame` from `color_space` to 3-channel RGB.
pub fn convert_color(frame: &mut Frame, color_space: ColorSpace) -> Result<(), FrameError> {
    let mismatch = FrameError::ChannelMismatch {
        color_space,
        channels: frame.channels(),
    };
    if frame.channels() != color_space.channels() {
        return Err(mismatch);
    }

    match color_space {
        ColorSpace::Rgb => {}
        ColorSpace::Bgr => {
            let Some(img) = frame.as_rgb_mut() else {
                return Err(mismatch);
            };
            for p in img.pixels_mut() {
                p.0.swap(0, 2);
            }
        }
        ColorSpace::Yuv => {
            let Some(img) = frame.as_rgb_mut() else {
                return Err(mismatch);
            };
            for p in img.pixels_mut() {
                p.0 = yuv_to_rgb(p.0);
            }
        }
        ColorSpace::Rgba | ColorSpace::Gray => {
            let rgb = frame.image().to_rgb8();
            frame.replace(DynamicImage::ImageRgb8(rgb));
        }
    }
    Ok(())
}

/// BT.601 YUV → RGB with chroma centered at 128.
fn yuv_to_rgb([y, u, v]: [u8; 3]) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.403 * v),
        clamp(y - 0.344 * u - 0.714 * v),
        clamp(y + 1.773 * u),
    ]
}

/// Uniformly scale `frame` by `scale_factor` with bilinear filtering.
pub fn resize(frame: &mut Frame, scale_factor: f64) {
    if scale_factor <= 0.0 || frame.is_empty() {
        return;
    }
    let width = (frame.width() as f64 * scale_factor).round() as u32;
    let height = (frame.height() as f64 * scale_factor).round() as u32;
    if width == 0 || height == 0 {
        tracing::warn!(scale_factor, "resize would produce an empty frame, skipped");
        return;
    }
    if width == frame.width() && height == frame.height() {
        return;
    }
    let resized = frame.image().resize_exact(width, height, FilterType::Triangle);
    frame.replace(resized);
}

pub fn rotate(frame: &mut Frame, rotation: Rotation) {
    let rotated = match rotation {
        Rotation::Clockwise90 => frame.image().rotate90(),
        Rotation::Rotate180 => frame.image().rotate180(),
        Rotation::CounterClockwise90 => frame.image().rotate270(),
    };
    frame.replace(rotated);
}

pub fn flip(frame: &mut Frame, flip: Flip) {
    let flipped = match flip {
        Flip::Vertical => frame.image().flipv(),
        Flip::Horizontal => frame.image().fliph(),
        Flip::Both => frame.image().rotate180(),
    };
    frame.replace(flipped);
}
