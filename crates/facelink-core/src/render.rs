//! Pose overlay drawing.

use crate::landmarks::{LandmarkRegion, LANDMARK_COUNT};
use image::{Rgb, RgbImage};
use imageproc::drawing;
use imageproc::rect::Rect;

pub const OVERLAY_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

/// Draw one face's points onto `image`.
///
/// `point_count` is 68 for full landmarks (`points` holds 136 ints) or 2
/// for a rectangle given as `[left, top, right, bottom]`. Anything else, or
/// a short point array, draws nothing.
pub fn render_face(image: &mut RgbImage, points: &[i32], point_count: usize) {
    match point_count {
        LANDMARK_COUNT if points.len() >= LANDMARK_COUNT * 2 => draw_landmarks(image, points),
        2 if points.len() >= 4 => draw_rectangle(image, points[0], points[1], points[2], points[3]),
        _ => tracing::debug!(point_count, len = points.len(), "nothing to render"),
    }
}

fn draw_landmarks(image: &mut RgbImage, points: &[i32]) {
    let at = |i: usize| (points[i * 2] as f32, points[i * 2 + 1] as f32);

    for region in LandmarkRegion::ALL {
        let range = region.indices();
        for i in range.start..range.end - 1 {
            drawing::draw_line_segment_mut(image, at(i), at(i + 1), OVERLAY_COLOR);
        }
        if region.is_closed() {
            drawing::draw_line_segment_mut(image, at(range.end - 1), at(range.start), OVERLAY_COLOR);
        }
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32) {
    if right < left || bottom < top {
        return;
    }
    let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
    drawing::draw_hollow_rect_mut(image, rect, OVERLAY_COLOR);
}
