//! Raster primitives on top of `image`/`imageproc`.
//!
//! Coordinates are fractional pixels; a pixel is covered when its centre
//! falls inside the shape. Everything clips to the canvas.

use image::RgbImage;
use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};

use crate::color::Rgb;

/// Axis-aligned rectangle in fractional pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RectF {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn inset(&self, by: f32) -> RectF {
        RectF::new(
            self.x + by,
            self.y + by,
            self.width - 2.0 * by,
            self.height - 2.0 * by,
        )
    }

    /// Covered pixel span `[x0, x1) x [y0, y1)`, clipped to the canvas.
    fn pixel_span(&self, canvas: &RgbImage) -> Option<(u32, u32, u32, u32)> {
        let clip = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let x0 = clip(self.x, canvas.width());
        let x1 = clip(self.x + self.width, canvas.width());
        let y0 = clip(self.y, canvas.height());
        let y1 = clip(self.y + self.height, canvas.height());
        (x0 < x1 && y0 < y1).then_some((x0, x1, y0, y1))
    }

    fn contains_rounded(&self, px: f32, py: f32, radius: f32) -> bool {
        if px < self.x || px >= self.x + self.width || py < self.y || py >= self.y + self.height {
            return false;
        }
        if radius <= 0.0 {
            return true;
        }
        let cx = px.max(self.x + radius).min(self.x + self.width - radius);
        let cy = py.max(self.y + radius).min(self.y + self.height - radius);
        let (dx, dy) = (px - cx, py - cy);
        dx * dx + dy * dy <= radius * radius
    }
}

pub fn pixel(color: Rgb) -> image::Rgb<u8> {
    image::Rgb(color.channels())
}

/// Opaque axis-aligned fill.
pub fn fill_rect(canvas: &mut RgbImage, rect: RectF, color: Rgb) {
    if let Some((x0, x1, y0, y1)) = rect.pixel_span(canvas) {
        let area = Rect::at(x0 as i32, y0 as i32).of_size(x1 - x0, y1 - y0);
        draw_filled_rect_mut(canvas, area, pixel(color));
    }
}

/// Alpha-blends `color` into a single pixel. Out-of-bounds writes are ignored.
pub fn blend_pixel(canvas: &mut RgbImage, x: u32, y: u32, color: Rgb, alpha: f32) {
    if x >= canvas.width() || y >= canvas.height() {
        return;
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let dst = canvas.get_pixel_mut(x, y);
    let current = Rgb::new(dst[0], dst[1], dst[2]);
    *dst = pixel(current.mix(color, alpha));
}

/// Rounded rectangle, optionally translucent. The radius is clamped so the
/// corners never overlap.
pub fn fill_rounded_rect(canvas: &mut RgbImage, rect: RectF, radius: f32, color: Rgb, alpha: f32) {
    let Some((x0, x1, y0, y1)) = rect.pixel_span(canvas) else {
        return;
    };
    let radius = radius.min(rect.width / 2.0).min(rect.height / 2.0).max(0.0);
    for y in y0..y1 {
        for x in x0..x1 {
            if rect.contains_rounded(x as f32 + 0.5, y as f32 + 0.5, radius) {
                blend_pixel(canvas, x, y, color, alpha);
            }
        }
    }
}

/// Outline of a rounded rectangle drawn inside its bounds.
pub fn stroke_rounded_rect(
    canvas: &mut RgbImage,
    rect: RectF,
    radius: f32,
    width: f32,
    color: Rgb,
) {
    let Some((x0, x1, y0, y1)) = rect.pixel_span(canvas) else {
        return;
    };
    let outer_radius = radius.min(rect.width / 2.0).min(rect.height / 2.0).max(0.0);
    let inner = rect.inset(width);
    let inner_radius = (outer_radius - width).max(0.0);
    for y in y0..y1 {
        for x in x0..x1 {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            if rect.contains_rounded(px, py, outer_radius)
                && !inner.contains_rounded(px, py, inner_radius)
            {
                blend_pixel(canvas, x, y, color, 1.0);
            }
        }
    }
}
