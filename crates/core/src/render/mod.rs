//! Frame synthesis: falling note blocks over an 88-key keybed.

pub mod canvas;

use image::{imageops::FilterType, RgbImage, RgbaImage};
use tracing::debug;

use crate::{
    color::Rgb,
    config::{RenderOptions, VideoSettings},
    keys::{KeyGeometry, KeyLayout, KEY_COUNT},
    timeline::NoteTimeline,
    Result,
};

use self::canvas::{blend_pixel, fill_rect, fill_rounded_rect, stroke_rounded_rect, RectF};

/// Rendered frame, always at the session resolution.
pub type Frame = RgbImage;

const KEY_SUBDIVISIONS: usize = 50;
const MOTION_BLUR_ALPHA: f32 = 92.0 / 255.0;
const GLOW_BAND: u32 = 20;
const GLOW_EXTRA_WIDTH: f32 = 5.0;
const GLOW_WHITE_MIX: f32 = 0.6;
const GLOW_TINT_MIX: f32 = 0.25;

/// Per-key block colors resolved once from the gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPalette {
    colors: Vec<Rgb>,
}

impl KeyPalette {
    pub fn new(options: &RenderOptions) -> Result<Self> {
        let colors = (0..KEY_COUNT)
            .map(|key| options.blocks.color_grad.color_for(key, &options.grading))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { colors })
    }

    /// Block color for `key`. Keys outside the keyboard fall back to white.
    pub fn color(&self, key: usize) -> Rgb {
        match self.colors.get(key) {
            Some(color) => *color,
            None => {
                debug!(key, "key outside the keyboard, drawing it white");
                Rgb::WHITE
            }
        }
    }
}

/// Renders frames of a prepared session.
///
/// Rendering is a pure function of the renderer state and the frame index,
/// so one renderer can serve any number of frames in any order.
#[derive(Debug, Clone)]
pub struct FrameRenderer {
    settings: VideoSettings,
    options: RenderOptions,
    timeline: NoteTimeline,
    layout: KeyLayout,
    palette: KeyPalette,
    overlay: Option<RgbaImage>,
}

impl FrameRenderer {
    pub fn new(
        settings: VideoSettings,
        options: RenderOptions,
        timeline: NoteTimeline,
        overlay: Option<RgbaImage>,
    ) -> Result<Self> {
        let palette = KeyPalette::new(&options)?;
        let layout = KeyLayout::new(settings.width, options.keys.black.width_fac);
        let overlay = overlay.map(|image| fit_overlay(image, settings.width, settings.height / 4));
        Ok(Self {
            settings,
            options,
            timeline,
            layout,
            palette,
            overlay,
        })
    }

    pub fn settings(&self) -> &VideoSettings {
        &self.settings
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn timeline(&self) -> &NoteTimeline {
        &self.timeline
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn palette(&self) -> &KeyPalette {
        &self.palette
    }

    fn keybed_top(&self) -> f32 {
        self.settings.height as f32 / 2.0
    }

    /// Renders one frame. Frames before the first or after the last note
    /// simply show an idle keyboard.
    pub fn render(&self, frame: f64) -> Frame {
        let (width, height) = (self.settings.width, self.settings.height);
        let mut canvas = RgbImage::new(width, height);
        let playing = self.timeline.playing_keys(frame);

        self.draw_blocks(&mut canvas, frame);
        let keybed_top = self.keybed_top();
        fill_rect(
            &mut canvas,
            RectF::new(0.0, keybed_top, width as f32, height as f32),
            Rgb::BLACK,
        );
        if self.options.blocks.glow {
            self.apply_glow(&mut canvas, &playing);
        }
        self.draw_keybed(&mut canvas, &playing);
        self.draw_overlay(&mut canvas);
        canvas
    }

    fn draw_blocks(&self, canvas: &mut RgbImage, frame: f64) {
        let blocks = &self.options.blocks;
        let fps = self.settings.fps as f64;
        let speed = blocks.speed as f64;
        let keybed_top = self.keybed_top() as f64;
        let radius = blocks.rounding as f32;

        for note in self.timeline.notes() {
            let bottom = (frame - note.start_frame) / fps * speed + keybed_top;
            let top = bottom - (note.end_frame - note.start_frame) / fps * speed;
            if bottom < 0.0 || top > keybed_top {
                continue;
            }
            let Some(key) = self.layout.key(note.key) else {
                continue;
            };
            let color = self.palette.color(note.key);
            let rect = RectF::new(key.x, top as f32, key.width - 1.0, (bottom - top) as f32);

            if blocks.motion_blur {
                let trail = (speed / fps / 3.0) as f32;
                let smeared = RectF::new(rect.x, rect.y - trail, rect.width, rect.height + trail);
                fill_rounded_rect(canvas, smeared, radius, color, MOTION_BLUR_ALPHA);
            }
            fill_rounded_rect(canvas, rect, radius, color, 1.0);
            if blocks.border.width > 0 {
                stroke_rounded_rect(
                    canvas,
                    rect,
                    radius,
                    blocks.border.width as f32,
                    blocks.border.color,
                );
            }
        }
    }

    /// Brightens lit pixels just above each sounding key, whiter the closer
    /// they are to the keybed.
    fn apply_glow(&self, canvas: &mut RgbImage, playing: &[bool; KEY_COUNT]) {
        let keybed_top = self.keybed_top().round() as u32;
        let band_start = keybed_top.saturating_sub(GLOW_BAND);
        for key in self.layout.keys().iter().filter(|k| playing[k.key]) {
            let tint = self.palette.color(key.key);
            let x0 = key.x.max(0.0).round() as u32;
            let x1 = ((key.x + key.width + GLOW_EXTRA_WIDTH).round().max(0.0) as u32)
                .min(canvas.width());
            for y in band_start..keybed_top.min(canvas.height()) {
                let distance = (keybed_top - y) as f32;
                let factor = 1.0 - distance / GLOW_BAND as f32;
                for x in x0..x1 {
                    let p = canvas.get_pixel(x, y);
                    let current = Rgb::new(p[0], p[1], p[2]);
                    if current == Rgb::BLACK {
                        continue;
                    }
                    let glowing = current
                        .mix(Rgb::WHITE, GLOW_WHITE_MIX * factor)
                        .mix(tint, GLOW_TINT_MIX * factor);
                    blend_pixel(canvas, x, y, glowing, 1.0);
                }
            }
        }
    }

    fn draw_keybed(&self, canvas: &mut RgbImage, playing: &[bool; KEY_COUNT]) {
        let (width, height) = (self.settings.width as f32, self.settings.height as f32);
        let top = self.keybed_top();
        let white_height = height / 4.0;

        for key in self.layout.draw_order() {
            let (key_width, key_height, idle) = self.key_face(key, white_height);
            if playing[key.key] {
                let step = key_height / KEY_SUBDIVISIONS as f32;
                let lit = self.palette.color(key.key);
                for i in 0..KEY_SUBDIVISIONS {
                    let color = lit.mix(idle, i as f32 / KEY_SUBDIVISIONS as f32);
                    let strip = RectF::new(key.x, top + i as f32 * step, key_width, step + 1.0);
                    fill_rect(canvas, strip, color);
                }
            } else {
                fill_rect(canvas, RectF::new(key.x, top, key_width, key_height), idle);
            }
        }

        fill_rect(
            canvas,
            RectF::new(0.0, height * 0.75, width, height / 4.0),
            Rgb::BLACK,
        );
    }

    fn key_face(&self, key: &KeyGeometry, white_height: f32) -> (f32, f32, Rgb) {
        let keys = &self.options.keys;
        if key.is_white {
            (
                self.layout.white_key_width() - keys.white.gap,
                white_height,
                keys.white.color,
            )
        } else {
            (key.width, white_height * keys.black.height_fac, keys.black.color)
        }
    }

    fn draw_overlay(&self, canvas: &mut RgbImage) {
        let Some(overlay) = &self.overlay else {
            return;
        };
        let (width, height) = (self.settings.width, self.settings.height);
        let area_top = height - height / 4;
        let x0 = (width.saturating_sub(overlay.width())) / 2;
        let y0 = area_top + (height / 4).saturating_sub(overlay.height()) / 2;
        for (x, y, p) in overlay.enumerate_pixels() {
            let alpha = p[3] as f32 / 255.0;
            if alpha > 0.0 {
                blend_pixel(canvas, x0 + x, y0 + y, Rgb::new(p[0], p[1], p[2]), alpha);
            }
        }
    }
}

/// Shrinks `image` to fit inside `max_width` x `max_height`, keeping its aspect.
fn fit_overlay(image: RgbaImage, max_width: u32, max_height: u32) -> RgbaImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    let scale_x = max_width as f32 / image.width() as f32;
    let scale_y = max_height as f32 / image.height() as f32;
    let scale = scale_x.min(scale_y);
    let width = ((image.width() as f32 * scale) as u32).max(1);
    let height = ((image.height() as f32 * scale) as u32).max(1);
    image::imageops::resize(&image, width, height, FilterType::Triangle)
}
