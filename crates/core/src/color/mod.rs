//! Key colors: HSV gradient stops interpolated across the keyboard.

use serde::{Deserialize, Serialize};

use crate::{keys::KEY_COUNT, PianoVisError, Result};

/// 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Linear mix from `self` (fac = 0) to `other` (fac = 1).
    pub fn mix(self, other: Rgb, fac: f32) -> Rgb {
        let lerp = |a: u8, b: u8| {
            (a as f32 + (b as f32 - a as f32) * fac)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb::new(
            lerp(self.r, other.r),
            lerp(self.g, other.g),
            lerp(self.b, other.b),
        )
    }

    pub fn channels(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(value: Rgb) -> Self {
        value.channels()
    }
}

/// HSV color with every channel in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Hsv {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl Hsv {
    pub const fn new(h: f32, s: f32, v: f32) -> Self {
        Self { h, s, v }
    }

    fn lerp(self, other: Hsv, fac: f32) -> Hsv {
        Hsv::new(
            self.h + (other.h - self.h) * fac,
            self.s + (other.s - self.s) * fac,
            self.v + (other.v - self.v) * fac,
        )
    }

    pub fn graded(self, grading: &ColorGrading) -> Hsv {
        Hsv::new(
            self.h + grading.hue_shift,
            self.s * grading.saturation,
            self.v * grading.value,
        )
    }

    /// Converts to 8-bit RGB. Hue wraps modulo 1, so 0.0 and 1.0 are both red.
    /// Channels are truncated, not rounded, so float noise near zero stays 0.
    pub fn to_rgb(self) -> Rgb {
        let h = self.h.rem_euclid(1.0);
        let s = self.s.clamp(0.0, 1.0);
        let v = self.v.clamp(0.0, 1.0);
        let (r, g, b) = if s == 0.0 {
            (v, v, v)
        } else {
            let sector = (h * 6.0).floor();
            let f = h * 6.0 - sector;
            let p = v * (1.0 - s);
            let q = v * (1.0 - s * f);
            let t = v * (1.0 - s * (1.0 - f));
            match sector as i32 % 6 {
                0 => (v, t, p),
                1 => (q, v, p),
                2 => (p, v, t),
                3 => (p, q, v),
                4 => (t, p, v),
                _ => (v, p, q),
            }
        };
        let to_byte = |c: f32| (c * 255.0).clamp(0.0, 255.0) as u8;
        Rgb::new(to_byte(r), to_byte(g), to_byte(b))
    }
}

impl From<[f32; 3]> for Hsv {
    fn from([h, s, v]: [f32; 3]) -> Self {
        Self::new(h, s, v)
    }
}

impl From<Hsv> for [f32; 3] {
    fn from(value: Hsv) -> Self {
        [value.h, value.s, value.v]
    }
}

pub const BLACK: Hsv = Hsv::new(0.0, 0.0, 0.0);
pub const GRAY: Hsv = Hsv::new(0.0, 0.0, 0.5);
pub const WHITE: Hsv = Hsv::new(0.0, 0.0, 1.0);
pub const RED_1: Hsv = Hsv::new(0.0, 1.0, 1.0);
pub const ORANGE: Hsv = Hsv::new(0.083, 1.0, 1.0);
pub const YELLOW: Hsv = Hsv::new(0.166, 1.0, 1.0);
pub const GREEN: Hsv = Hsv::new(0.333, 1.0, 1.0);
pub const CYAN: Hsv = Hsv::new(0.5, 1.0, 1.0);
pub const BLUE: Hsv = Hsv::new(0.6, 1.0, 1.0);
pub const MAGENTA: Hsv = Hsv::new(0.8, 1.0, 1.0);
pub const PINK: Hsv = Hsv::new(0.9, 1.0, 1.0);
pub const RED_2: Hsv = Hsv::new(1.0, 1.0, 1.0);

/// Global color grading applied after gradient interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorGrading {
    /// Added to the hue, wrapped modulo 1.
    pub hue_shift: f32,
    /// Multiplies saturation.
    pub saturation: f32,
    /// Multiplies value.
    pub value: f32,
}

impl Default for ColorGrading {
    fn default() -> Self {
        Self {
            hue_shift: 0.0,
            saturation: 1.0,
            value: 1.0,
        }
    }
}

/// One point on the gradient ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f32, Hsv)", into = "(f32, Hsv)")]
pub struct ColorStop {
    pub position: f32,
    pub color: Hsv,
}

impl ColorStop {
    pub const fn new(position: f32, color: Hsv) -> Self {
        Self { position, color }
    }
}

impl From<(f32, Hsv)> for ColorStop {
    fn from((position, color): (f32, Hsv)) -> Self {
        Self::new(position, color)
    }
}

impl From<ColorStop> for (f32, Hsv) {
    fn from(value: ColorStop) -> Self {
        (value.position, value.color)
    }
}

/// Piecewise-linear color ramp across the keyboard.
///
/// Stops are validated on construction: at least one stop, finite positions
/// within `[0, 1]`, sorted ascending. A table that passes validation always
/// has a bracketing pair for every in-range key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColorStop>", into = "Vec<ColorStop>")]
pub struct ColorGradient {
    stops: Vec<ColorStop>,
}

impl ColorGradient {
    pub fn new(stops: Vec<ColorStop>) -> Result<Self> {
        if stops.is_empty() {
            return Err(PianoVisError::GradientLookup(
                "color gradient needs at least one stop".into(),
            ));
        }
        for stop in &stops {
            if !stop.position.is_finite() || !(0.0..=1.0).contains(&stop.position) {
                return Err(PianoVisError::GradientLookup(format!(
                    "stop position {} is outside [0, 1]",
                    stop.position
                )));
            }
        }
        if stops.windows(2).any(|pair| pair[0].position > pair[1].position) {
            return Err(PianoVisError::GradientLookup(
                "stop positions must be sorted ascending".into(),
            ));
        }
        Ok(Self { stops })
    }

    /// Full hue sweep from red back to red.
    pub fn rainbow() -> Self {
        Self {
            stops: vec![ColorStop::new(0.0, RED_1), ColorStop::new(1.0, RED_2)],
        }
    }

    pub fn stops(&self) -> &[ColorStop] {
        &self.stops
    }

    /// Color of `key` after interpolation and grading.
    pub fn color_for(&self, key: usize, grading: &ColorGrading) -> Result<Rgb> {
        let hsv = self.hsv_for(key)?;
        Ok(hsv.graded(grading).to_rgb())
    }

    fn hsv_for(&self, key: usize) -> Result<Hsv> {
        let (first, last) = match (self.stops.first(), self.stops.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(PianoVisError::GradientLookup(
                    "color gradient has no stops".into(),
                ))
            }
        };
        if self.stops.len() == 1 {
            return Ok(first.color);
        }

        let frac = key as f32 / KEY_COUNT as f32;
        if frac <= first.position {
            return Ok(first.color);
        }
        if frac >= last.position {
            return Ok(last.color);
        }

        let (below, above) = self
            .stops
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .find(|(a, b)| a.position <= frac && frac <= b.position)
            .ok_or_else(|| {
                PianoVisError::GradientLookup(format!("no stops bracket position {frac}"))
            })?;

        let span = above.position - below.position;
        if span <= f32::EPSILON {
            return Ok(above.color);
        }
        Ok(below.color.lerp(above.color, (frac - below.position) / span))
    }
}

impl Default for ColorGradient {
    fn default() -> Self {
        Self::rainbow()
    }
}

impl TryFrom<Vec<ColorStop>> for ColorGradient {
    type Error = PianoVisError;

    fn try_from(value: Vec<ColorStop>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ColorGradient> for Vec<ColorStop> {
    fn from(value: ColorGradient) -> Self {
        value.stops
    }
}
