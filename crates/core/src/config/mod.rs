use std::{fmt, path::Path, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    color::{ColorGradient, ColorGrading, Rgb},
    PianoVisError, Result,
};

/// Rendering options. Every field has a default; the flat `section.field`
/// key surface is exposed through [`RenderOptions::set`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RenderOptions {
    pub keys: KeyOptions,
    pub blocks: BlockOptions,
    pub grading: ColorGrading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct KeyOptions {
    pub white: WhiteKeyOptions,
    pub black: BlackKeyOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WhiteKeyOptions {
    /// Horizontal gap in pixels between neighbouring white keys.
    pub gap: f32,
    pub color: Rgb,
}

impl Default for WhiteKeyOptions {
    fn default() -> Self {
        Self {
            gap: 2.0,
            color: Rgb::new(215, 215, 210),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlackKeyOptions {
    /// Black key width relative to a white key.
    pub width_fac: f32,
    /// Black key height relative to a white key.
    pub height_fac: f32,
    pub color: Rgb,
}

impl Default for BlackKeyOptions {
    fn default() -> Self {
        Self {
            width_fac: 0.6,
            height_fac: 0.65,
            color: Rgb::new(64, 64, 64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockOptions {
    /// Falling speed in pixels per second.
    pub speed: f32,
    pub color_grad: ColorGradient,
    /// Corner radius in pixels.
    pub rounding: u32,
    pub motion_blur: bool,
    pub glow: bool,
    pub border: BorderOptions,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            speed: 180.0,
            color_grad: ColorGradient::rainbow(),
            rounding: 5,
            motion_blur: true,
            glow: false,
            border: BorderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BorderOptions {
    /// Outline width in pixels; 0 disables the outline.
    pub width: u32,
    pub color: Rgb,
}

impl Default for BorderOptions {
    fn default() -> Self {
        Self {
            width: 0,
            color: Rgb::WHITE,
        }
    }
}

/// Enumerated flat configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    WhiteGap,
    WhiteColor,
    BlackWidthFac,
    BlackHeightFac,
    BlackColor,
    BlockSpeed,
    BlockColorGrad,
    BlockRounding,
    BlockMotionBlur,
    BlockGlow,
    BorderWidth,
    BorderColor,
    HueShift,
    Saturation,
    Value,
}

impl OptionKey {
    pub const ALL: [OptionKey; 15] = [
        OptionKey::WhiteGap,
        OptionKey::WhiteColor,
        OptionKey::BlackWidthFac,
        OptionKey::BlackHeightFac,
        OptionKey::BlackColor,
        OptionKey::BlockSpeed,
        OptionKey::BlockColorGrad,
        OptionKey::BlockRounding,
        OptionKey::BlockMotionBlur,
        OptionKey::BlockGlow,
        OptionKey::BorderWidth,
        OptionKey::BorderColor,
        OptionKey::HueShift,
        OptionKey::Saturation,
        OptionKey::Value,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OptionKey::WhiteGap => "keys.white.gap",
            OptionKey::WhiteColor => "keys.white.color",
            OptionKey::BlackWidthFac => "keys.black.width_fac",
            OptionKey::BlackHeightFac => "keys.black.height_fac",
            OptionKey::BlackColor => "keys.black.color",
            OptionKey::BlockSpeed => "blocks.speed",
            OptionKey::BlockColorGrad => "blocks.color_grad",
            OptionKey::BlockRounding => "blocks.rounding",
            OptionKey::BlockMotionBlur => "blocks.motion_blur",
            OptionKey::BlockGlow => "blocks.glow",
            OptionKey::BorderWidth => "blocks.border.width",
            OptionKey::BorderColor => "blocks.border.color",
            OptionKey::HueShift => "grading.hue_shift",
            OptionKey::Saturation => "grading.saturation",
            OptionKey::Value => "grading.value",
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionKey {
    type Err = PianoVisError;

    fn from_str(s: &str) -> Result<Self> {
        OptionKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| PianoVisError::Config(format!("unknown option `{s}`")))
    }
}

impl RenderOptions {
    /// Loads a full option set from a JSON file. Missing fields keep their
    /// defaults, unknown fields are rejected.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let options: RenderOptions = serde_json::from_str(&raw)
            .map_err(|err| PianoVisError::Config(format!("{}: {err}", path.as_ref().display())))?;
        options.validate()?;
        Ok(options)
    }

    /// Sets a single option from its flat key and a JSON-encoded value,
    /// e.g. `set("keys.white.color", "[255, 255, 255]")`.
    pub fn set(&mut self, key: &str, raw_value: &str) -> Result<()> {
        let key: OptionKey = key.parse()?;
        let value: serde_json::Value = serde_json::from_str(raw_value)
            .map_err(|err| PianoVisError::Config(format!("invalid value for `{key}`: {err}")))?;
        self.set_value(key, value)
    }

    /// Parses a `key=value` assignment as accepted on the command line.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            PianoVisError::Config(format!("expected `key=value`, got `{assignment}`"))
        })?;
        self.set(key.trim(), value.trim())
    }

    pub fn set_value(&mut self, key: OptionKey, value: serde_json::Value) -> Result<()> {
        let mut next = self.clone();
        match key {
            OptionKey::WhiteGap => next.keys.white.gap = decode(key, value)?,
            OptionKey::WhiteColor => next.keys.white.color = decode(key, value)?,
            OptionKey::BlackWidthFac => next.keys.black.width_fac = decode(key, value)?,
            OptionKey::BlackHeightFac => next.keys.black.height_fac = decode(key, value)?,
            OptionKey::BlackColor => next.keys.black.color = decode(key, value)?,
            OptionKey::BlockSpeed => next.blocks.speed = decode(key, value)?,
            OptionKey::BlockColorGrad => next.blocks.color_grad = decode(key, value)?,
            OptionKey::BlockRounding => next.blocks.rounding = decode(key, value)?,
            OptionKey::BlockMotionBlur => next.blocks.motion_blur = decode(key, value)?,
            OptionKey::BlockGlow => next.blocks.glow = decode(key, value)?,
            OptionKey::BorderWidth => next.blocks.border.width = decode(key, value)?,
            OptionKey::BorderColor => next.blocks.border.color = decode(key, value)?,
            OptionKey::HueShift => next.grading.hue_shift = decode(key, value)?,
            OptionKey::Saturation => next.grading.saturation = decode(key, value)?,
            OptionKey::Value => next.grading.value = decode(key, value)?,
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: OptionKey, v: f32| {
            if v.is_finite() && v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(PianoVisError::Config(format!("`{name}` must be in (0, 1], got {v}")))
            }
        };
        unit(OptionKey::BlackWidthFac, self.keys.black.width_fac)?;
        unit(OptionKey::BlackHeightFac, self.keys.black.height_fac)?;

        if !self.keys.white.gap.is_finite() || self.keys.white.gap < 0.0 {
            return Err(PianoVisError::Config(format!(
                "`{}` must be non-negative",
                OptionKey::WhiteGap
            )));
        }
        if !self.blocks.speed.is_finite() || self.blocks.speed <= 0.0 {
            return Err(PianoVisError::Config(format!(
                "`{}` must be positive",
                OptionKey::BlockSpeed
            )));
        }
        let grading = &self.grading;
        if !(grading.hue_shift.is_finite()
            && grading.saturation.is_finite()
            && grading.value.is_finite()
            && grading.saturation >= 0.0
            && grading.value >= 0.0)
        {
            return Err(PianoVisError::Config(
                "grading offsets must be finite and scales non-negative".into(),
            ));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: OptionKey, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| PianoVisError::Config(format!("invalid value for `{key}`: {err}")))
}

/// Output geometry and timing shared by every frame of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames added before the first MIDI event.
    pub offset_frames: f32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            offset_frames: 0.0,
        }
    }
}

impl VideoSettings {
    pub fn new(width: u32, height: u32, fps: u32, offset_frames: f32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PianoVisError::Config(format!(
                "resolution must be non-zero, got {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(PianoVisError::Config("fps must be positive".into()));
        }
        if !offset_frames.is_finite() {
            return Err(PianoVisError::Config("offset must be finite".into()));
        }
        Ok(Self {
            width,
            height,
            fps,
            offset_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{ColorStop, BLUE, RED_1};

    #[test]
    fn every_key_round_trips_through_its_name() {
        for key in OptionKey::ALL {
            assert_eq!(key.as_str().parse::<OptionKey>().unwrap(), key);
        }
    }

    #[test]
    fn sets_typed_values() {
        let mut options = RenderOptions::default();
        options.set("blocks.speed", "240").unwrap();
        options.set("keys.white.color", "[255, 250, 240]").unwrap();
        options.set("blocks.glow", "true").unwrap();
        options.apply_assignment("blocks.border.width = 2").unwrap();

        assert_eq!(options.blocks.speed, 240.0);
        assert_eq!(options.keys.white.color, Rgb::new(255, 250, 240));
        assert!(options.blocks.glow);
        assert_eq!(options.blocks.border.width, 2);
    }

    #[test]
    fn sets_gradient_from_json() {
        let mut options = RenderOptions::default();
        options
            .set("blocks.color_grad", "[[0.0, [0.0, 1.0, 1.0]], [1.0, [0.6, 1.0, 1.0]]]")
            .unwrap();
        assert_eq!(
            options.blocks.color_grad.stops(),
            &[ColorStop::new(0.0, RED_1), ColorStop::new(1.0, BLUE)]
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut options = RenderOptions::default();
        let err = options.set("blocks.sparkle", "true").unwrap_err();
        assert!(matches!(err, PianoVisError::Config(_)));
        assert!(format!("{err}").contains("blocks.sparkle"));
    }

    #[test]
    fn rejects_ill_typed_values_without_mutating() {
        let mut options = RenderOptions::default();
        assert!(options.set("blocks.speed", "\"fast\"").is_err());
        assert!(options.set("blocks.speed", "-3").is_err());
        assert!(options.set("keys.black.width_fac", "1.5").is_err());
        assert!(options.set("blocks.color_grad", "[]").is_err());
        assert_eq!(options, RenderOptions::default());
    }

    #[test]
    fn loads_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"blocks": {"speed": 90.0, "glow": true}}"#).unwrap();

        let options = RenderOptions::from_json_file(&path).unwrap();
        assert_eq!(options.blocks.speed, 90.0);
        assert!(options.blocks.glow);
        assert_eq!(options.keys, KeyOptions::default());
    }

    #[test]
    fn json_file_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"blocks": {"sped": 90.0}}"#).unwrap();
        assert!(RenderOptions::from_json_file(&path).is_err());
    }

    #[test]
    fn video_settings_reject_degenerate_values() {
        assert!(VideoSettings::new(0, 1080, 30, 0.0).is_err());
        assert!(VideoSettings::new(1920, 1080, 0, 0.0).is_err());
        assert!(VideoSettings::new(1920, 1080, 30, f32::NAN).is_err());
        assert!(VideoSettings::new(1920, 1080, 30, 15.0).is_ok());
    }
}
