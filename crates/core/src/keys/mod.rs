//! Static geometry of the 88-key keybed.

use serde::{Deserialize, Serialize};

/// Number of keys on a standard piano.
pub const KEY_COUNT: usize = 88;

/// Number of white keys on a standard piano.
pub const WHITE_KEY_COUNT: usize = 52;

/// MIDI note number of key 0 (the lowest A).
pub const LOWEST_MIDI_NOTE: u8 = 21;

const KEYBOARD_WIDTH_FRACTION: f32 = 0.95;
const KEYBOARD_MARGIN_FRACTION: f32 = 0.025;

/// Returns true if `key` (0 = lowest A) is a white key.
pub fn is_white(key: usize) -> bool {
    // Shift so that 0 lands on C, then test against the black-key pattern.
    let class = (key + 12 - 3) % 12;
    !matches!(class, 1 | 3 | 6 | 8 | 10)
}

/// Number of white keys with an index strictly below `key`.
pub fn white_keys_before(key: usize) -> usize {
    (0..key).filter(|&k| is_white(k)).count()
}

/// Geometry of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyGeometry {
    pub key: usize,
    pub is_white: bool,
    pub x: f32,
    pub width: f32,
}

/// Precomputed horizontal layout for all keys at a given resolution.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    white_key_width: f32,
    x_offset: f32,
    black_width_factor: f32,
    keys: Vec<KeyGeometry>,
}

impl KeyLayout {
    pub fn new(canvas_width: u32, black_width_factor: f32) -> Self {
        let width = canvas_width as f32;
        let white_key_width = width * KEYBOARD_WIDTH_FRACTION / WHITE_KEY_COUNT as f32;
        let x_offset = width * KEYBOARD_MARGIN_FRACTION;

        let mut layout = Self {
            white_key_width,
            x_offset,
            black_width_factor,
            keys: Vec::with_capacity(KEY_COUNT),
        };
        layout.keys = (0..KEY_COUNT)
            .map(|key| {
                let white = is_white(key);
                KeyGeometry {
                    key,
                    is_white: white,
                    x: layout.x_position(key),
                    width: if white {
                        white_key_width
                    } else {
                        white_key_width * black_width_factor
                    },
                }
            })
            .collect();
        layout
    }

    /// Horizontal offset of the left edge of `key`. Black keys are centred
    /// on the boundary between their neighbouring white keys.
    pub fn x_position(&self, key: usize) -> f32 {
        let mut x = self.x_offset + self.white_key_width * white_keys_before(key) as f32;
        if !is_white(key) {
            x -= self.white_key_width * self.black_width_factor / 2.0;
        }
        x
    }

    pub fn white_key_width(&self) -> f32 {
        self.white_key_width
    }

    pub fn black_width_factor(&self) -> f32 {
        self.black_width_factor
    }

    pub fn key(&self, key: usize) -> Option<&KeyGeometry> {
        self.keys.get(key)
    }

    pub fn keys(&self) -> &[KeyGeometry] {
        &self.keys
    }

    /// Keys in draw order: white keys first so black keys end up on top.
    pub fn draw_order(&self) -> impl Iterator<Item = &KeyGeometry> {
        self.keys
            .iter()
            .filter(|k| k.is_white)
            .chain(self.keys.iter().filter(|k| !k.is_white))
    }
}
