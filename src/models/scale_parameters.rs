//! Scaling parameters and their normalization
//!
//! Callers describe a scale with a [`ScaleRequest`] where every field is
//! optional. Before touching the index the request is normalized into
//! [`ScaleParameters`], so that an omitted value and its explicit default
//! resolve to the same cache entry:
//!
//! - a width or height of `0` is treated as absent
//! - an omitted direction becomes the configured default (`down`)
//! - an omitted quality becomes the configured default (88), explicit
//!   values are clamped to `1..=100`

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use strum::{Display, EnumString};

pub const DEFAULT_QUALITY: u8 = 88;

/// How the original is fitted into the requested box
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    /// Crop to the requested aspect ratio, shrink to fit, never enlarge
    #[default]
    #[serde(alias = "scale-crop-to-fit")]
    #[strum(to_string = "down", serialize = "scale-crop-to-fit")]
    Down,
    /// Crop to the requested aspect ratio and fill the box, enlarging if needed
    #[serde(alias = "scale-crop-to-fill")]
    #[strum(to_string = "up", serialize = "scale-crop-to-fill")]
    Up,
    /// Fit inside the box keeping the aspect ratio, no cropping
    #[serde(alias = "keep")]
    #[strum(to_string = "thumbnail", serialize = "keep")]
    Thumbnail,
}

/// Values substituted for omitted request fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDefaults {
    pub direction: Direction,
    pub quality: u8,
}

impl Default for ScaleDefaults {
    fn default() -> Self {
        Self {
            direction: Direction::default(),
            quality: DEFAULT_QUALITY,
        }
    }
}

/// A caller's scale request, as expressed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub direction: Option<Direction>,
    pub quality: Option<u8>,
}

impl ScaleRequest {
    /// Request a box of `width` x `height` with default direction and quality
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Resolve omitted and degenerate values into the canonical parameter tuple
    pub fn normalize(&self, defaults: &ScaleDefaults) -> ScaleParameters {
        ScaleParameters {
            width: self.width.filter(|w| *w > 0),
            height: self.height.filter(|h| *h > 0),
            direction: self.direction.unwrap_or(defaults.direction),
            quality: self.quality.unwrap_or(defaults.quality).clamp(1, 100),
        }
    }
}

/// Normalized parameter tuple; the key of the scale index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleParameters {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub direction: Direction,
    pub quality: u8,
}

impl ScaleParameters {
    /// Hex SHA-256 over the canonical form of the tuple
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "w={};h={};d={};q={}",
            self.width.map(|w| w.to_string()).unwrap_or_default(),
            self.height.map(|h| h.to_string()).unwrap_or_default(),
            self.direction,
            self.quality
        );
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

impl fmt::Display for ScaleParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<u32>| v.map(|v| v.to_string()).unwrap_or_else(|| "auto".into());
        write!(
            f,
            "{}x{} {} q{}",
            side(self.width),
            side(self.height),
            self.direction,
            self.quality
        )
    }
}
