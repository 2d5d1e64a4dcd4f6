//! Scaler backed by the `image` crate
//!
//! Geometry is decided up front by [`plan_scale`] and then applied as an
//! optional centred crop followed by a resize:
//!
//! - `down`: crop to the requested aspect ratio, shrink into the box, never enlarge
//! - `up`: crop to the requested aspect ratio, resize to exactly the box
//! - `thumbnail`: fit inside the box keeping the aspect ratio, never enlarge
//!
//! With only one side given the other follows the aspect ratio and no crop
//! happens; only `up` may enlarge. Plans larger than the scaler's pixel
//! limit are rejected before anything is allocated.
//!
//! PNG and GIF originals are written as PNG to keep transparency, everything
//! else as JPEG at the requested quality. Quality has no effect on PNG output,
//! so for those originals it is pinned to [`LOSSLESS_QUALITY`] and all
//! quality values share one cache entry.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

use super::{ScaledImage, Scaler};
use crate::errors::ScaleGenerationError;
use crate::models::{Direction, ScaleParameters};

/// Largest output accepted by default, in pixels (width x height)
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 40_000_000;

/// Quality recorded for scales whose output format ignores it
pub const LOSSLESS_QUALITY: u8 = 100;

/// Region of the original kept before resizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Crop then resize to `width` x `height`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePlan {
    pub crop: Option<CropRect>,
    pub width: u32,
    pub height: u32,
}

/// Work out crop and output size for an original of `original` pixels,
/// rejecting outputs of more than `max_pixels` pixels
pub fn plan_scale(
    original: (u32, u32),
    parameters: &ScaleParameters,
    max_pixels: u64,
) -> Result<ScalePlan, ScaleGenerationError> {
    let plan = plan_geometry(original, parameters)?;
    let pixels = plan.width as u64 * plan.height as u64;
    if pixels > max_pixels {
        return Err(ScaleGenerationError::invalid_parameters(format!(
            "output of {}x{} exceeds the limit of {} pixels",
            plan.width, plan.height, max_pixels
        )));
    }
    Ok(plan)
}

fn plan_geometry(
    original: (u32, u32),
    parameters: &ScaleParameters,
) -> Result<ScalePlan, ScaleGenerationError> {
    let (ow, oh) = original;
    if ow == 0 || oh == 0 {
        return Err(ScaleGenerationError::invalid_parameters(
            "original image has no pixels",
        ));
    }

    let may_enlarge = parameters.direction == Direction::Up;

    match (parameters.width, parameters.height) {
        (None, None) => Err(ScaleGenerationError::invalid_parameters(
            "at least one of width or height is required",
        )),
        (Some(w), None) => Ok(proportional(original, w as f64 / ow as f64, may_enlarge)),
        (None, Some(h)) => Ok(proportional(original, h as f64 / oh as f64, may_enlarge)),
        (Some(w), Some(h)) => match parameters.direction {
            Direction::Thumbnail => {
                let factor = (w as f64 / ow as f64).min(h as f64 / oh as f64);
                Ok(proportional(original, factor, false))
            }
            Direction::Up => Ok(ScalePlan {
                crop: centre_crop(original, (w, h)),
                width: w,
                height: h,
            }),
            Direction::Down => {
                let crop = centre_crop(original, (w, h));
                let (cw, ch) = crop.map(|c| (c.width, c.height)).unwrap_or(original);
                let (width, height) = if cw > w || ch > h { (w, h) } else { (cw, ch) };
                Ok(ScalePlan {
                    crop,
                    width,
                    height,
                })
            }
        },
    }
}

fn proportional((ow, oh): (u32, u32), factor: f64, may_enlarge: bool) -> ScalePlan {
    let factor = if may_enlarge { factor } else { factor.min(1.0) };
    let side = |v: u32| ((v as f64 * factor).round() as u32).max(1);
    ScalePlan {
        crop: None,
        width: side(ow),
        height: side(oh),
    }
}

/// Largest centred region of the original with the aspect ratio of `target`
fn centre_crop((ow, oh): (u32, u32), (tw, th): (u32, u32)) -> Option<CropRect> {
    let (ow64, oh64, tw64, th64) = (ow as u64, oh as u64, tw as u64, th as u64);

    if ow64 * th64 > oh64 * tw64 {
        let width = ((oh64 * tw64 + th64 / 2) / th64).clamp(1, ow64) as u32;
        (width != ow).then(|| CropRect {
            x: (ow - width) / 2,
            y: 0,
            width,
            height: oh,
        })
    } else if ow64 * th64 < oh64 * tw64 {
        let height = ((ow64 * th64 + tw64 / 2) / tw64).clamp(1, oh64) as u32;
        (height != oh).then(|| CropRect {
            x: 0,
            y: (oh - height) / 2,
            width: ow,
            height,
        })
    } else {
        None
    }
}

/// PNG and GIF originals are re-encoded as PNG
fn encodes_losslessly(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Png | ImageFormat::Gif)
}

/// Scaler decoding, resizing and re-encoding with the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct ImageScaler {
    filter: FilterType,
    max_output_pixels: u64,
}

impl Default for ImageScaler {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

impl ImageScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_output_pixels(mut self, max_output_pixels: u64) -> Self {
        self.max_output_pixels = max_output_pixels;
        self
    }

    pub fn max_output_pixels(&self) -> u64 {
        self.max_output_pixels
    }

    fn scale_blocking(
        &self,
        original: &[u8],
        parameters: &ScaleParameters,
    ) -> Result<ScaledImage, ScaleGenerationError> {
        let format = image::guess_format(original)
            .map_err(|e| ScaleGenerationError::Decode(e.to_string()))?;
        let img = image::load_from_memory_with_format(original, format)
            .map_err(|e| ScaleGenerationError::Decode(e.to_string()))?;

        let plan = plan_scale(
            (img.width(), img.height()),
            parameters,
            self.max_output_pixels,
        )?;
        let cropped = match plan.crop {
            Some(c) => img.crop_imm(c.x, c.y, c.width, c.height),
            None => img,
        };
        let scaled = if (cropped.width(), cropped.height()) == (plan.width, plan.height) {
            cropped
        } else {
            cropped.resize_exact(plan.width, plan.height, self.filter)
        };

        let (data, mimetype) = if encodes_losslessly(format) {
            (encode_png(&scaled)?, "image/png")
        } else {
            (encode_jpeg(&scaled, parameters.quality)?, "image/jpeg")
        };

        debug!(
            "Scaled {:?} original to {}x{} {} ({} bytes)",
            format,
            scaled.width(),
            scaled.height(),
            mimetype,
            data.len()
        );

        Ok(ScaledImage {
            data: Bytes::from(data),
            dimensions: (scaled.width(), scaled.height()),
            mimetype: mimetype.to_string(),
        })
    }
}

#[async_trait]
impl Scaler for ImageScaler {
    fn canonical_parameters(
        &self,
        original: &[u8],
        mut parameters: ScaleParameters,
    ) -> ScaleParameters {
        if image::guess_format(original).is_ok_and(encodes_losslessly) {
            parameters.quality = LOSSLESS_QUALITY;
        }
        parameters
    }

    async fn scale(
        &self,
        original: Bytes,
        parameters: &ScaleParameters,
    ) -> Result<ScaledImage, ScaleGenerationError> {
        let scaler = *self;
        let parameters = parameters.clone();
        tokio::task::spawn_blocking(move || scaler.scale_blocking(&original, &parameters))
            .await
            .map_err(|e| ScaleGenerationError::Task(e.to_string()))?
    }
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ScaleGenerationError> {
    let mut png_bytes = Vec::new();
    let mut cursor = Cursor::new(&mut png_bytes);
    img.write_to(&mut cursor, ImageFormat::Png)
        .map_err(|e| ScaleGenerationError::Encode(e.to_string()))?;
    Ok(png_bytes)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ScaleGenerationError> {
    let rgb = img.to_rgb8();
    let mut jpeg_bytes = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
        encoder
            .encode_image(&rgb)
            .map_err(|e| ScaleGenerationError::Encode(e.to_string()))?;
    }
    Ok(jpeg_bytes)
}
