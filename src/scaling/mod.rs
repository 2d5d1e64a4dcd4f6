//! Scaling function seam
//!
//! The store never decodes images itself; it hands the original bytes and
//! normalized parameters to a [`Scaler`] and caches whatever comes back.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::ScaleGenerationError;
use crate::models::ScaleParameters;

pub mod image_scaler;

pub use image_scaler::{
    CropRect, DEFAULT_MAX_OUTPUT_PIXELS, ImageScaler, LOSSLESS_QUALITY, ScalePlan, plan_scale,
};

/// Output of one scaling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaledImage {
    pub data: Bytes,
    /// Actual (width, height) of `data`
    pub dimensions: (u32, u32),
    pub mimetype: String,
}

/// Pure function from original bytes and parameters to an encoded scale
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Collapse parameters that produce identical output for this original
    /// into one canonical tuple. The default keeps them as they are.
    fn canonical_parameters(
        &self,
        _original: &[u8],
        parameters: ScaleParameters,
    ) -> ScaleParameters {
        parameters
    }

    async fn scale(
        &self,
        original: Bytes,
        parameters: &ScaleParameters,
    ) -> Result<ScaledImage, ScaleGenerationError>;
}
