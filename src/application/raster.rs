//! Interface to the external raster and vector post-processing tools.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use super::automation::BoundingBox;

pub const DEFAULT_PALETTE_COLORS: u32 = 256;
const THUMBNAIL_BORDER_PX: u32 = 2;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("post-processing tool unavailable: {0}")]
    NotFound(io::Error),
    #[error("post-processing i/o failed: {0}")]
    Io(io::Error),
    #[error("post-processing tool failed (exit {exit_code:?}): {stderr}")]
    Cli {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("post-processing timed out after {0:?}")]
    Timeout(Duration),
}

/// Crop rectangle in raster pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// Thumbnail crop: the zoom area less one pixel on each horizontal edge.
    pub fn from_zoom_area(area: &BoundingBox) -> Self {
        Self {
            x: (area.x + 1.0).round() as i64,
            y: area.y.round() as i64,
            width: (area.width - 2.0).round().max(1.0) as u32,
            height: area.height.round().max(1.0) as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Border {
    pub color: String,
    pub width: u32,
}

/// Declarative raster transform. Steps apply in field order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RasterTransform {
    pub crop: Option<CropRegion>,
    /// Exact target size; aspect ratio is not preserved.
    pub resize: Option<(u32, u32)>,
    pub border: Option<Border>,
    /// Remap onto this palette image.
    pub palette: Option<PathBuf>,
    pub colors: Option<u32>,
}

impl RasterTransform {
    /// Plain format conversion (e.g. SVG to PNG).
    pub fn convert() -> Self {
        Self::default()
    }

    pub fn quantize(palette: &Path) -> Self {
        Self {
            palette: Some(palette.to_path_buf()),
            colors: Some(DEFAULT_PALETTE_COLORS),
            ..Self::default()
        }
    }

    pub fn thumbnail(
        crop: CropRegion,
        size: (u32, u32),
        border_color: impl Into<String>,
        palette: &Path,
    ) -> Self {
        Self {
            crop: Some(crop),
            resize: Some(size),
            border: Some(Border {
                color: border_color.into(),
                width: THUMBNAIL_BORDER_PX,
            }),
            ..Self::quantize(palette)
        }
    }
}

#[async_trait]
pub trait RasterTool: Send + Sync {
    /// Apply `transform` to `source`, writing the result to `output`. `source`
    /// and `output` may be the same path.
    async fn transform(
        &self,
        source: &Path,
        output: &Path,
        transform: &RasterTransform,
    ) -> Result<(), RasterError>;
}

#[async_trait]
pub trait SvgOptimizer: Send + Sync {
    /// Optimise the SVG at `path` in place.
    async fn optimize(&self, path: &Path) -> Result<(), RasterError>;
}
