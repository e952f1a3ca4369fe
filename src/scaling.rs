//! Bitmap rescaling used to synthesize secondary favicons.

use std::fmt;

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::ScaleError;

/// Produces a square bitmap of a given edge length from a source bitmap.
pub trait Scaler: Send + Sync + fmt::Debug {
    fn scale(&self, source: &DynamicImage, edge: u32) -> Result<DynamicImage, ScaleError>;
}

/// Resampling filter, as named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ScaleFilter> for FilterType {
    fn from(filter: ScaleFilter) -> Self {
        match filter {
            ScaleFilter::Nearest => FilterType::Nearest,
            ScaleFilter::Triangle => FilterType::Triangle,
            ScaleFilter::CatmullRom => FilterType::CatmullRom,
            ScaleFilter::Gaussian => FilterType::Gaussian,
            ScaleFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// [`Scaler`] backed by the `image` crate's resampling.
#[derive(Debug, Clone, Copy)]
pub struct ImageScaler {
    filter: FilterType,
}

impl ImageScaler {
    pub fn new(filter: ScaleFilter) -> Self {
        Self {
            filter: filter.into(),
        }
    }
}

impl Default for ImageScaler {
    fn default() -> Self {
        Self::new(ScaleFilter::default())
    }
}

impl Scaler for ImageScaler {
    fn scale(&self, source: &DynamicImage, edge: u32) -> Result<DynamicImage, ScaleError> {
        if source.width() == 0 || source.height() == 0 {
            return Err(ScaleError::EmptySource {
                width: source.width(),
                height: source.height(),
            });
        }
        if edge == 0 {
            return Err(ScaleError::ZeroTarget);
        }
        Ok(source.resize_exact(edge, edge, self.filter))
    }
}

/// How a primary of one size is turned into a bitmap for a requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePlan {
    /// Primary is at least as large as the target.
    Downscale { edge: u32 },
    /// Target is reachable within a 2x upscale.
    Upscale { edge: u32 },
    /// Target is beyond 2x; upscale to 2x only.
    BestEffortUpscale { edge: u32 },
}

impl ScalePlan {
    pub fn for_sizes(primary_size: u32, target_size: u32) -> Self {
        if primary_size >= target_size {
            return Self::Downscale { edge: target_size };
        }
        let ceiling = primary_size.saturating_mul(2);
        if ceiling >= target_size {
            Self::Upscale { edge: target_size }
        } else {
            Self::BestEffortUpscale { edge: ceiling }
        }
    }

    /// Edge length of the bitmap this plan produces.
    pub fn edge(self) -> u32 {
        match self {
            Self::Downscale { edge } | Self::Upscale { edge } | Self::BestEffortUpscale { edge } => {
                edge
            }
        }
    }

    /// Whether the result only approximates the requested size.
    pub fn is_approximate(self) -> bool {
        matches!(self, Self::BestEffortUpscale { .. })
    }
}
