//! Resize engine: fit decoded pixels inside a maximum dimension.

use super::calculations::fit_within;
use super::params::Sharpening;
use image::DynamicImage;
use image::imageops::FilterType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResizeError {
    #[error("Cannot resize an empty image ({width}x{height})")]
    EmptySource { width: u32, height: u32 },
    #[error("Maximum dimension must be positive")]
    InvalidMaxDimension,
}

/// Downscale `img` so neither edge exceeds `max_dimension`.
///
/// Images already inside the bound are returned as an identical copy with no
/// resampling. Larger images are resampled with Lanczos3 and then lightly
/// sharpened (see [`Sharpening::downscale`]).
pub fn resize(img: &DynamicImage, max_dimension: u32) -> Result<DynamicImage, ResizeError> {
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(ResizeError::EmptySource { width, height });
    }
    if max_dimension == 0 {
        return Err(ResizeError::InvalidMaxDimension);
    }

    let (target_w, target_h) = fit_within((width, height), max_dimension);
    if (target_w, target_h) == (width, height) {
        return Ok(img.clone());
    }

    let resized = img.resize_exact(target_w, target_h, FilterType::Lanczos3);
    let sharpening = Sharpening::downscale();
    Ok(resized.unsharpen(sharpening.sigma, sharpening.threshold))
}
