//! Codec layer: encode RGBA pixels into the requested format.
//!
//! | Format | Encoder | Quality parameter |
//! |---|---|---|
//! | jpg | `image::codecs::jpeg::JpegEncoder` (RGB8) | `round(40 + q/100 × 52)` |
//! | png | `image::codecs::png::PngEncoder` | level `round(q/100 × 9)`, bucketed into Fast / Default / Best |
//! | webp | `webp` (libwebp) lossy, or lossless + near-lossless preprocessing | same as jpg |
//! | avif | [`TwoTierAvif`] | `q` unchanged, speed from pixel count |
//!
//! jpg/png/webp are a single direct call. AVIF may substitute the configured
//! fallback format when both tiers fail; the returned [`EncodedImage::format`]
//! always names what was actually written.

use super::avif::TwoTierAvif;
use super::params::{EncodeParams, Quality};
use crate::config::AvifConfig;
use crate::types::EncodeFormat;
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageEncoder, RgbImage, RgbaImage};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Encoder failures, one user-facing message per kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Image is too large to encode as AVIF ({width}x{height}px). Reduce its size.")]
    ImageTooLarge { width: u32, height: u32 },
    #[error("AVIF encoding timed out. Reduce the image size or lower the quality.")]
    Timeout,
    #[error("AVIF encoding ran out of memory. Reduce the image size.")]
    OutOfMemory,
    #[error("Failed to load the AVIF encoder module: {0}")]
    ModuleLoadFailure(String),
    #[error("Failed to fetch the AVIF encoder, check the network connection: {0}")]
    NetworkFailure(String),
    #[error("Encoding failed: {0}")]
    Unknown(String),
}

impl EncodeError {
    /// Sort a raw encoder message into an actionable kind by keyword.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["timeout", "timed out"]) {
            EncodeError::Timeout
        } else if has(&["memory", "alloc"]) {
            EncodeError::OutOfMemory
        } else if has(&["wasm", "webassembly", "module"]) {
            EncodeError::ModuleLoadFailure(message.to_string())
        } else if has(&["fetch", "network"]) {
            EncodeError::NetworkFailure(message.to_string())
        } else {
            EncodeError::Unknown(message.to_string())
        }
    }
}

/// Encoded bytes plus the format that was actually written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: EncodeFormat,
}

/// Format-aware encoder. One per session; holds the AVIF tier caches.
pub struct Codec {
    avif: TwoTierAvif,
    fallback_format: Option<EncodeFormat>,
}

impl Codec {
    pub fn new(config: &AvifConfig) -> Self {
        Self::with_avif(TwoTierAvif::new(config), config.fallback_format)
    }

    pub fn with_avif(avif: TwoTierAvif, fallback_format: Option<EncodeFormat>) -> Self {
        Self {
            avif,
            fallback_format: fallback_format.filter(|f| *f != EncodeFormat::Avif),
        }
    }

    pub async fn encode(
        &self,
        pixels: Arc<RgbaImage>,
        params: EncodeParams,
    ) -> Result<EncodedImage, EncodeError> {
        if params.format != EncodeFormat::Avif {
            return encode_blocking(pixels, params).await;
        }

        match self.avif.encode(Arc::clone(&pixels), params.quality).await {
            Ok(bytes) => Ok(EncodedImage {
                bytes,
                format: EncodeFormat::Avif,
            }),
            Err(err @ EncodeError::ImageTooLarge { .. }) => Err(err),
            Err(err) => match self.fallback_format {
                Some(fallback) => {
                    warn!(%err, %fallback, "AVIF encoding failed, substituting fallback format");
                    let params = EncodeParams {
                        format: fallback,
                        ..params
                    };
                    encode_blocking(pixels, params).await
                }
                None => Err(err),
            },
        }
    }
}

async fn encode_blocking(
    pixels: Arc<RgbaImage>,
    params: EncodeParams,
) -> Result<EncodedImage, EncodeError> {
    let bytes = tokio::task::spawn_blocking(move || encode_direct(&pixels, params))
        .await
        .map_err(|e| EncodeError::Unknown(e.to_string()))??;
    Ok(EncodedImage {
        bytes,
        format: params.format,
    })
}

/// Single-call encode for jpg, png and webp.
pub fn encode_direct(pixels: &RgbaImage, params: EncodeParams) -> Result<Vec<u8>, EncodeError> {
    match params.format {
        EncodeFormat::Jpg => encode_jpeg(pixels, params.quality),
        EncodeFormat::Png => encode_png(pixels, params.quality),
        EncodeFormat::Webp => encode_webp(pixels, params.quality, params.near_lossless),
        EncodeFormat::Avif => Err(EncodeError::Unknown(
            "AVIF must go through the two-tier encoder".into(),
        )),
    }
}

fn encode_jpeg(pixels: &RgbaImage, quality: Quality) -> Result<Vec<u8>, EncodeError> {
    // JPEG has no alpha channel
    let rgb: RgbImage = pixels.convert();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.lossy())
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| EncodeError::Unknown(format!("JPEG: {e}")))?;
    Ok(out)
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn encode_png(pixels: &RgbaImage, quality: Quality) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    PngEncoder::new_with_quality(
        &mut out,
        png_compression(quality.png_level()),
        FilterType::Adaptive,
    )
    .write_image(
        pixels.as_raw(),
        pixels.width(),
        pixels.height(),
        image::ExtendedColorType::Rgba8,
    )
    .map_err(|e| EncodeError::Unknown(format!("PNG: {e}")))?;
    Ok(out)
}

/// Largest side libwebp accepts.
const WEBP_MAX_DIMENSION: u32 = 16383;

fn encode_webp(
    pixels: &RgbaImage,
    quality: Quality,
    near_lossless: bool,
) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = pixels.dimensions();
    if width > WEBP_MAX_DIMENSION || height > WEBP_MAX_DIMENSION {
        return Err(EncodeError::Unknown(format!(
            "WebP: {width}x{height}px exceeds the {WEBP_MAX_DIMENSION}px limit per side"
        )));
    }
    let encoder = webp::Encoder::from_rgba(pixels.as_raw(), width, height);
    let lossy = quality.lossy();

    if !near_lossless {
        return encoder
            .encode_simple(false, lossy as f32)
            .map(|mem| mem.to_vec())
            .map_err(|e| EncodeError::Unknown(format!("WebP: {e:?}")));
    }

    let mut config = webp::WebPConfig::new()
        .map_err(|_| EncodeError::Unknown("WebP: could not initialise encoder config".into()))?;
    config.lossless = 1;
    config.quality = lossy as f32;
    config.near_lossless = lossy as i32;
    encoder
        .encode_advanced(&config)
        .map(|mem| mem.to_vec())
        .map_err(|e| EncodeError::Unknown(format!("WebP: {e:?}")))
}
