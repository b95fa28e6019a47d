//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the three pixel operations the
//! scheduler drives for every file: decode, resize, and encode. Each is an
//! async suspension point so many files can be in flight at once.
//!
//! The production implementation is [`RustBackend`]: pure Rust decoders and
//! resampling from the `image` crate, run on tokio's blocking pool, with
//! encoding delegated to the [`Codec`] layer.

use super::codec::{Codec, EncodeError, EncodedImage};
use super::decode::{DecodeError, decode};
use super::params::EncodeParams;
use super::resize::{ResizeError, resize};
use crate::config::AvifConfig;
use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Resize(#[from] ResizeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for BackendError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackendError::Worker(err.to_string())
    }
}

/// Trait for image processing backends.
///
/// The scheduler depends only on this trait, so tests can swap in a mock
/// that records calls without touching real codecs.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Decode source bytes, applying EXIF orientation.
    async fn decode(&self, bytes: Arc<[u8]>) -> Result<DynamicImage, BackendError>;

    /// Fit the image inside `max_dimension` (never upscales).
    async fn resize(
        &self,
        img: DynamicImage,
        max_dimension: u32,
    ) -> Result<DynamicImage, BackendError>;

    /// Encode RGBA pixels. The result names the format actually written.
    async fn encode(
        &self,
        pixels: Arc<RgbaImage>,
        params: EncodeParams,
    ) -> Result<EncodedImage, BackendError>;
}

/// Pure Rust backend using the `image` crate ecosystem.
pub struct RustBackend {
    codec: Codec,
}

impl RustBackend {
    pub fn new(config: &AvifConfig) -> Self {
        Self::with_codec(Codec::new(config))
    }

    pub fn with_codec(codec: Codec) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl ImageBackend for RustBackend {
    async fn decode(&self, bytes: Arc<[u8]>) -> Result<DynamicImage, BackendError> {
        Ok(tokio::task::spawn_blocking(move || decode(&bytes)).await??)
    }

    async fn resize(
        &self,
        img: DynamicImage,
        max_dimension: u32,
    ) -> Result<DynamicImage, BackendError> {
        Ok(tokio::task::spawn_blocking(move || resize(&img, max_dimension)).await??)
    }

    async fn encode(
        &self,
        pixels: Arc<RgbaImage>,
        params: EncodeParams,
    ) -> Result<EncodedImage, BackendError> {
        Ok(self.codec.encode(pixels, params).await?)
    }
}
