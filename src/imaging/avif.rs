//! Two-tier AVIF encoding.
//!
//! AVIF is the slowest and most failure-prone output format, so it gets its
//! own strategy:
//!
//! 1. Images above `max_pixels` are rejected before any encoder runs.
//! 2. The native tier (the `image` crate's built-in encoder) is used when a
//!    one-time 1×1 self-test succeeds. The result is cached.
//! 3. When the native tier is unavailable, fails, or returns bytes that are
//!    not AVIF, the software tier is used. It is loaded lazily through a
//!    [`ModuleLoader`] on first use and cached afterwards. Concurrent first
//!    callers share one in-flight load; a failed load is not cached, so the
//!    next caller retries.
//!
//! Every failure is reclassified into an [`EncodeError`] kind before it
//! leaves this module.

use super::codec::EncodeError;
use super::decode::is_avif;
use super::params::{Quality, avif_speed};
use crate::config::AvifConfig;
use async_trait::async_trait;
use image::{ImageEncoder, RgbaImage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// One way of turning RGBA pixels into AVIF bytes.
///
/// Errors are plain messages; [`EncodeError::classify`] sorts them into kinds.
pub trait AvifTier: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, pixels: &RgbaImage, quality: u8, speed: u8) -> Result<Vec<u8>, String>;
}

/// Failure to load the software tier.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("network error while fetching encoder: {0}")]
    Network(String),
    #[error("encoder module failed to initialize: {0}")]
    Module(String),
    #[error("encoder load timed out")]
    TimedOut,
}

impl From<LoadError> for EncodeError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Network(msg) => EncodeError::NetworkFailure(msg),
            LoadError::Module(msg) => EncodeError::ModuleLoadFailure(msg),
            LoadError::TimedOut => EncodeError::Timeout,
        }
    }
}

/// Produces the software tier on demand.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn AvifTier>, LoadError>;
}

/// Native tier: the `image` crate's AVIF encoder.
pub struct ImageCrateAvif;

impl AvifTier for ImageCrateAvif {
    fn name(&self) -> &'static str {
        "image"
    }

    fn encode(&self, pixels: &RgbaImage, quality: u8, speed: u8) -> Result<Vec<u8>, String> {
        let mut out = Vec::new();
        image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut out, speed, quality)
            .write_image(
                pixels.as_raw(),
                pixels.width(),
                pixels.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|e| e.to_string())?;
        Ok(out)
    }
}

/// Software tier: the standalone `ravif` encoder.
pub struct RavifAvif;

impl AvifTier for RavifAvif {
    fn name(&self) -> &'static str {
        "ravif"
    }

    fn encode(&self, pixels: &RgbaImage, quality: u8, speed: u8) -> Result<Vec<u8>, String> {
        let rgba: Vec<ravif::RGBA8> = pixels
            .as_raw()
            .chunks_exact(4)
            .map(|p| ravif::RGBA8::new(p[0], p[1], p[2], p[3]))
            .collect();
        let img = ravif::Img::new(
            rgba.as_slice(),
            pixels.width() as usize,
            pixels.height() as usize,
        );
        let encoded = ravif::Encoder::new()
            .with_quality(quality as f32)
            .with_alpha_quality(quality as f32)
            .with_speed(speed)
            .encode_rgba(img)
            .map_err(|e| e.to_string())?;
        Ok(encoded.avif_file)
    }
}

/// Loads [`RavifAvif`], checking it with a 1×1 encode before handing it out.
pub struct RavifLoader;

#[async_trait]
impl ModuleLoader for RavifLoader {
    async fn load(&self) -> Result<Arc<dyn AvifTier>, LoadError> {
        let module: Arc<dyn AvifTier> = Arc::new(RavifAvif);
        let check = Arc::clone(&module);
        tokio::task::spawn_blocking(move || self_test(check.as_ref()))
            .await
            .map_err(|e| LoadError::Module(e.to_string()))?
            .then_some(module)
            .ok_or_else(|| LoadError::Module("self-test encode failed".into()))
    }
}

/// Encode a single pixel and check the output really is AVIF.
fn self_test(tier: &dyn AvifTier) -> bool {
    let pixel = RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
    match tier.encode(&pixel, 50, 10) {
        Ok(bytes) => is_avif(&bytes),
        Err(err) => {
            debug!(tier = tier.name(), %err, "AVIF self-test failed");
            false
        }
    }
}

/// Run a tier on the blocking pool and classify its failure.
async fn run_tier(
    tier: Arc<dyn AvifTier>,
    pixels: Arc<RgbaImage>,
    quality: u8,
    speed: u8,
) -> Result<Vec<u8>, EncodeError> {
    tokio::task::spawn_blocking(move || tier.encode(&pixels, quality, speed))
        .await
        .map_err(|e| EncodeError::classify(&e.to_string()))?
        .map_err(|msg| EncodeError::classify(&msg))
}

/// The two-tier AVIF encoder. Cheap to share behind an `Arc`.
pub struct TwoTierAvif {
    native: Arc<dyn AvifTier>,
    native_supported: OnceCell<bool>,
    loader: Arc<dyn ModuleLoader>,
    software: OnceCell<Arc<dyn AvifTier>>,
    max_pixels: u64,
    load_timeout: Duration,
}

impl TwoTierAvif {
    pub fn new(config: &AvifConfig) -> Self {
        Self::with_tiers(Arc::new(ImageCrateAvif), Arc::new(RavifLoader), config)
    }

    pub fn with_tiers(
        native: Arc<dyn AvifTier>,
        loader: Arc<dyn ModuleLoader>,
        config: &AvifConfig,
    ) -> Self {
        Self {
            native,
            native_supported: OnceCell::new(),
            loader,
            software: OnceCell::new(),
            max_pixels: config.max_pixels,
            load_timeout: Duration::from_secs(config.load_timeout_secs),
        }
    }

    /// Whether the native tier passed its self-test. Checked once on the
    /// blocking pool, then cached.
    pub async fn native_supported(&self) -> bool {
        *self
            .native_supported
            .get_or_init(|| async {
                let tier = Arc::clone(&self.native);
                let ok = tokio::task::spawn_blocking(move || self_test(tier.as_ref()))
                    .await
                    .unwrap_or(false);
                info!(tier = self.native.name(), supported = ok, "checked native AVIF encoder");
                ok
            })
            .await
    }

    /// Whether the software tier has been loaded.
    pub fn software_loaded(&self) -> bool {
        self.software.initialized()
    }

    async fn software(&self) -> Result<Arc<dyn AvifTier>, EncodeError> {
        self.software
            .get_or_try_init(|| async {
                info!("loading software AVIF encoder");
                match tokio::time::timeout(self.load_timeout, self.loader.load()).await {
                    Ok(Ok(module)) => Ok(module),
                    Ok(Err(err)) => {
                        warn!(%err, "software AVIF encoder failed to load");
                        Err(EncodeError::from(err))
                    }
                    Err(_) => {
                        warn!("software AVIF encoder load timed out");
                        Err(EncodeError::Timeout)
                    }
                }
            })
            .await
            .cloned()
    }

    pub async fn encode(
        &self,
        pixels: Arc<RgbaImage>,
        quality: Quality,
    ) -> Result<Vec<u8>, EncodeError> {
        let (width, height) = pixels.dimensions();
        if width as u64 * height as u64 > self.max_pixels {
            return Err(EncodeError::ImageTooLarge { width, height });
        }

        // ravif asserts quality >= 1
        let q = quality.avif().clamp(1, 100);
        let speed = avif_speed(width, height, quality);

        if self.native_supported().await {
            match run_tier(Arc::clone(&self.native), Arc::clone(&pixels), q, speed).await {
                Ok(bytes) if is_avif(&bytes) => return Ok(bytes),
                Ok(_) => warn!(
                    tier = self.native.name(),
                    "native AVIF encoder returned non-AVIF output, using software encoder"
                ),
                Err(err) => warn!(
                    tier = self.native.name(),
                    %err,
                    "native AVIF encode failed, using software encoder"
                ),
            }
        } else {
            debug!("native AVIF encoder unavailable, using software encoder");
        }

        let module = self.software().await?;
        let bytes = run_tier(module, pixels, q, speed).await?;
        if !is_avif(&bytes) {
            return Err(EncodeError::Unknown(
                "software AVIF encoder returned non-AVIF output".into(),
            ));
        }
        Ok(bytes)
    }
}
