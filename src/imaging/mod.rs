//! Image processing: pure Rust, statically linked.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image` (JPEG/PNG/WebP), `avif-parse` + `rav1d` (AVIF) |
//! | **Resize** | Lanczos3 + `unsharpen` |
//! | **Encode jpg/png** | `image` encoders |
//! | **Encode webp** | `webp` (libwebp) |
//! | **Encode avif** | `image` (native tier) → `ravif` (software tier) |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Quality mapping tables and encode parameters
//! - **Decode / Resize / Codec / AVIF**: the pixel work
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`], the seam the scheduler uses

pub mod avif;
pub mod backend;
mod calculations;
pub mod codec;
pub mod decode;
mod params;
pub mod resize;

pub use avif::{AvifTier, LoadError, ModuleLoader, TwoTierAvif};
pub use backend::{BackendError, ImageBackend, RustBackend};
pub use calculations::{fit_within, preview_dimensions};
pub use codec::{Codec, EncodeError, EncodedImage};
pub use decode::{DecodeError, decode, preview};
pub use params::{EncodeParams, Quality, Sharpening, avif_speed};
pub use resize::{ResizeError, resize};
