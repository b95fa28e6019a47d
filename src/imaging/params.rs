//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They sit between
//! the scheduler (which decides what to encode) and the
//! [`backend`](super::backend) (which does the actual pixel work), so a mock
//! backend can be swapped in for tests.
//!
//! ## Types
//!
//! - [`Quality`]: UI quality (0–100). Clamped on construction.
//! - [`Sharpening`]: unsharp-mask parameters applied after downscaling.
//! - [`EncodeParams`]: what the codec layer needs besides pixels.
//!
//! The per-format quality tables live here too, as pure functions.

use crate::types::EncodeFormat;

/// UI quality (0 = smallest file, 100 = best).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.min(100))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// JPEG/WebP encoder quality: `round(40 + q/100 × 52)`, range 40..=92.
    pub fn lossy(self) -> u8 {
        (40.0 + self.0 as f64 / 100.0 * 52.0).round() as u8
    }

    /// PNG compression level: `round(q/100 × 9)`, range 0..=9.
    pub fn png_level(self) -> u8 {
        (self.0 as f64 / 100.0 * 9.0).round() as u8
    }

    /// AVIF quality is the UI value unchanged.
    pub fn avif(self) -> u8 {
        self.0 as u8
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

/// AVIF encoder speed (1 = slowest/best, 10 = fastest).
///
/// Larger images and lower requested qualities get faster settings.
pub fn avif_speed(width: u32, height: u32, quality: Quality) -> u8 {
    let pixels = width as u64 * height as u64;
    let mut speed: u8 = if pixels > 10_000_000 {
        10
    } else if pixels > 4_000_000 {
        8
    } else {
        6
    };
    if quality.value() < 50 {
        speed += 1;
    }
    speed.clamp(1, 10)
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Counteracts the softening a Lanczos downscale leaves behind.
    pub fn downscale() -> Self {
        Self {
            sigma: 0.6,
            threshold: 4,
        }
    }
}

/// Everything the codec layer needs besides the pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeParams {
    pub format: EncodeFormat,
    pub quality: Quality,
    pub near_lossless: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_100() {
        assert_eq!(Quality::new(0).value(), 0);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn lossy_mapping_endpoints() {
        assert_eq!(Quality::new(0).lossy(), 40);
        assert_eq!(Quality::new(80).lossy(), 82);
        assert_eq!(Quality::new(100).lossy(), 92);
    }

    #[test]
    fn png_mapping_endpoints() {
        assert_eq!(Quality::new(0).png_level(), 0);
        assert_eq!(Quality::new(50).png_level(), 5);
        assert_eq!(Quality::new(100).png_level(), 9);
    }

    #[test]
    fn avif_quality_is_unchanged() {
        assert_eq!(Quality::new(0).avif(), 0);
        assert_eq!(Quality::new(63).avif(), 63);
    }

    #[test]
    fn mappings_are_monotonic() {
        for q in 0..100 {
            let lo = Quality::new(q);
            let hi = Quality::new(q + 1);
            assert!(hi.lossy() >= lo.lossy(), "lossy at {q}");
            assert!(hi.png_level() >= lo.png_level(), "png at {q}");
            assert!(hi.avif() >= lo.avif(), "avif at {q}");
        }
    }

    #[test]
    fn avif_speed_scales_with_pixels() {
        let q = Quality::new(80);
        assert_eq!(avif_speed(1000, 1000, q), 6);
        assert_eq!(avif_speed(3000, 2000, q), 8);
        assert_eq!(avif_speed(4000, 3000, q), 10);
    }

    #[test]
    fn avif_speed_faster_for_low_quality_but_capped() {
        assert_eq!(avif_speed(100, 100, Quality::new(30)), 7);
        assert_eq!(avif_speed(5000, 5000, Quality::new(30)), 10);
    }

    #[test]
    fn downscale_sharpening_values() {
        let s = Sharpening::downscale();
        assert_eq!(s.sigma, 0.6);
        assert_eq!(s.threshold, 4);
    }
}
