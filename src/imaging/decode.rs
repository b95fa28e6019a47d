//! Decode source bytes into pixels.
//!
//! ## Crate mapping
//!
//! | Input | Crate / function |
//! |---|---|
//! | JPEG, PNG, WebP | `image::ImageReader` (format sniffed from bytes) |
//! | AVIF | `avif-parse` (container) + `rav1d` (AV1 decode) + BT.601 YUV→RGB |
//! | EXIF orientation | `ImageDecoder::orientation` + `DynamicImage::apply_orientation` |
//! | Preview | `resize_exact` (Triangle) → JPEG |
//!
//! AVIF goes through its own path because the `image` crate's `"avif"`
//! feature only provides the encoder; its decoder needs the C dav1d library.

use super::calculations::preview_dimensions;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use thiserror::Error;

/// Longest edge of generated previews.
pub const PREVIEW_EDGE: u32 = 256;
const PREVIEW_QUALITY: u8 = 70;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode AVIF: {0}")]
    Avif(String),
}

/// Whether `bytes` start with an ISO-BMFF `ftyp` box declaring an AVIF brand.
///
/// Checks the major brand and the compatible-brand list.
pub fn is_avif(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    let is_avif_brand = |brand: &[u8]| brand == b"avif" || brand == b"avis";
    if is_avif_brand(&bytes[8..12]) {
        return true;
    }
    let box_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let end = box_len.min(bytes.len());
    // major brand (4) + minor version (4), then 4-byte compatible brands
    bytes
        .get(16..end)
        .is_some_and(|brands| brands.chunks_exact(4).any(is_avif_brand))
}

/// Decode `bytes` into an image with EXIF orientation applied.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    if is_avif(bytes) {
        return decode_avif(bytes);
    }
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Decode and render a small JPEG preview (longest edge [`PREVIEW_EDGE`]).
pub fn preview(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let img = decode(bytes)?;
    let (w, h) = preview_dimensions((img.width(), img.height()), PREVIEW_EDGE);
    let thumb = img.resize_exact(w, h, FilterType::Triangle).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, PREVIEW_QUALITY).encode_image(&thumb)?;
    Ok(out)
}

/// Decode AVIF bytes using avif-parse (container) + rav1d (AV1 decode).
fn decode_avif(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    use rav1d::include::dav1d::data::Dav1dData;
    use rav1d::include::dav1d::dav1d::Dav1dSettings;
    use rav1d::include::dav1d::picture::Dav1dPicture;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    let avif = avif_parse::read_avif(&mut Cursor::new(bytes))
        .map_err(|e| DecodeError::Avif(format!("invalid container: {e:?}")))?;
    let av1_bytes: &[u8] = &avif.primary_item;

    let mut settings = MaybeUninit::<Dav1dSettings>::uninit();
    unsafe {
        rav1d::src::lib::dav1d_default_settings(NonNull::from(&mut settings).cast::<Dav1dSettings>())
    };
    let mut settings = unsafe { settings.assume_init() };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;

    let mut ctx = None;
    let rc =
        unsafe { rav1d::src::lib::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(DecodeError::Avif(format!("decoder open failed ({})", rc.0)));
    }

    let decoded = (|| {
        let mut data = Dav1dData::default();
        let buf_ptr =
            unsafe { rav1d::src::lib::dav1d_data_create(NonNull::new(&mut data), av1_bytes.len()) };
        if buf_ptr.is_null() {
            return Err(DecodeError::Avif("data buffer allocation failed".into()));
        }
        unsafe { std::ptr::copy_nonoverlapping(av1_bytes.as_ptr(), buf_ptr, av1_bytes.len()) };

        let rc = unsafe { rav1d::src::lib::dav1d_send_data(ctx, NonNull::new(&mut data)) };
        if rc.0 != 0 {
            unsafe { rav1d::src::lib::dav1d_data_unref(NonNull::new(&mut data)) };
            return Err(DecodeError::Avif(format!("send_data failed ({})", rc.0)));
        }

        let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
        let rc = unsafe { rav1d::src::lib::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
        if rc.0 != 0 {
            return Err(DecodeError::Avif(format!("get_picture failed ({})", rc.0)));
        }
        let rgb = picture_to_rgb(&pic);
        unsafe { rav1d::src::lib::dav1d_picture_unref(NonNull::new(&mut pic)) };
        rgb
    })();

    unsafe { rav1d::src::lib::dav1d_close(NonNull::new(&mut ctx)) };

    let (w, h, rgb) = decoded?;
    image::RgbImage::from_raw(w, h, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| DecodeError::Avif("decoded buffer does not match dimensions".into()))
}

/// Convert a decoded picture into interleaved RGB8.
fn picture_to_rgb(
    pic: &rav1d::include::dav1d::picture::Dav1dPicture,
) -> Result<(u32, u32, Vec<u8>), DecodeError> {
    use rav1d::include::dav1d::headers::{
        DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
        DAV1D_PIXEL_LAYOUT_I444,
    };

    let plane = |i: usize| {
        pic.data[i]
            .map(|p| p.as_ptr() as *const u8)
            .ok_or_else(|| DecodeError::Avif(format!("missing plane {i}")))
    };

    let w = pic.p.w as u32;
    let h = pic.p.h as u32;
    let y_ptr = plane(0)?;
    let layout = pic.p.layout;

    let (u_ptr, v_ptr, ss_x, ss_y, monochrome) = match layout {
        DAV1D_PIXEL_LAYOUT_I400 => (y_ptr, y_ptr, false, false, true),
        DAV1D_PIXEL_LAYOUT_I420 => (plane(1)?, plane(2)?, true, true, false),
        DAV1D_PIXEL_LAYOUT_I422 => (plane(1)?, plane(2)?, true, false, false),
        DAV1D_PIXEL_LAYOUT_I444 => (plane(1)?, plane(2)?, false, false, false),
        other => {
            return Err(DecodeError::Avif(format!(
                "unsupported pixel layout: {other}"
            )));
        }
    };

    let planes = YuvPlanes {
        y_ptr,
        u_ptr,
        v_ptr,
        y_stride: pic.stride[0],
        uv_stride: if monochrome { 0 } else { pic.stride[1] },
        width: w,
        height: h,
        bpc: pic.p.bpc as u32,
        ss_x,
        ss_y,
        monochrome,
    };
    Ok((w, h, planes.to_rgb()?))
}

/// Decoded YUV plane data from rav1d, ready for RGB conversion.
struct YuvPlanes {
    y_ptr: *const u8,
    u_ptr: *const u8,
    v_ptr: *const u8,
    y_stride: isize,
    uv_stride: isize,
    width: u32,
    height: u32,
    bpc: u32,
    /// Chroma subsampling: horizontal, vertical (e.g. I420 = true, true)
    ss_x: bool,
    ss_y: bool,
    monochrome: bool,
}

impl YuvPlanes {
    /// Convert YUV planes to interleaved RGB8 using BT.601 coefficients.
    fn to_rgb(&self) -> Result<Vec<u8>, DecodeError> {
        let len = rgb_len(self.width, self.height).ok_or_else(|| {
            DecodeError::Avif(format!(
                "{}x{} picture is too large to convert",
                self.width, self.height
            ))
        })?;
        let max_val = ((1u32 << self.bpc) - 1) as f32;
        let center = (1u32 << (self.bpc - 1)) as f32;
        let scale = 255.0 / max_val;

        let width = self.width as usize;
        let mut rgb = vec![0u8; len];

        for row in 0..self.height {
            for col in 0..self.width {
                let luma = read_sample(self.y_ptr, self.y_stride, col, row, self.bpc);

                let (r, g, b) = if self.monochrome {
                    let v = (luma * scale).clamp(0.0, 255.0);
                    (v, v, v)
                } else {
                    let cx = if self.ss_x { col / 2 } else { col };
                    let cy = if self.ss_y { row / 2 } else { row };
                    let cb = read_sample(self.u_ptr, self.uv_stride, cx, cy, self.bpc) - center;
                    let cr = read_sample(self.v_ptr, self.uv_stride, cx, cy, self.bpc) - center;
                    (
                        ((luma + 1.402 * cr) * scale).clamp(0.0, 255.0),
                        ((luma - 0.344136 * cb - 0.714136 * cr) * scale).clamp(0.0, 255.0),
                        ((luma + 1.772 * cb) * scale).clamp(0.0, 255.0),
                    )
                };

                let idx = (row as usize * width + col as usize) * 3;
                rgb[idx] = r as u8;
                rgb[idx + 1] = g as u8;
                rgb[idx + 2] = b as u8;
            }
        }

        Ok(rgb)
    }
}

/// Byte length of an interleaved RGB8 buffer, `None` on overflow.
fn rgb_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(3)
}

/// Read one sample from a plane; high bit depths are stored as u16.
#[inline]
fn read_sample(ptr: *const u8, stride: isize, x: u32, y: u32, bpc: u32) -> f32 {
    if bpc <= 8 {
        (unsafe { *ptr.offset(y as isize * stride + x as isize) }) as f32
    } else {
        let byte_offset = y as isize * stride + x as isize * 2;
        (unsafe { (ptr.offset(byte_offset) as *const u16).read_unaligned() }) as f32
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageEncoder, Rgb, RgbImage};

    pub(crate) fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        })
    }

    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = gradient(width, height);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = gradient(width, height);
        let mut out = Vec::new();
        image::codecs::png::PngEncoder::new(&mut out)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    pub(crate) fn avif_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(gradient(width, height));
        let mut out = Vec::new();
        let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut out, 10, 80);
        img.write_with_encoder(encoder).unwrap();
        out
    }

    #[test]
    fn rgb_len_is_checked() {
        assert_eq!(rgb_len(64, 48), Some(64 * 48 * 3));
        assert_eq!(rgb_len(0, 10), Some(0));
        assert_eq!(rgb_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn oversized_picture_is_a_decode_error() {
        let planes = YuvPlanes {
            y_ptr: std::ptr::null(),
            u_ptr: std::ptr::null(),
            v_ptr: std::ptr::null(),
            y_stride: 0,
            uv_stride: 0,
            width: u32::MAX,
            height: u32::MAX,
            bpc: 8,
            ss_x: true,
            ss_y: true,
            monochrome: false,
        };
        let err = planes.to_rgb().unwrap_err();
        assert!(matches!(err, DecodeError::Avif(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn decode_jpeg_dimensions() {
        let img = decode(&jpeg_bytes(200, 150)).unwrap();
        assert_eq!((img.width(), img.height()), (200, 150));
    }

    #[test]
    fn decode_png_dimensions() {
        let img = decode(&png_bytes(31, 17)).unwrap();
        assert_eq!((img.width(), img.height()), (31, 17));
    }

    #[test]
    fn decode_avif_roundtrip() {
        let bytes = avif_bytes(64, 48);
        assert!(is_avif(&bytes));
        let img = decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn decode_garbage_errors() {
        assert!(decode(b"definitely not an image").is_err());
    }

    #[test]
    fn is_avif_rejects_other_formats() {
        assert!(!is_avif(&jpeg_bytes(8, 8)));
        assert!(!is_avif(&png_bytes(8, 8)));
        assert!(!is_avif(b"short"));
    }

    #[test]
    fn is_avif_accepts_compatible_brand() {
        let mut ftyp = Vec::new();
        ftyp.extend_from_slice(&24u32.to_be_bytes());
        ftyp.extend_from_slice(b"ftypmif1");
        ftyp.extend_from_slice(&0u32.to_be_bytes());
        ftyp.extend_from_slice(b"mif1avif");
        assert!(is_avif(&ftyp));
    }

    #[test]
    fn preview_is_small_jpeg() {
        let bytes = preview(&jpeg_bytes(1024, 512)).unwrap();
        let img = decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (256, 128));
        assert_eq!(
            image::guess_format(&bytes).unwrap(),
            image::ImageFormat::Jpeg
        );
    }
}
