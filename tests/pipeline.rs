//! End-to-end runs through a real session with the production backend.
//!
//! Sources are synthetic images encoded in memory, so no fixtures are needed.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageEncoder, ImageFormat, RgbImage};
use reimage::config::AppConfig;
use reimage::imaging::RustBackend;
use reimage::session::Session;
use reimage::store::RecordStatus;
use reimage::types::{EncodeFormat, OutputFormat, SourceFile};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    })
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = gradient(width, height);
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(gradient(width, height))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn session(config: AppConfig, dir: &TempDir) -> Session {
    let backend = Arc::new(RustBackend::new(&config.avif));
    Session::new(config, dir.path().join("reimage.toml"), backend, None)
}

#[tokio::test]
async fn large_jpeg_to_webp() {
    let tmp = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.settings.output_format = OutputFormat::Webp;
    config.settings.quality = 80;
    config.settings.max_dimension = 2048;
    let session = session(config, &tmp);

    let bytes = jpeg(3000, 1500);
    let original_size = bytes.len() as u64;
    let outcome = session
        .add_files(vec![SourceFile::from_bytes("wide.jpg", "image/jpeg", 1, bytes)])
        .await;
    assert_eq!(outcome.summary.unwrap().completed, 1);

    let records = session.snapshot();
    assert_eq!(records[0].status, RecordStatus::Completed);
    assert_eq!(records[0].progress, 100);
    assert!(records[0].preview.is_some());

    let artifact = records[0].artifact.as_ref().unwrap();
    assert_eq!((artifact.width, artifact.height), (2048, 1024));
    assert_eq!(artifact.format, EncodeFormat::Webp);
    assert_eq!(&artifact.bytes[..4], b"RIFF");
    assert_eq!(&artifact.bytes[8..12], b"WEBP");
    assert_eq!(artifact.original_size, original_size);
    assert!(artifact.size < original_size);
    session.shutdown().await;
}

#[tokio::test]
async fn gif_is_rejected_without_a_record() {
    let tmp = TempDir::new().unwrap();
    let session = session(AppConfig::default(), &tmp);

    let outcome = session
        .add_files(vec![SourceFile::from_bytes(
            "anim.gif",
            "image/gif",
            1,
            b"GIF89a".to_vec(),
        )])
        .await;
    assert_eq!(outcome.errors, vec!["Unsupported format: anim.gif".to_string()]);
    assert!(outcome.summary.is_none());
    assert!(session.snapshot().is_empty());
}

#[tokio::test]
async fn original_format_keeps_png_and_corrupt_file_fails_alone() {
    let tmp = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.settings.output_format = OutputFormat::Original;
    let session = session(config, &tmp);

    let outcome = session
        .add_files(vec![
            SourceFile::from_bytes("small.png", "image/png", 1, png(120, 80)),
            SourceFile::from_bytes("broken.jpg", "image/jpeg", 1, b"\xFF\xD8garbage".to_vec()),
        ])
        .await;
    let summary = outcome.summary.unwrap();
    assert_eq!((summary.completed, summary.failed), (1, 1));

    let records = session.snapshot();
    let small = records.iter().find(|r| r.source.name == "small.png").unwrap();
    let artifact = small.artifact.as_ref().unwrap();
    assert_eq!(artifact.format, EncodeFormat::Png);
    assert_eq!((artifact.width, artifact.height), (120, 80));

    let broken = records.iter().find(|r| r.source.name == "broken.jpg").unwrap();
    assert_eq!(broken.status, RecordStatus::Error);
    assert!(broken.artifact.is_none());
    assert!(broken.error.as_deref().unwrap().starts_with("Failed to decode image"));
}

#[tokio::test]
async fn small_jpeg_to_avif() {
    let tmp = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.settings.output_format = OutputFormat::Avif;
    config.settings.quality = 60;
    let session = session(config, &tmp);

    session
        .add_files(vec![SourceFile::from_bytes("tiny.jpg", "image/jpeg", 1, jpeg(64, 48))])
        .await;

    let records = session.snapshot();
    let artifact = records[0].artifact.as_ref().unwrap();
    assert_eq!(artifact.format, EncodeFormat::Avif);
    assert_eq!(&artifact.bytes[4..8], b"ftyp");
    assert_eq!((artifact.width, artifact.height), (64, 48));
    assert_eq!(artifact.quality, 60);
}

#[tokio::test]
async fn export_zip_after_processing() {
    let tmp = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.settings.output_format = OutputFormat::Jpg;
    config.settings.quality = 70;
    let session = session(config, &tmp);

    session
        .add_files(vec![
            SourceFile::from_bytes("a.jpg", "image/jpeg", 1, jpeg(200, 100)),
            SourceFile::from_bytes("b.png", "image/png", 1, png(50, 100)),
        ])
        .await;

    let export = session.export_zip(&tmp.path().join("out")).unwrap();
    assert_eq!(export.files, 2);

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&export.path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();
    assert_eq!(names, vec!["a_w200_q70.jpg", "b_w50_q70.jpg", "report.json"]);
    assert!(archive.by_name("a_w200_q70.jpg").unwrap().size() > 0);
}
