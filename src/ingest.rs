//! Ingestion: validate submitted files and attach previews.
//!
//! A file is accepted when its declared MIME type or its extension names one
//! of the supported formats, and it is at most [`MAX_FILE_SIZE`] bytes.
//! Rejected files never become records; each produces one message.

use crate::imaging::preview;
use crate::store::{RecordStore, RecordUpdate};
use crate::types::{FileId, SourceFile};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Largest accepted source, in bytes (50 MiB).
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/avif"];
const SUPPORTED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".avif"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("File too large: {0} (max 50MB)")]
    TooLarge(String),
}

/// Whether the declared type or the file name marks this as a supported image.
pub fn is_supported_image(file: &SourceFile) -> bool {
    let name = file.name.to_ascii_lowercase();
    SUPPORTED_MIME_TYPES.contains(&file.mime.as_str())
        || SUPPORTED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

pub fn validate_file(file: &SourceFile) -> Result<(), ValidationError> {
    if !is_supported_image(file) {
        return Err(ValidationError::UnsupportedFormat(file.name.clone()));
    }
    if file.size > MAX_FILE_SIZE {
        return Err(ValidationError::TooLarge(file.name.clone()));
    }
    Ok(())
}

/// Result of validating a batch of submissions.
#[derive(Debug, Default)]
pub struct Validated {
    pub accepted: Vec<SourceFile>,
    pub rejected: Vec<ValidationError>,
}

impl Validated {
    /// One human-readable message per rejected file.
    pub fn errors(&self) -> Vec<String> {
        self.rejected.iter().map(ToString::to_string).collect()
    }
}

pub fn validate_files(files: Vec<SourceFile>) -> Validated {
    let mut out = Validated::default();
    for file in files {
        match validate_file(&file) {
            Ok(()) => out.accepted.push(file),
            Err(err) => {
                debug!(%err, "rejected submission");
                out.rejected.push(err);
            }
        }
    }
    out
}

fn has_supported_extension(path: &Path) -> bool {
    let name = path.to_string_lossy().to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Expand `paths` into files. Directories are walked recursively and only
/// images with a supported extension are kept; explicit files are always
/// kept so validation can report them.
pub fn collect_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }
        let mut found: Vec<PathBuf> = WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && has_supported_extension(e.path()))
            .map(|e| e.into_path())
            .collect();
        found.sort();
        files.extend(found);
    }
    files
}

/// Read every path into a [`SourceFile`]. Unreadable paths produce one
/// message each instead of aborting the batch.
pub fn read_sources(paths: &[PathBuf]) -> (Vec<SourceFile>, Vec<String>) {
    let mut sources = Vec::new();
    let mut errors = Vec::new();
    for path in collect_paths(paths) {
        let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if len > MAX_FILE_SIZE {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(path = %path.display(), size = len, "skipping oversize file");
            errors.push(ValidationError::TooLarge(name).to_string());
            continue;
        }
        match SourceFile::from_path(&path) {
            Ok(source) => sources.push(source),
            Err(err) => {
                warn!(path = %path.display(), %err, "could not read file");
                errors.push(format!("Could not read {}: {}", path.display(), err));
            }
        }
    }
    (sources, errors)
}

/// Generate previews for `ids` in parallel and attach them to their records.
///
/// Failures only log; a record without a preview still processes normally.
/// Returns how many previews were attached.
pub fn attach_previews(store: &dyn RecordStore, ids: &[FileId]) -> usize {
    let sources: Vec<(FileId, SourceFile)> = ids
        .iter()
        .filter_map(|id| store.get(id).map(|r| (r.id, r.source)))
        .collect();

    sources
        .par_iter()
        .filter(|(id, source)| match preview(&source.bytes) {
            Ok(bytes) => matches!(
                store.update_record(id, RecordUpdate::preview(bytes)),
                Ok(true)
            ),
            Err(err) => {
                warn!(name = %source.name, %err, "preview generation failed");
                false
            }
        })
        .count()
}
