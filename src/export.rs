//! Export of processed artifacts.
//!
//! Every record that holds an artifact becomes one entry named
//! `{base}_w{width}_q{quality}.{ext}`, where `quality` is the *current*
//! quality setting at export time. Two records mapping to the same entry
//! name collapse to one; the later record wins.
//!
//! Artifacts are written either as a deflate zip
//! (`reimage-processed-{unix_ms}.zip`) or as loose files. Both variants also
//! carry a `report.json` summarising sizes and reductions.

use crate::output::reduction_rate;
use crate::store::{FileRecord, ProcessedArtifact};
use crate::types::{EncodeFormat, SourceFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;
use zip::CompressionMethod;
use zip::write::FileOptions;

pub const REPORT_NAME: &str = "report.json";
const ZIP_LEVEL: i32 = 6;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Report serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Nothing to export: no processed files")]
    Empty,
}

pub fn entry_name(source: &SourceFile, artifact: &ProcessedArtifact, quality: u32) -> String {
    format!(
        "{}_w{}_q{}.{}",
        source.base_name(),
        artifact.width,
        quality,
        artifact.format.extension()
    )
}

pub fn archive_name(unix_ms: u128) -> String {
    format!("reimage-processed-{unix_ms}.zip")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub source: String,
    pub format: EncodeFormat,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub original_size: u64,
    pub reduction_percent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub quality: u32,
    pub files: Vec<ReportEntry>,
}

/// Where an export landed and how many artifacts it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub files: usize,
}

/// Entry name → (source name, artifact), deduplicated with last-wins.
fn collect_entries(
    records: &[FileRecord],
    quality: u32,
) -> BTreeMap<String, (String, Arc<ProcessedArtifact>)> {
    let mut entries = BTreeMap::new();
    for record in records {
        if let Some(artifact) = &record.artifact {
            let name = entry_name(&record.source, artifact, quality);
            entries.insert(name, (record.source.name.clone(), Arc::clone(artifact)));
        }
    }
    entries
}

fn build_report(
    entries: &BTreeMap<String, (String, Arc<ProcessedArtifact>)>,
    quality: u32,
) -> ExportReport {
    let files = entries
        .iter()
        .map(|(name, (source, a))| ReportEntry {
            name: name.clone(),
            source: source.clone(),
            format: a.format,
            width: a.width,
            height: a.height,
            size: a.size,
            original_size: a.original_size,
            reduction_percent: reduction_rate(a.original_size, a.size),
        })
        .collect();
    ExportReport { quality, files }
}

/// Write a zip of all processed artifacts into `dir`.
pub fn export_zip(
    dir: &Path,
    records: &[FileRecord],
    quality: u32,
) -> Result<ExportOutcome, ExportError> {
    let entries = collect_entries(records, quality);
    if entries.is_empty() {
        return Err(ExportError::Empty);
    }
    fs::create_dir_all(dir)?;

    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let path = dir.join(archive_name(unix_ms));

    let mut zip = zip::ZipWriter::new(fs::File::create(&path)?);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(ZIP_LEVEL));

    for (name, (_, artifact)) in &entries {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&artifact.bytes)?;
    }
    let report = serde_json::to_vec_pretty(&build_report(&entries, quality))?;
    zip.start_file(REPORT_NAME, options)?;
    zip.write_all(&report)?;
    zip.finish()?;

    info!(path = %path.display(), files = entries.len(), "wrote archive");
    Ok(ExportOutcome {
        path,
        files: entries.len(),
    })
}

/// Write all processed artifacts as loose files into `dir`.
pub fn export_dir(
    dir: &Path,
    records: &[FileRecord],
    quality: u32,
) -> Result<ExportOutcome, ExportError> {
    let entries = collect_entries(records, quality);
    if entries.is_empty() {
        return Err(ExportError::Empty);
    }
    fs::create_dir_all(dir)?;

    for (name, (_, artifact)) in &entries {
        fs::write(dir.join(name), &artifact.bytes)?;
    }
    let report = serde_json::to_vec_pretty(&build_report(&entries, quality))?;
    fs::write(dir.join(REPORT_NAME), report)?;

    info!(dir = %dir.display(), files = entries.len(), "wrote processed files");
    Ok(ExportOutcome {
        path: dir.to_path_buf(),
        files: entries.len(),
    })
}
