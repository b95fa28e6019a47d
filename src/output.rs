//! CLI output formatting.
//!
//! Every function here is pure and returns lines (or a single string) so it
//! can be tested without capturing stdout. The binary prints them.
//!
//! # Process
//!
//! ```text
//! Batch 1/2 (3 files)
//!     001 dawn.jpg → webp 2048x1024
//!         Size: 4.1 MB → 512.3 KB (88% smaller)
//!     002 broken.jpg
//!         Error: Failed to decode image: ...
//! Processed 3 files: 2 completed, 1 failed
//! ```
//!
//! # Status
//!
//! ```text
//! Settings
//!     preset: balanced, format: webp, quality: 80, max dimension: 2048
//! Files (2)
//! 001 dawn.jpg [completed] webp 2048x1024, 4.1 MB → 512.3 KB (88% smaller)
//! 002 night.png [processing 50%]
//! ```

use crate::config::Settings;
use crate::scheduler::{ProcessEvent, RunSummary};
use crate::store::{FileRecord, RecordStatus};

const SIZE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Human-readable byte count with up to two decimals (`1536` → `1.5 KB`).
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", SIZE_UNITS[unit])
}

/// Percent saved relative to the original, rounded. Negative when the output grew.
pub fn reduction_rate(original: u64, processed: u64) -> i64 {
    if original == 0 {
        return 0;
    }
    let saved = original as f64 - processed as f64;
    (saved / original as f64 * 100.0).round() as i64
}

fn size_change(original: u64, processed: u64) -> String {
    let rate = reduction_rate(original, processed);
    let verdict = if rate >= 0 {
        format!("{rate}% smaller")
    } else {
        format!("{}% larger", -rate)
    };
    format!(
        "{} → {} ({verdict})",
        format_file_size(original),
        format_file_size(processed)
    )
}

fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Lines for one progress event. `position` is the 1-based count of files
/// reported so far, used for the index column.
pub fn format_event(event: &ProcessEvent, position: usize) -> Vec<String> {
    match event {
        ProcessEvent::BatchStarted {
            index,
            batches,
            files,
        } => vec![format!("Batch {}/{} ({} files)", index, batches, files)],
        ProcessEvent::FileCompleted {
            name,
            format,
            width,
            height,
            size,
            original_size,
        } => vec![
            format!(
                "    {} {} → {} {}x{}",
                format_index(position),
                name,
                format,
                width,
                height
            ),
            format!("        Size: {}", size_change(*original_size, *size)),
        ],
        ProcessEvent::FileFailed { name, error } => vec![
            format!("    {} {}", format_index(position), name),
            format!("        Error: {}", error),
        ],
    }
}

pub fn format_summary(summary: &RunSummary) -> String {
    let total = summary.completed + summary.failed;
    let mut line = format!(
        "Processed {} file{}: {} completed, {} failed",
        total,
        if total == 1 { "" } else { "s" },
        summary.completed,
        summary.failed
    );
    if summary.skipped > 0 {
        line.push_str(&format!(", {} skipped", summary.skipped));
    }
    line
}

pub fn format_settings(settings: &Settings) -> Vec<String> {
    let mut detail = format!(
        "    preset: {}, format: {}, quality: {}, max dimension: {}",
        settings.preset, settings.output_format, settings.quality, settings.max_dimension
    );
    if settings.near_lossless {
        detail.push_str(", near-lossless");
    }
    vec!["Settings".to_string(), detail]
}

fn status_line(pos: usize, record: &FileRecord) -> String {
    let head = format!("{} {}", format_index(pos), record.source.name);
    match record.status {
        RecordStatus::Pending => format!("{head} [pending]"),
        RecordStatus::Processing => format!("{head} [processing {}%]", record.progress),
        RecordStatus::Completed => match &record.artifact {
            Some(a) => format!(
                "{head} [completed] {} {}x{}, {}",
                a.format,
                a.width,
                a.height,
                size_change(a.original_size, a.size)
            ),
            None => format!("{head} [completed]"),
        },
        RecordStatus::Error => format!(
            "{head} [error] {}",
            record.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Status table for the interactive session.
pub fn format_status(settings: &Settings, records: &[FileRecord]) -> Vec<String> {
    let mut lines = format_settings(settings);
    lines.push(format!("Files ({})", records.len()));
    lines.extend(
        records
            .iter()
            .enumerate()
            .map(|(i, record)| status_line(i + 1, record)),
    );
    lines
}

pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ProcessedArtifact, RecordStore, RecordUpdate};
    use crate::types::{EncodeFormat, SourceFile};

    #[test]
    fn file_size_units() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1_048_576), "1 MB");
        assert_eq!(format_file_size(1_234_567), "1.18 MB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024), "5 GB");
    }

    #[test]
    fn file_size_caps_at_gigabytes() {
        assert_eq!(format_file_size(2 * 1024u64.pow(4)), "2048 GB");
    }

    #[test]
    fn reduction_rate_rounds() {
        assert_eq!(reduction_rate(1000, 250), 75);
        assert_eq!(reduction_rate(3, 2), 33);
        assert_eq!(reduction_rate(100, 150), -50);
        assert_eq!(reduction_rate(0, 10), 0);
    }

    #[test]
    fn batch_event() {
        let event = ProcessEvent::BatchStarted {
            index: 1,
            batches: 2,
            files: 3,
        };
        assert_eq!(format_event(&event, 0), vec!["Batch 1/2 (3 files)"]);
    }

    #[test]
    fn completed_event() {
        let event = ProcessEvent::FileCompleted {
            name: "dawn.jpg".to_string(),
            format: EncodeFormat::Webp,
            width: 2048,
            height: 1024,
            size: 256 * 1024,
            original_size: 1024 * 1024,
        };
        let lines = format_event(&event, 1);
        assert_eq!(lines[0], "    001 dawn.jpg → webp 2048x1024");
        assert_eq!(lines[1], "        Size: 1 MB → 256 KB (75% smaller)");
    }

    #[test]
    fn failed_event() {
        let event = ProcessEvent::FileFailed {
            name: "bad.png".to_string(),
            error: "Encoding failed: boom".to_string(),
        };
        let lines = format_event(&event, 12);
        assert_eq!(lines[0], "    012 bad.png");
        assert_eq!(lines[1], "        Error: Encoding failed: boom");
    }

    #[test]
    fn summary_line() {
        let summary = RunSummary {
            completed: 2,
            failed: 1,
            skipped: 0,
            batches: 1,
        };
        assert_eq!(
            format_summary(&summary),
            "Processed 3 files: 2 completed, 1 failed"
        );
        let one = RunSummary {
            completed: 1,
            skipped: 2,
            ..RunSummary::default()
        };
        assert_eq!(
            format_summary(&one),
            "Processed 1 file: 1 completed, 0 failed, 2 skipped"
        );
    }

    #[test]
    fn status_lists_every_state() {
        let store = MemoryStore::new();
        let ids = store.add_records(
            ["a.jpg", "b.jpg", "c.jpg", "d.jpg"]
                .iter()
                .map(|n| SourceFile::from_bytes(*n, "image/jpeg", 0, vec![0; 2048]))
                .collect(),
        );
        for id in &ids[1..] {
            store.update_record(id, RecordUpdate::started()).unwrap();
        }
        store.update_record(&ids[1], RecordUpdate::progress(50)).unwrap();
        store
            .update_record(
                &ids[2],
                RecordUpdate::completed(ProcessedArtifact {
                    bytes: vec![0; 512],
                    format: EncodeFormat::Png,
                    width: 10,
                    height: 5,
                    size: 512,
                    original_size: 2048,
                    quality: 80,
                }),
            )
            .unwrap();
        store
            .update_record(&ids[3], RecordUpdate::failed("Out of memory"))
            .unwrap();

        let lines = format_status(&Settings::default(), &store.snapshot());
        assert_eq!(lines[0], "Settings");
        assert_eq!(
            lines[1],
            "    preset: balanced, format: webp, quality: 80, max dimension: 4096"
        );
        assert_eq!(lines[2], "Files (4)");
        assert_eq!(lines[3], "001 a.jpg [pending]");
        assert_eq!(lines[4], "002 b.jpg [processing 50%]");
        assert_eq!(
            lines[5],
            "003 c.jpg [completed] png 10x5, 2 KB → 512 B (75% smaller)"
        );
        assert_eq!(lines[6], "004 d.jpg [error] Out of memory");
    }
}
