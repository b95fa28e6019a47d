//! Shared types used by every stage of the pipeline.
//!
//! [`OutputFormat`] is what the user asks for (including `original`);
//! [`EncodeFormat`] is what the codec layer actually writes. A
//! [`SourceFile`] is one submitted image with its bytes and the metadata the
//! dedup key ([`FileId`]) is derived from.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Requested output format, as stored in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpg,
    Png,
    #[default]
    Webp,
    Avif,
    /// Keep the source file's format.
    Original,
}

impl OutputFormat {
    /// Resolve to a concrete encoder format for a source with the given MIME type.
    ///
    /// `Original` maps the source MIME back to its format and falls back to
    /// JPEG when the MIME type is unknown.
    pub fn resolve(self, source_mime: &str) -> EncodeFormat {
        match self {
            OutputFormat::Jpg => EncodeFormat::Jpg,
            OutputFormat::Png => EncodeFormat::Png,
            OutputFormat::Webp => EncodeFormat::Webp,
            OutputFormat::Avif => EncodeFormat::Avif,
            OutputFormat::Original => {
                EncodeFormat::from_mime(source_mime).unwrap_or(EncodeFormat::Jpg)
            }
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            "avif" => Ok(OutputFormat::Avif),
            "original" => Ok(OutputFormat::Original),
            other => Err(format!(
                "unknown output format '{other}' (expected jpg, png, webp, avif or original)"
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Original => f.write_str("original"),
            OutputFormat::Jpg => f.write_str("jpg"),
            OutputFormat::Png => f.write_str("png"),
            OutputFormat::Webp => f.write_str("webp"),
            OutputFormat::Avif => f.write_str("avif"),
        }
    }
}

/// A concrete format the codec layer can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeFormat {
    Jpg,
    Png,
    Webp,
    Avif,
}

impl EncodeFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" => Some(EncodeFormat::Jpg),
            "image/png" => Some(EncodeFormat::Png),
            "image/webp" => Some(EncodeFormat::Webp),
            "image/avif" => Some(EncodeFormat::Avif),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            EncodeFormat::Jpg => "image/jpeg",
            EncodeFormat::Png => "image/png",
            EncodeFormat::Webp => "image/webp",
            EncodeFormat::Avif => "image/avif",
        }
    }

    /// File extension, also used in export entry names.
    pub fn extension(self) -> &'static str {
        match self {
            EncodeFormat::Jpg => "jpg",
            EncodeFormat::Png => "png",
            EncodeFormat::Webp => "webp",
            EncodeFormat::Avif => "avif",
        }
    }
}

impl fmt::Display for EncodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Dedup key for a submitted file.
///
/// Derived from `(name, size, last_modified)` so re-adding the identical file
/// yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn derive(name: &str, size: u64, last_modified_ms: u64) -> Self {
        let key = format!("{name}-{size}-{last_modified_ms}");
        let mut hex = format!("{:x}", Sha256::digest(key.as_bytes()));
        hex.truncate(16);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submitted image: declared metadata plus the original bytes.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    /// Declared MIME type (may be empty or wrong; validation also checks the extension).
    pub mime: String,
    pub size: u64,
    pub last_modified_ms: u64,
    pub bytes: Arc<[u8]>,
}

impl SourceFile {
    /// Build a source from in-memory bytes. `size` is taken from the buffer.
    pub fn from_bytes(
        name: impl Into<String>,
        mime: impl Into<String>,
        last_modified_ms: u64,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            size: bytes.len() as u64,
            last_modified_ms,
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, inferring its MIME type from the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let metadata = std::fs::metadata(path)?;
        let last_modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime = mime_from_name(&name);
        Ok(Self::from_bytes(name, mime, last_modified_ms, bytes))
    }

    pub fn id(&self) -> FileId {
        FileId::derive(&self.name, self.size, self.last_modified_ms)
    }

    /// File name without its final extension (`photo.final.jpg` → `photo.final`).
    pub fn base_name(&self) -> &str {
        match self.name.rfind('.') {
            Some(pos) if pos > 0 => &self.name[..pos],
            _ => &self.name,
        }
    }
}

/// Best-effort MIME type from a file name's extension.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_resolves_from_source_mime() {
        assert_eq!(OutputFormat::Original.resolve("image/png"), EncodeFormat::Png);
        assert_eq!(OutputFormat::Original.resolve("image/avif"), EncodeFormat::Avif);
        assert_eq!(OutputFormat::Original.resolve("image/jpeg"), EncodeFormat::Jpg);
    }

    #[test]
    fn original_with_unknown_mime_falls_back_to_jpg() {
        assert_eq!(OutputFormat::Original.resolve(""), EncodeFormat::Jpg);
        assert_eq!(OutputFormat::Original.resolve("image/gif"), EncodeFormat::Jpg);
    }

    #[test]
    fn explicit_format_ignores_source() {
        assert_eq!(OutputFormat::Webp.resolve("image/png"), EncodeFormat::Webp);
    }

    #[test]
    fn output_format_parses_case_insensitively() {
        assert_eq!("JPEG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpg);
        assert_eq!("avif".parse::<OutputFormat>().unwrap(), OutputFormat::Avif);
        assert!("gif".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn file_id_is_deterministic() {
        let a = FileId::derive("dawn.jpg", 1024, 1_700_000_000_000);
        let b = FileId::derive("dawn.jpg", 1024, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn file_id_is_sha256_prefix_in_lowercase_hex() {
        let id = FileId::derive("dawn.jpg", 1024, 1_700_000_000_000);
        assert_eq!(id.as_str(), "70902ed880eb412a");
        assert!(id.as_str().chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[test]
    fn file_id_changes_with_any_key_part() {
        let base = FileId::derive("dawn.jpg", 1024, 1);
        assert_ne!(base, FileId::derive("dusk.jpg", 1024, 1));
        assert_ne!(base, FileId::derive("dawn.jpg", 1025, 1));
        assert_ne!(base, FileId::derive("dawn.jpg", 1024, 2));
    }

    #[test]
    fn base_name_strips_last_extension_only() {
        let src = SourceFile::from_bytes("photo.final.jpg", "image/jpeg", 0, vec![1, 2, 3]);
        assert_eq!(src.base_name(), "photo.final");
        assert_eq!(src.size, 3);

        let hidden = SourceFile::from_bytes(".hidden", "", 0, vec![]);
        assert_eq!(hidden.base_name(), ".hidden");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_from_name("a.JPG"), "image/jpeg");
        assert_eq!(mime_from_name("a.webp"), "image/webp");
        assert_eq!(mime_from_name("a.gif"), "image/gif");
        assert_eq!(mime_from_name("noext"), "application/octet-stream");
    }

    #[test]
    fn from_path_reads_bytes_and_metadata() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("img.png");
        std::fs::write(&path, b"not really a png").unwrap();

        let src = SourceFile::from_path(&path).unwrap();
        assert_eq!(src.name, "img.png");
        assert_eq!(src.mime, "image/png");
        assert_eq!(src.size, 16);
        assert!(src.last_modified_ms > 0);
    }
}
