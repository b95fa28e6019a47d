//! Persisted configuration.
//!
//! Handles loading, validating, merging, and saving the `reimage.toml` file.
//! Only [`Settings`] are meant to change between sessions; the other sections
//! tune how the pipeline runs. File records and encoded artifacts are never
//! persisted.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [settings]
//! preset = "balanced"        # high-quality | balanced | high-compression
//! output_format = "webp"     # jpg | png | webp | avif | original
//! quality = 80               # 0-100
//! max_dimension = 4096       # longest edge in pixels
//! near_lossless = false      # webp/avif only
//!
//! [processing]
//! # max_workers = 3          # omit for auto = CPU cores - 1
//! debounce_ms = 500          # settings-change debounce window
//!
//! [avif]
//! max_pixels = 100000000     # reject larger images up front
//! load_timeout_secs = 60     # software encoder load timeout
//! # fallback_format = "webp" # encode this instead when AVIF fails
//! ```
//!
//! ## Partial Configuration
//!
//! Files are sparse: stock defaults are the base layer and the user file is
//! deep-merged on top, so a file containing only `[settings] quality = 60`
//! is complete. Unknown keys are rejected to catch typos early.

use crate::types::{EncodeFormat, OutputFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Named quality/size pairs. Selecting one overwrites `quality` and
/// `max_dimension`; `output_format` and `near_lossless` are untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    HighQuality,
    #[default]
    Balanced,
    HighCompression,
}

impl Preset {
    /// `(quality, max_dimension)` for this preset.
    pub fn values(self) -> (u32, u32) {
        match self {
            Preset::HighQuality => (95, 4096),
            Preset::Balanced => (80, 2048),
            Preset::HighCompression => (60, 1920),
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Preset::HighQuality => "high-quality",
            Preset::Balanced => "balanced",
            Preset::HighCompression => "high-compression",
        })
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high-quality" => Ok(Preset::HighQuality),
            "balanced" => Ok(Preset::Balanced),
            "high-compression" => Ok(Preset::HighCompression),
            other => Err(format!(
                "unknown preset '{other}' (expected high-quality, balanced or high-compression)"
            )),
        }
    }
}

/// User-facing encode settings. The only state persisted across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub preset: Preset,
    pub output_format: OutputFormat,
    /// UI quality, 0 = worst, 100 = best. Mapped per format by the codec layer.
    pub quality: u32,
    /// Longest allowed output edge in pixels.
    pub max_dimension: u32,
    /// Only meaningful for webp/avif.
    pub near_lossless: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preset: Preset::Balanced,
            output_format: OutputFormat::Webp,
            quality: 80,
            max_dimension: 4096,
            near_lossless: false,
        }
    }
}

impl Settings {
    /// Select a preset, overwriting quality and max dimension in one step.
    pub fn apply_preset(&mut self, preset: Preset) {
        let (quality, max_dimension) = preset.values();
        self.preset = preset;
        self.quality = quality;
        self.max_dimension = max_dimension;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quality > 100 {
            return Err(ConfigError::Validation(
                "settings.quality must be 0-100".into(),
            ));
        }
        if self.max_dimension == 0 {
            return Err(ConfigError::Validation(
                "settings.max_dimension must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum files encoded concurrently. When absent, defaults to
    /// `cores - 1` (at least one). Larger values are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Debounce window for settings-driven reprocessing, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            debounce_ms: 500,
        }
    }
}

/// Resolve the scheduler's concurrency width from config.
///
/// - `None` → `max(1, cores - 1)`, leaving one core for the caller
/// - `Some(n)` → `n` clamped into `1..=max(1, cores - 1)` (constrain down, not up)
pub fn effective_workers(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let auto = cores.saturating_sub(1).max(1);
    config
        .max_workers
        .map(|n| n.clamp(1, auto))
        .unwrap_or(auto)
}

/// AVIF encoder limits and fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AvifConfig {
    /// Images above this many pixels are rejected before encoding.
    pub max_pixels: u64,
    /// Upper bound on loading the software encoder module.
    pub load_timeout_secs: u64,
    /// Format to encode instead when both AVIF tiers fail. `None` surfaces the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_format: Option<EncodeFormat>,
}

impl Default for AvifConfig {
    fn default() -> Self {
        Self {
            max_pixels: 100_000_000,
            load_timeout_secs: 60,
            fallback_format: None,
        }
    }
}

/// Full configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub settings: Settings,
    pub processing: ProcessingConfig,
    pub avif: AvifConfig,
}

impl AppConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        if self.processing.debounce_ms == 0 {
            return Err(ConfigError::Validation(
                "processing.debounce_ms must be positive".into(),
            ));
        }
        if self.avif.max_pixels == 0 {
            return Err(ConfigError::Validation(
                "avif.max_pixels must be positive".into(),
            ));
        }
        if self.avif.load_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "avif.load_timeout_secs must be positive".into(),
            ));
        }
        if self.avif.fallback_format == Some(EncodeFormat::Avif) {
            return Err(ConfigError::Validation(
                "avif.fallback_format cannot be avif".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Config loading, merging, saving
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged on top of.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(AppConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<AppConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: AppConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to stock defaults when it is absent.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Persist `settings` into the `[settings]` table of the file at `path`.
///
/// Other sections already in the file are kept as written.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    settings.validate()?;
    let mut root = load_raw_config(path)?
        .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new()));
    let table = match &mut root {
        toml::Value::Table(table) => table,
        _ => {
            return Err(ConfigError::Validation(format!(
                "{} is not a TOML table",
                path.display()
            )));
        }
    };
    table.insert("settings".to_string(), toml::Value::try_from(settings)?);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml::to_string_pretty(&root)?)?;
    Ok(())
}

/// Returns a fully-commented stock config file with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# reimage configuration
# =====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys cause an error.

# ---------------------------------------------------------------------------
# Encode settings (saved with --save)
# ---------------------------------------------------------------------------
[settings]
# Named quality/size pair: high-quality (95, 4096), balanced (80, 2048),
# high-compression (60, 1920). Choosing a preset on the command line
# overwrites quality and max_dimension.
preset = "balanced"

# Output format: jpg, png, webp, avif, or original (keep source format).
output_format = "webp"

# Quality 0-100. JPEG/WebP map this onto 40-92, PNG onto compression
# level 0-9, AVIF uses it directly.
quality = 80

# Longest output edge in pixels. Smaller images are never upscaled.
max_dimension = 4096

# Near-lossless encoding (webp/avif only).
near_lossless = false

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum files encoded concurrently.
# Omit or comment out to auto-detect (= CPU cores - 1, at least 1).
# max_workers = 3

# How long settings must stay unchanged before completed files are redone.
debounce_ms = 500

# ---------------------------------------------------------------------------
# AVIF
# ---------------------------------------------------------------------------
[avif]
# Images with more pixels than this are rejected before encoding.
max_pixels = 100000000

# Seconds allowed for loading the software AVIF encoder.
load_timeout_secs = 60

# Encode this format instead when AVIF encoding fails (jpg, png, webp).
# fallback_format = "webp"
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_settings_values() {
        let settings = Settings::default();
        assert_eq!(settings.preset, Preset::Balanced);
        assert_eq!(settings.output_format, OutputFormat::Webp);
        assert_eq!(settings.quality, 80);
        assert_eq!(settings.max_dimension, 4096);
        assert!(!settings.near_lossless);
    }

    #[test]
    fn apply_preset_overwrites_quality_and_dimension_only() {
        let mut settings = Settings {
            output_format: OutputFormat::Avif,
            near_lossless: true,
            ..Settings::default()
        };
        settings.apply_preset(Preset::HighCompression);
        assert_eq!(settings.preset, Preset::HighCompression);
        assert_eq!(settings.quality, 60);
        assert_eq!(settings.max_dimension, 1920);
        assert_eq!(settings.output_format, OutputFormat::Avif);
        assert!(settings.near_lossless);
    }

    #[test]
    fn preset_table() {
        assert_eq!(Preset::HighQuality.values(), (95, 4096));
        assert_eq!(Preset::Balanced.values(), (80, 2048));
        assert_eq!(Preset::HighCompression.values(), (60, 1920));
    }

    #[test]
    fn preset_parses_kebab_case() {
        assert_eq!("high-quality".parse::<Preset>().unwrap(), Preset::HighQuality);
        assert!("best".parse::<Preset>().is_err());
    }

    // =========================================================================
    // Worker width
    // =========================================================================

    #[test]
    fn effective_workers_auto_leaves_one_core() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = effective_workers(&ProcessingConfig::default());
        assert_eq!(workers, cores.saturating_sub(1).max(1));
    }

    #[test]
    fn effective_workers_user_constrains_down() {
        let config = ProcessingConfig {
            max_workers: Some(1),
            ..Default::default()
        };
        assert_eq!(effective_workers(&config), 1);
    }

    #[test]
    fn effective_workers_never_zero() {
        let config = ProcessingConfig {
            max_workers: Some(0),
            ..Default::default()
        };
        assert_eq!(effective_workers(&config), 1);
    }

    #[test]
    fn effective_workers_cannot_exceed_auto() {
        let config = ProcessingConfig {
            max_workers: Some(99_999),
            ..Default::default()
        };
        assert_eq!(
            effective_workers(&config),
            effective_workers(&ProcessingConfig::default())
        );
    }

    // =========================================================================
    // merge_toml
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str(
            r#"
[settings]
quality = 80
max_dimension = 4096
"#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
[settings]
quality = 60
"#,
        )
        .unwrap();
        let merged = merge_toml(base, overlay);
        let settings = merged.get("settings").unwrap();
        assert_eq!(settings.get("quality").unwrap().as_integer(), Some(60));
        assert_eq!(
            settings.get("max_dimension").unwrap().as_integer(),
            Some(4096)
        );
    }

    #[test]
    fn merge_toml_scalar_replaces_table() {
        let base: toml::Value = toml::from_str("[a]\nb = 1").unwrap();
        let overlay: toml::Value = toml::from_str("a = 2").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged.get("a").unwrap().as_integer(), Some(2));
    }

    // =========================================================================
    // Unknown keys and validation
    // =========================================================================

    #[test]
    fn unknown_key_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[settings]\nqualty = 90\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn unknown_section_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[theme]\ndark = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_quality_boundaries() {
        let mut config = AppConfig::default();
        config.settings.quality = 100;
        assert!(config.validate().is_ok());
        config.settings.quality = 0;
        assert!(config.validate().is_ok());
        config.settings.quality = 101;
        assert!(config.validate().unwrap_err().to_string().contains("quality"));
    }

    #[test]
    fn validate_rejects_zero_dimension_and_debounce() {
        let mut config = AppConfig::default();
        config.settings.max_dimension = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.debounce_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_rejects_zero_avif_load_timeout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reimage.toml");
        fs::write(&path, "[avif]\nload_timeout_secs = 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("avif.load_timeout_secs"));
    }

    #[test]
    fn validate_rejects_avif_fallback_to_avif() {
        let mut config = AppConfig::default();
        config.avif.fallback_format = Some(EncodeFormat::Avif);
        assert!(config.validate().is_err());
        config.avif.fallback_format = Some(EncodeFormat::Webp);
        assert!(config.validate().is_ok());
    }

    // =========================================================================
    // Loading and saving
    // =========================================================================

    #[test]
    fn load_config_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("reimage.toml")).unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.processing.debounce_ms, 500);
        assert_eq!(config.avif.max_pixels, 100_000_000);
    }

    #[test]
    fn load_config_sparse_overlay() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reimage.toml");
        fs::write(
            &path,
            r#"
[settings]
output_format = "avif"

[avif]
fallback_format = "webp"
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.settings.output_format, OutputFormat::Avif);
        assert_eq!(config.settings.quality, 80);
        assert_eq!(config.avif.fallback_format, Some(EncodeFormat::Webp));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reimage.toml");
        fs::write(&path, "[settings]\nquality = 200\n").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn save_settings_roundtrips_and_keeps_other_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reimage.toml");
        fs::write(&path, "[processing]\nmax_workers = 2\n").unwrap();

        let mut settings = Settings::default();
        settings.apply_preset(Preset::HighQuality);
        settings.output_format = OutputFormat::Png;
        save_settings(&path, &settings).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.settings, settings);
        assert_eq!(config.processing.max_workers, Some(2));
    }

    #[test]
    fn save_settings_creates_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/reimage.toml");
        save_settings(&path, &Settings::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: AppConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.processing.debounce_ms, 500);
        assert_eq!(config.processing.max_workers, None);
        assert_eq!(config.avif.max_pixels, 100_000_000);
        assert_eq!(config.avif.fallback_format, None);
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value().unwrap();
        assert!(val.get("settings").is_some());
        assert!(val.get("processing").is_some());
        assert!(val.get("avif").is_some());
    }
}
