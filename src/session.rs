//! A processing session: the record store, the live settings, the batch
//! scheduler and the reprocessing coordinator, wired together.
//!
//! Settings live in a `watch` channel. The scheduler reads a snapshot per
//! file, and the coordinator reacts to every published change. Only the
//! settings are ever persisted; records exist for the lifetime of the
//! session.

use crate::config::{self, AppConfig, ConfigError, Preset, Settings};
use crate::export::{self, ExportError, ExportOutcome};
use crate::imaging::ImageBackend;
use crate::ingest::{attach_previews, validate_files};
use crate::reprocess::Coordinator;
use crate::scheduler::{ProcessEvent, RunSummary, Scheduler};
use crate::store::{FileRecord, MemoryStore, ProcessingFlag, RecordStore};
use crate::types::{FileId, OutputFormat, SourceFile};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("Unknown setting '{0}' (expected format, quality, max-dimension, near-lossless or preset)")]
    UnknownSetting(String),
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("No file matches '{0}'")]
    NoSuchFile(String),
}

/// Result of one `add_files` call.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Ids of newly created records (duplicates are not repeated).
    pub added: Vec<FileId>,
    /// One message per rejected submission.
    pub errors: Vec<String>,
    pub previews: usize,
    /// `None` when nothing was added.
    pub summary: Option<RunSummary>,
}

pub struct Session {
    config: AppConfig,
    config_path: PathBuf,
    store: Arc<MemoryStore>,
    settings_tx: watch::Sender<Settings>,
    scheduler: Arc<Scheduler>,
    coordinator: JoinHandle<()>,
}

impl Session {
    /// Build a session and start its reprocessing coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: AppConfig,
        config_path: impl Into<PathBuf>,
        backend: Arc<dyn ImageBackend>,
        events: Option<Sender<ProcessEvent>>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (settings_tx, settings_rx) = watch::channel(config.settings.clone());

        let mut scheduler = Scheduler::new(
            store.clone(),
            backend,
            settings_rx.clone(),
            ProcessingFlag::new(),
            &config.processing,
        );
        if let Some(tx) = events {
            scheduler = scheduler.with_events(tx);
        }
        let scheduler = Arc::new(scheduler);

        let coordinator = Coordinator::new(
            settings_rx,
            store.clone(),
            scheduler.clone(),
            Duration::from_millis(config.processing.debounce_ms),
        )
        .spawn();

        Self {
            config,
            config_path: config_path.into(),
            store,
            settings_tx,
            scheduler,
            coordinator,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn settings(&self) -> Settings {
        self.settings_tx.borrow().clone()
    }

    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.store.snapshot()
    }

    pub fn is_processing(&self) -> bool {
        self.scheduler.flag().is_processing()
    }

    /// Validate, add, attach previews and process.
    ///
    /// Waits for the run that picks the new records up. If another run is
    /// active it waits for that one to finish first, since an active run
    /// only covers records that were pending when it started.
    pub async fn add_files(&self, files: Vec<SourceFile>) -> AddOutcome {
        let validated = validate_files(files);
        let errors = validated.errors();
        let added = self.store.add_records(validated.accepted);
        if added.is_empty() {
            return AddOutcome {
                errors,
                ..AddOutcome::default()
            };
        }
        info!(added = added.len(), rejected = errors.len(), "files added");

        let store = self.store.clone();
        let ids = added.clone();
        let previews = tokio::task::spawn_blocking(move || attach_previews(store.as_ref(), &ids));

        let summary = loop {
            if let Some(summary) = self.scheduler.run().await {
                break summary;
            }
            self.scheduler.flag().wait_idle().await;
        };

        let previews = match previews.await {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "preview task failed");
                0
            }
        };

        AddOutcome {
            added,
            errors,
            previews,
            summary: Some(summary),
        }
    }

    /// Resolve a 1-based index (as shown by `status`) or a file name.
    pub fn find(&self, target: &str) -> Option<FileId> {
        let records = self.store.snapshot();
        if let Ok(index) = target.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| records.get(i))
                .map(|r| r.id.clone());
        }
        records
            .into_iter()
            .find(|r| r.source.name == target)
            .map(|r| r.id)
    }

    pub fn remove(&self, target: &str) -> Result<FileId, SessionError> {
        let id = self
            .find(target)
            .ok_or_else(|| SessionError::NoSuchFile(target.to_string()))?;
        self.store.remove_record(&id);
        Ok(id)
    }

    pub fn clear(&self) -> usize {
        let count = self.store.snapshot().len();
        self.store.clear_records();
        count
    }

    /// Apply `change` to a copy of the settings and publish it if valid.
    ///
    /// Observers are only notified when the settings actually changed.
    pub fn update_settings(
        &self,
        change: impl FnOnce(&mut Settings),
    ) -> Result<Settings, SessionError> {
        let mut next = self.settings();
        change(&mut next);
        next.validate()?;
        let published = next.clone();
        self.settings_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        debug!(?published, "settings updated");
        Ok(published)
    }

    pub fn apply_preset(&self, preset: Preset) -> Result<Settings, SessionError> {
        self.update_settings(|s| s.apply_preset(preset))
    }

    /// Set one setting from its textual form, as typed in the session.
    pub fn set(&self, key: &str, value: &str) -> Result<Settings, SessionError> {
        let invalid = |reason: String| SessionError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        };
        match key {
            "format" | "output-format" | "output_format" => {
                let format = OutputFormat::from_str(value).map_err(invalid)?;
                self.update_settings(|s| s.output_format = format)
            }
            "quality" => {
                let quality: u32 = value.parse().map_err(|e| invalid(format!("{e}")))?;
                self.update_settings(|s| s.quality = quality)
            }
            "max-dimension" | "max_dimension" => {
                let max: u32 = value.parse().map_err(|e| invalid(format!("{e}")))?;
                self.update_settings(|s| s.max_dimension = max)
            }
            "near-lossless" | "near_lossless" => {
                let on = parse_switch(value).ok_or_else(|| invalid("expected on or off".into()))?;
                self.update_settings(|s| s.near_lossless = on)
            }
            "preset" => {
                let preset = Preset::from_str(value).map_err(invalid)?;
                self.apply_preset(preset)
            }
            other => Err(SessionError::UnknownSetting(other.to_string())),
        }
    }

    /// Persist the current settings to the session's config file.
    pub fn save_settings(&self) -> Result<&Path, SessionError> {
        config::save_settings(&self.config_path, &self.settings())?;
        Ok(self.config_path.as_path())
    }

    pub fn export_zip(&self, dir: &Path) -> Result<ExportOutcome, SessionError> {
        let quality = self.settings().quality;
        Ok(export::export_zip(dir, &self.store.snapshot(), quality)?)
    }

    pub fn export_dir(&self, dir: &Path) -> Result<ExportOutcome, SessionError> {
        let quality = self.settings().quality;
        Ok(export::export_dir(dir, &self.store.snapshot(), quality)?)
    }

    /// Wait until no run is active and nothing is pending or armed.
    ///
    /// Gives the coordinator one debounce window to pick up a recent change.
    pub async fn settle(&self) {
        let window = Duration::from_millis(self.config.processing.debounce_ms);
        loop {
            self.scheduler.flag().wait_idle().await;
            tokio::time::sleep(window + Duration::from_millis(50)).await;
            if !self.scheduler.flag().is_processing() {
                break;
            }
        }
    }

    /// Stop the coordinator.
    pub async fn shutdown(self) {
        let Session {
            settings_tx,
            coordinator,
            ..
        } = self;
        drop(settings_tx);
        if let Err(err) = coordinator.await {
            warn!(%err, "reprocess coordinator ended abnormally");
        }
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// One line of input in an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Add(Vec<PathBuf>),
    Remove(String),
    Set { key: String, value: String },
    Preset(Preset),
    Status,
    Export { zip: bool },
    Save,
    Clear,
    Help,
    Quit,
}

pub const SESSION_HELP: &str = "\
Commands:
    add <path>...          add image files or directories
    remove <n|name>        remove a file by index or name
    set <key> <value>      format | quality | max-dimension | near-lossless
    preset <name>          high-quality | balanced | high-compression
    status                 show settings and files
    export [zip]           write processed files (or a zip) to the output dir
    save                   persist the current settings
    clear                  remove all files
    quit                   leave the session";

impl FromStr for SessionCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err("empty command".to_string());
        };
        let rest: Vec<&str> = words.collect();
        match (command, rest.as_slice()) {
            ("add", []) => Err("add needs at least one path".to_string()),
            ("add", paths) => Ok(SessionCommand::Add(
                paths.iter().map(PathBuf::from).collect(),
            )),
            ("remove" | "rm", [target]) => Ok(SessionCommand::Remove(target.to_string())),
            ("set", [key, value]) => Ok(SessionCommand::Set {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ("preset", [name]) => Ok(SessionCommand::Preset(Preset::from_str(name)?)),
            ("status" | "ls", []) => Ok(SessionCommand::Status),
            ("export", []) => Ok(SessionCommand::Export { zip: false }),
            ("export", ["zip"]) => Ok(SessionCommand::Export { zip: true }),
            ("save", []) => Ok(SessionCommand::Save),
            ("clear", []) => Ok(SessionCommand::Clear),
            ("help" | "?", []) => Ok(SessionCommand::Help),
            ("quit" | "exit" | "q", []) => Ok(SessionCommand::Quit),
            (other, _) => Err(format!("unrecognised command: {other} (try 'help')")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use crate::store::RecordStatus;
    use crate::types::EncodeFormat;
    use tempfile::TempDir;

    fn session(backend: MockBackend, dir: &Path) -> (Session, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let mut config = AppConfig::default();
        config.processing.debounce_ms = 50;
        let session = Session::new(config, dir.join("reimage.toml"), backend.clone(), None);
        (session, backend)
    }

    fn mock_file(name: &str, w: u32, h: u32) -> SourceFile {
        SourceFile::from_bytes(name, "image/jpeg", 1, MockBackend::source(w, h))
    }

    // =========================================================================
    // Commands
    // =========================================================================

    #[test]
    fn parse_commands() {
        assert_eq!(
            "add a.jpg dir".parse::<SessionCommand>().unwrap(),
            SessionCommand::Add(vec![PathBuf::from("a.jpg"), PathBuf::from("dir")])
        );
        assert_eq!(
            "set quality 55".parse::<SessionCommand>().unwrap(),
            SessionCommand::Set {
                key: "quality".into(),
                value: "55".into()
            }
        );
        assert_eq!(
            "preset high-compression".parse::<SessionCommand>().unwrap(),
            SessionCommand::Preset(Preset::HighCompression)
        );
        assert_eq!(
            "  export zip ".parse::<SessionCommand>().unwrap(),
            SessionCommand::Export { zip: true }
        );
        assert_eq!("q".parse::<SessionCommand>().unwrap(), SessionCommand::Quit);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("".parse::<SessionCommand>().is_err());
        assert!("add".parse::<SessionCommand>().is_err());
        assert!("preset turbo".parse::<SessionCommand>().is_err());
        assert!("frobnicate".parse::<SessionCommand>().is_err());
        assert!("set quality".parse::<SessionCommand>().is_err());
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    #[tokio::test]
    async fn add_processes_and_rejects() {
        let tmp = TempDir::new().unwrap();
        let (session, backend) = session(MockBackend::new(), tmp.path());

        let outcome = session
            .add_files(vec![
                mock_file("a.jpg", 3000, 1500),
                SourceFile::from_bytes("anim.gif", "image/gif", 1, vec![0; 4]),
            ])
            .await;

        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.errors, vec!["Unsupported format: anim.gif".to_string()]);
        assert_eq!(outcome.summary.unwrap().completed, 1);
        assert_eq!(backend.encode_count(), 1);

        let records = session.snapshot();
        assert_eq!(records.len(), 1);
        let artifact = records[0].artifact.as_ref().unwrap();
        assert_eq!((artifact.width, artifact.height), (3000, 1500));
        assert_eq!(artifact.format, EncodeFormat::Webp);
    }

    #[tokio::test]
    async fn duplicate_add_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let (session, backend) = session(MockBackend::new(), tmp.path());
        session.add_files(vec![mock_file("a.jpg", 10, 10)]).await;
        let again = session.add_files(vec![mock_file("a.jpg", 10, 10)]).await;
        assert!(again.added.is_empty());
        assert!(again.summary.is_none());
        assert_eq!(backend.encode_count(), 1);
    }

    #[tokio::test]
    async fn settings_change_reprocesses() {
        let tmp = TempDir::new().unwrap();
        let (session, _backend) = session(MockBackend::new(), tmp.path());
        session.add_files(vec![mock_file("a.jpg", 400, 200)]).await;

        session.set("max-dimension", "100").unwrap();
        session.set("format", "png").unwrap();
        session.settle().await;

        let records = session.snapshot();
        assert_eq!(records[0].status, RecordStatus::Completed);
        let artifact = records[0].artifact.as_ref().unwrap();
        assert_eq!(artifact.width, 100);
        assert_eq!(artifact.format, EncodeFormat::Png);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_settings_are_not_published() {
        let tmp = TempDir::new().unwrap();
        let (session, _) = session(MockBackend::new(), tmp.path());

        assert!(matches!(
            session.set("quality", "101"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            session.set("quality", "high"),
            Err(SessionError::InvalidValue { .. })
        ));
        assert!(matches!(
            session.set("colour", "red"),
            Err(SessionError::UnknownSetting(_))
        ));
        assert_eq!(session.settings(), Settings::default());

        let s = session.set("preset", "high-quality").unwrap();
        assert_eq!((s.quality, s.max_dimension), (95, 4096));
        assert!(session.set("near-lossless", "on").unwrap().near_lossless);
    }

    #[tokio::test]
    async fn remove_by_index_or_name_and_clear() {
        let tmp = TempDir::new().unwrap();
        let (session, _) = session(MockBackend::new(), tmp.path());
        session
            .add_files(vec![
                mock_file("a.jpg", 10, 10),
                mock_file("b.jpg", 10, 10),
                mock_file("c.jpg", 10, 10),
            ])
            .await;

        session.remove("2").unwrap();
        session.remove("c.jpg").unwrap();
        assert!(matches!(
            session.remove("zzz.jpg"),
            Err(SessionError::NoSuchFile(_))
        ));
        let names: Vec<String> = session
            .snapshot()
            .into_iter()
            .map(|r| r.source.name)
            .collect();
        assert_eq!(names, vec!["a.jpg"]);

        assert_eq!(session.clear(), 1);
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test]
    async fn export_and_save() {
        let tmp = TempDir::new().unwrap();
        let (session, _) = session(MockBackend::new(), tmp.path());
        session.add_files(vec![mock_file("a.jpg", 40, 20)]).await;

        let out = tmp.path().join("out");
        let outcome = session.export_dir(&out).unwrap();
        assert_eq!(outcome.files, 1);
        assert!(out.join("a_w40_q80.webp").exists());

        session.set("quality", "42").unwrap();
        let path = session.save_settings().unwrap().to_path_buf();
        let loaded = config::load_config(&path).unwrap();
        assert_eq!(loaded.settings.quality, 42);
    }
}
