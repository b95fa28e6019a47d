//! File record store: the single source of truth for per-file state.
//!
//! Every submitted image gets one [`FileRecord`], keyed by its [`FileId`].
//! Records only change through [`RecordStore::update_record`], which merges a
//! [`RecordUpdate`] into the stored record and enforces the per-file state
//! machine:
//!
//! ```text
//! pending ──start──▶ processing ──success──▶ completed
//!                        │                      │
//!                        └──failure──▶ error    │
//!                                        │      │
//!            pending ◀──reprocess────────┴──────┘
//! ```
//!
//! Updates addressed to an id that is no longer present are accepted as a
//! no-op: a file removed mid-encode simply drops its result.
//!
//! [`ProcessingFlag`] is the single-flight guard for scheduler runs.

use crate::types::{EncodeFormat, FileId, SourceFile};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl RecordStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Processing)
                    | (Processing, Completed)
                    | (Processing, Error)
                    | (Completed, Pending)
                    | (Error, Pending)
            )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Error)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Error => "error",
        })
    }
}

/// The result of one successful encode. Replaced wholesale on reprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedArtifact {
    pub bytes: Vec<u8>,
    /// Format actually written (may differ from the request when AVIF fell back).
    pub format: EncodeFormat,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub original_size: u64,
    /// UI quality the artifact was encoded with.
    pub quality: u32,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: FileId,
    pub source: SourceFile,
    /// Small JPEG preview, filled in after ingestion.
    pub preview: Option<Arc<[u8]>>,
    pub status: RecordStatus,
    pub progress: u8,
    pub artifact: Option<Arc<ProcessedArtifact>>,
    pub error: Option<String>,
}

impl FileRecord {
    pub fn new(source: SourceFile) -> Self {
        Self {
            id: source.id(),
            source,
            preview: None,
            status: RecordStatus::Pending,
            progress: 0,
            artifact: None,
            error: None,
        }
    }

    /// `completed` ⇔ artifact only, `error` ⇔ message only, otherwise neither.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            RecordStatus::Completed => self.artifact.is_some() && self.error.is_none(),
            RecordStatus::Error => self.error.is_some() && self.artifact.is_none(),
            RecordStatus::Pending | RecordStatus::Processing => {
                self.artifact.is_none() && self.error.is_none()
            }
        }
    }
}

/// A partial update. Only the fields that are `Some` change.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    pub progress: Option<u8>,
    pub artifact: Option<Option<Arc<ProcessedArtifact>>>,
    pub error: Option<Option<String>>,
    pub preview: Option<Arc<[u8]>>,
}

impl RecordUpdate {
    /// `pending → processing` at progress 0.
    pub fn started() -> Self {
        Self {
            status: Some(RecordStatus::Processing),
            progress: Some(0),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Self::default()
        }
    }

    pub fn completed(artifact: ProcessedArtifact) -> Self {
        Self {
            status: Some(RecordStatus::Completed),
            progress: Some(100),
            artifact: Some(Some(Arc::new(artifact))),
            error: Some(None),
            preview: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RecordStatus::Error),
            artifact: Some(None),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Back to `pending`, clearing progress, artifact and error.
    pub fn reset() -> Self {
        Self {
            status: Some(RecordStatus::Pending),
            progress: Some(0),
            artifact: Some(None),
            error: Some(None),
            preview: None,
        }
    }

    pub fn preview(bytes: Vec<u8>) -> Self {
        Self {
            preview: Some(bytes.into()),
            ..Self::default()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: FileId,
        from: RecordStatus,
        to: RecordStatus,
    },
    #[error("{id}: progress cannot go back from {from} to {to}")]
    ProgressRegression { id: FileId, from: u8, to: u8 },
    #[error("{id}: update would leave a {status} record inconsistent")]
    Inconsistent { id: FileId, status: RecordStatus },
}

/// Merge `update` into `record`, rejecting anything the state machine forbids.
///
/// The record is left untouched when an error is returned.
pub fn apply_update(record: &mut FileRecord, update: RecordUpdate) -> Result<(), StoreError> {
    let mut next = record.clone();
    if let Some(status) = update.status {
        if !record.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                id: record.id.clone(),
                from: record.status,
                to: status,
            });
        }
        next.status = status;
    }
    if let Some(progress) = update.progress {
        let continuing = record.status == RecordStatus::Processing
            && next.status == RecordStatus::Processing;
        if continuing && progress < record.progress {
            return Err(StoreError::ProgressRegression {
                id: record.id.clone(),
                from: record.progress,
                to: progress,
            });
        }
        next.progress = progress;
    }
    if let Some(artifact) = update.artifact {
        next.artifact = artifact;
    }
    if let Some(error) = update.error {
        next.error = error;
    }
    if let Some(preview) = update.preview {
        next.preview = Some(preview);
    }
    if !next.is_consistent() {
        return Err(StoreError::Inconsistent {
            id: record.id.clone(),
            status: next.status,
        });
    }
    *record = next;
    Ok(())
}

/// Read-snapshot and scoped-mutation interface over the records.
pub trait RecordStore: Send + Sync {
    /// Add records for `files`, skipping ids already present.
    ///
    /// Returns the ids actually added, in submission order.
    fn add_records(&self, files: Vec<SourceFile>) -> Vec<FileId>;

    /// Merge `update` into the record with `id`.
    ///
    /// Returns `Ok(false)` when no such record exists.
    fn update_record(&self, id: &FileId, update: RecordUpdate) -> Result<bool, StoreError>;

    /// Remove a record, releasing its source bytes and artifact.
    fn remove_record(&self, id: &FileId) -> bool;

    fn clear_records(&self);

    /// All records in submission order.
    fn snapshot(&self) -> Vec<FileRecord>;

    fn get(&self, id: &FileId) -> Option<FileRecord> {
        self.snapshot().into_iter().find(|r| &r.id == id)
    }

    /// Move every `completed`/`error` record back to `pending`.
    ///
    /// Returns how many records were reset.
    fn reset_finished(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|r| r.status.is_finished())
            .filter(|r| matches!(self.update_record(&r.id, RecordUpdate::reset()), Ok(true)))
            .count()
    }
}

#[derive(Default)]
struct Records {
    by_id: HashMap<FileId, FileRecord>,
    order: Vec<FileId>,
}

/// In-memory [`RecordStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn add_records(&self, files: Vec<SourceFile>) -> Vec<FileId> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();
        for file in files {
            let record = FileRecord::new(file);
            if inner.by_id.contains_key(&record.id) {
                debug!(id = %record.id, name = %record.source.name, "skipping duplicate file");
                continue;
            }
            added.push(record.id.clone());
            inner.order.push(record.id.clone());
            inner.by_id.insert(record.id.clone(), record);
        }
        added
    }

    fn update_record(&self, id: &FileId, update: RecordUpdate) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.by_id.get_mut(id) {
            Some(record) => apply_update(record, update).map(|()| true),
            None => {
                debug!(%id, "update for unknown record ignored");
                Ok(false)
            }
        }
    }

    fn remove_record(&self, id: &FileId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.by_id.remove(id).is_some();
        if removed {
            inner.order.retain(|other| other != id);
        }
        removed
    }

    fn clear_records(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.clear();
        inner.order.clear();
    }

    fn snapshot(&self) -> Vec<FileRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    fn get(&self, id: &FileId) -> Option<FileRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(id).cloned()
    }
}

/// Single-flight guard for scheduler runs.
///
/// At most one [`ProcessingGuard`] exists at a time; dropping it clears the
/// flag and wakes anyone in [`ProcessingFlag::wait_idle`].
#[derive(Clone)]
pub struct ProcessingFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ProcessingFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingFlag {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn is_processing(&self) -> bool {
        *self.tx.borrow()
    }

    /// Claim the flag, or `None` if a run is already active.
    pub fn try_acquire(&self) -> Option<ProcessingGuard> {
        let acquired = self.tx.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then(|| ProcessingGuard {
            tx: Arc::clone(&self.tx),
        })
    }

    /// Resolve once no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}

/// Proof that the holder is the only active scheduler run.
pub struct ProcessingGuard {
    tx: Arc<watch::Sender<bool>>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.tx.send_replace(false);
    }
}
