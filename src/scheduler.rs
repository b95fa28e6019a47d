//! Batch scheduler: drive every pending record through the pipeline.
//!
//! Each file runs decode → resize → extract RGBA → encode → publish, with
//! progress written to the store at every step:
//!
//! ```text
//! processing 0 → 10 decode → 30 resize → 50 pixels → 70 encode → 100 completed
//! ```
//!
//! Pending files are split into sequential batches of `W` concurrent tasks,
//! where `W = max(1, cores - 1)` (further limited by `[processing]
//! max_workers` and by the number of pending files). A batch settles
//! completely before the next starts.
//!
//! A file's failure is caught at its own task boundary and recorded on its
//! record; it never affects siblings and nothing is returned as an error.

use crate::config::{ProcessingConfig, Settings, effective_workers};
use crate::imaging::{BackendError, EncodeParams, ImageBackend, Quality};
use crate::store::{
    ProcessedArtifact, ProcessingFlag, RecordStatus, RecordStore, RecordUpdate,
};
use crate::types::{EncodeFormat, FileId, SourceFile};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Progress events for display. Sent best-effort; a closed channel is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    BatchStarted {
        index: usize,
        batches: usize,
        files: usize,
    },
    FileCompleted {
        name: String,
        format: EncodeFormat,
        width: u32,
        height: u32,
        size: u64,
        original_size: u64,
    },
    FileFailed {
        name: String,
        error: String,
    },
}

/// What one `process_all` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Records that were removed or no longer pending when their task started.
    pub skipped: usize,
    pub batches: usize,
}

enum Outcome {
    Completed,
    Failed,
    Skipped,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Shared state each file task needs.
#[derive(Clone)]
struct TaskContext {
    store: Arc<dyn RecordStore>,
    backend: Arc<dyn ImageBackend>,
    settings: watch::Receiver<Settings>,
    events: Option<Sender<ProcessEvent>>,
}

impl TaskContext {
    /// Write an update, treating a vanished record as a no-op.
    fn update(&self, id: &FileId, update: RecordUpdate) {
        if let Err(err) = self.store.update_record(id, update) {
            warn!(%err, "rejected record update");
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct Scheduler {
    ctx: TaskContext,
    flag: ProcessingFlag,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn ImageBackend>,
        settings: watch::Receiver<Settings>,
        flag: ProcessingFlag,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            ctx: TaskContext {
                store,
                backend,
                settings,
                events: None,
            },
            flag,
            max_workers: effective_workers(config),
        }
    }

    /// Send [`ProcessEvent`]s to `tx` from now on.
    pub fn with_events(mut self, tx: Sender<ProcessEvent>) -> Self {
        self.ctx.events = Some(tx);
        self
    }

    /// Override the concurrency width (clamped to at least 1).
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn flag(&self) -> &ProcessingFlag {
        &self.flag
    }

    /// Run [`process_all`](Self::process_all) unless another run is active.
    ///
    /// Returns `None` without doing anything when the flag is already held.
    pub async fn run(&self) -> Option<RunSummary> {
        let Some(_guard) = self.flag.try_acquire() else {
            debug!("scheduler run skipped, already processing");
            return None;
        };
        Some(self.process_all().await)
    }

    /// Process every record that is `pending` right now.
    ///
    /// Callers are responsible for single-flight; use [`run`](Self::run)
    /// unless a [`ProcessingGuard`](crate::store::ProcessingGuard) is
    /// already held.
    pub async fn process_all(&self) -> RunSummary {
        let pending: Vec<FileId> = self
            .ctx
            .store
            .snapshot()
            .into_iter()
            .filter(|r| r.status == RecordStatus::Pending)
            .map(|r| r.id)
            .collect();

        let mut summary = RunSummary::default();
        if pending.is_empty() {
            return summary;
        }

        let width = self.max_workers.min(pending.len()).max(1);
        let batches = pending.len().div_ceil(width);
        info!(files = pending.len(), width, batches, "processing pending files");

        for (index, batch) in pending.chunks(width).enumerate() {
            debug!(batch = index + 1, of = batches, size = batch.len(), "starting batch");
            self.ctx.emit(ProcessEvent::BatchStarted {
                index: index + 1,
                batches,
                files: batch.len(),
            });

            let mut set = JoinSet::new();
            for id in batch {
                set.spawn(process_file(self.ctx.clone(), id.clone()));
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => summary.record(outcome),
                    Err(err) => error!(%err, "file task aborted"),
                }
            }

            // A panicked task leaves its record mid-flight; close it out.
            for id in batch {
                let stuck = self
                    .ctx
                    .store
                    .get(id)
                    .is_some_and(|r| r.status == RecordStatus::Processing);
                if stuck {
                    self.ctx
                        .update(id, RecordUpdate::failed("Processing task aborted unexpectedly"));
                    summary.failed += 1;
                }
            }
            summary.batches += 1;
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "processing finished"
        );
        summary
    }
}

/// One file, start to finish. Never returns an error.
async fn process_file(ctx: TaskContext, id: FileId) -> Outcome {
    let Some(record) = ctx.store.get(&id) else {
        return Outcome::Skipped;
    };
    if record.status != RecordStatus::Pending {
        return Outcome::Skipped;
    }
    let settings = ctx.settings.borrow().clone();
    let source = record.source;

    if !matches!(ctx.store.update_record(&id, RecordUpdate::started()), Ok(true)) {
        return Outcome::Skipped;
    }

    match run_steps(&ctx, &id, &source, &settings).await {
        Ok(artifact) => {
            let event = ProcessEvent::FileCompleted {
                name: source.name.clone(),
                format: artifact.format,
                width: artifact.width,
                height: artifact.height,
                size: artifact.size,
                original_size: artifact.original_size,
            };
            ctx.update(&id, RecordUpdate::completed(artifact));
            ctx.emit(event);
            Outcome::Completed
        }
        Err(err) => {
            let message = err.to_string();
            warn!(name = %source.name, error = %message, "file failed");
            ctx.update(&id, RecordUpdate::failed(message.clone()));
            ctx.emit(ProcessEvent::FileFailed {
                name: source.name,
                error: message,
            });
            Outcome::Failed
        }
    }
}

async fn run_steps(
    ctx: &TaskContext,
    id: &FileId,
    source: &SourceFile,
    settings: &Settings,
) -> Result<ProcessedArtifact, BackendError> {
    ctx.update(id, RecordUpdate::progress(10));
    let decoded = ctx.backend.decode(Arc::clone(&source.bytes)).await?;

    ctx.update(id, RecordUpdate::progress(30));
    let resized = ctx.backend.resize(decoded, settings.max_dimension).await?;

    ctx.update(id, RecordUpdate::progress(50));
    let pixels = Arc::new(resized.into_rgba8());
    let (width, height) = pixels.dimensions();

    ctx.update(id, RecordUpdate::progress(70));
    let params = EncodeParams {
        format: settings.output_format.resolve(&source.mime),
        quality: Quality::new(settings.quality),
        near_lossless: settings.near_lossless,
    };
    let encoded = ctx.backend.encode(pixels, params).await?;

    Ok(ProcessedArtifact {
        size: encoded.bytes.len() as u64,
        bytes: encoded.bytes,
        format: encoded.format,
        width,
        height,
        original_size: source.size,
        quality: settings.quality,
    })
}
