//! Settings-driven reprocessing.
//!
//! When the encode settings change, finished files (`completed` or `error`)
//! are redone with the new settings. Changes are debounced so dragging a
//! quality slider produces one rerun, not fifty.
//!
//! The decision logic is the pure [`Debounce`] state machine:
//!
//! ```text
//! idle ──change──▶ armed(deadline) ──deadline──▶ firing ──run done──▶ idle
//!                    ▲      │
//!                    └change┘ (deadline pushed back)
//! ```
//!
//! A change observed while a scheduler run is active never starts a second
//! run. It is remembered as *deferred*, and once the run finishes the
//! debounce is armed again so the finished files still get redone.
//!
//! [`Coordinator`] is the async driver: it feeds the state machine from the
//! settings channel, the deadline timer and the processing flag.

use crate::config::Settings;
use crate::scheduler::Scheduler;
use crate::store::{ProcessingFlag, RecordStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Armed { deadline: Instant },
    Firing,
}

/// What the driver should do after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing changed.
    Unchanged,
    /// Snapshot updated; nothing to redo.
    Observed,
    /// A run is active; retry once it finishes.
    Deferred,
    /// Timer (re)started.
    Armed(Instant),
    /// Not yet due.
    Waiting,
    /// Start the rerun now.
    Fire,
}

/// Pure debounce state machine. Time and store facts are passed in.
#[derive(Debug, Clone)]
pub struct Debounce {
    state: DebounceState,
    deferred: bool,
    last_observed: Settings,
    window: Duration,
}

impl Debounce {
    pub fn new(initial: Settings, window: Duration) -> Self {
        Self {
            state: DebounceState::Idle,
            deferred: false,
            last_observed: initial,
            window,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn last_observed(&self) -> &Settings {
        &self.last_observed
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn on_settings_changed(
        &mut self,
        settings: &Settings,
        now: Instant,
        has_finished: bool,
        processing: bool,
    ) -> Decision {
        if *settings == self.last_observed {
            return Decision::Unchanged;
        }
        if !has_finished {
            self.last_observed = settings.clone();
            return Decision::Observed;
        }
        if processing {
            self.last_observed = settings.clone();
            self.defer();
            return Decision::Deferred;
        }
        let deadline = now + self.window;
        self.state = DebounceState::Armed { deadline };
        self.deferred = false;
        Decision::Armed(deadline)
    }

    /// The timer fired. Re-checks the processing flag before firing.
    pub fn on_deadline(&mut self, now: Instant, processing: bool) -> Decision {
        match self.state {
            DebounceState::Armed { deadline } if now >= deadline => {
                if processing {
                    self.defer();
                    Decision::Deferred
                } else {
                    self.state = DebounceState::Firing;
                    self.deferred = false;
                    Decision::Fire
                }
            }
            _ => Decision::Waiting,
        }
    }

    /// Another run took the flag between the deadline and the fire.
    pub fn on_fire_blocked(&mut self) -> Decision {
        self.defer();
        Decision::Deferred
    }

    /// The processing flag went idle.
    pub fn on_idle(&mut self, now: Instant, has_finished: bool) -> Decision {
        if !self.deferred || self.state != DebounceState::Idle {
            return Decision::Unchanged;
        }
        self.deferred = false;
        if !has_finished {
            return Decision::Observed;
        }
        let deadline = now + self.window;
        self.state = DebounceState::Armed { deadline };
        Decision::Armed(deadline)
    }

    /// The rerun finished. Settings that moved during the run defer another one.
    pub fn on_run_finished(&mut self, started_with: &Settings, finished_with: &Settings) -> Decision {
        self.state = DebounceState::Idle;
        self.last_observed = finished_with.clone();
        self.deferred = started_with != finished_with;
        if self.deferred {
            Decision::Deferred
        } else {
            Decision::Observed
        }
    }

    fn defer(&mut self) {
        self.state = DebounceState::Idle;
        self.deferred = true;
    }
}

/// Async driver around [`Debounce`].
pub struct Coordinator {
    debounce: Debounce,
    settings: watch::Receiver<Settings>,
    store: Arc<dyn RecordStore>,
    scheduler: Arc<Scheduler>,
    flag: ProcessingFlag,
}

impl Coordinator {
    pub fn new(
        settings: watch::Receiver<Settings>,
        store: Arc<dyn RecordStore>,
        scheduler: Arc<Scheduler>,
        window: Duration,
    ) -> Self {
        let initial = settings.borrow().clone();
        let flag = scheduler.flag().clone();
        Self {
            debounce: Debounce::new(initial, window),
            settings,
            store,
            scheduler,
            flag,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.drive())
    }

    fn has_finished(&self) -> bool {
        self.store.snapshot().iter().any(|r| r.status.is_finished())
    }

    /// Run until the settings sender is dropped.
    pub async fn drive(mut self) {
        loop {
            let deadline = self.debounce.deadline();
            let wait_for_idle = self.debounce.is_deferred() && deadline.is_none();
            let timer = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = self.settings.changed() => {
                    if changed.is_err() {
                        debug!("settings channel closed, stopping reprocess coordinator");
                        break;
                    }
                    let settings = self.settings.borrow_and_update().clone();
                    let decision = self.debounce.on_settings_changed(
                        &settings,
                        Instant::now(),
                        self.has_finished(),
                        self.flag.is_processing(),
                    );
                    debug!(?decision, "settings changed");
                }
                _ = timer => {
                    let decision = self.debounce.on_deadline(Instant::now(), self.flag.is_processing());
                    debug!(?decision, "debounce deadline");
                    if decision == Decision::Fire {
                        self.fire().await;
                    }
                }
                _ = self.flag.wait_idle(), if wait_for_idle => {
                    let decision = self.debounce.on_idle(Instant::now(), self.has_finished());
                    debug!(?decision, "processing went idle");
                }
            }
        }
    }

    async fn fire(&mut self) {
        let Some(guard) = self.flag.try_acquire() else {
            let decision = self.debounce.on_fire_blocked();
            debug!(?decision, "processing started during debounce");
            return;
        };
        let started_with = self.settings.borrow().clone();
        let reset = self.store.reset_finished();
        info!(files = reset, "reprocessing after settings change");
        self.scheduler.process_all().await;
        drop(guard);

        let finished_with = self.settings.borrow().clone();
        let decision = self.debounce.on_run_finished(&started_with, &finished_with);
        debug!(?decision, "reprocess run finished");
    }
}
