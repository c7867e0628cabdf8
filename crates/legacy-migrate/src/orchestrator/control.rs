//! Run control and error reporting handed to every unit of work.
//!
//! Seeding batches, validation queries and auth-removal files call
//! [`RunControl::checkpoint`] before they start. Pause blocks there, cancel
//! makes it return false. Units never change the run status themselves;
//! they report errors and progress through [`RunReporter`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::progress::ProgressTracker;
use crate::history::{ErrorLevel, MigrationError, Phase};

/// Cooperative pause/cancel signal for one run.
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(tx),
        }
    }

    /// Stop starting new units. In-flight units finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Token that fires on cancel, for `select!` in long waits.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Boundary check before a unit of work.
    ///
    /// Waits while the run is paused. Returns false once the run is
    /// cancelled, including when cancelled during a pause.
    pub async fn checkpoint(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects errors, progress and the current operation label for a run.
#[derive(Clone)]
pub struct RunReporter {
    migration_id: Arc<str>,
    errors: Arc<Mutex<Vec<MigrationError>>>,
    operation: Arc<Mutex<String>>,
    progress: Arc<ProgressTracker>,
}

impl RunReporter {
    pub fn new(migration_id: &str) -> Self {
        Self {
            migration_id: Arc::from(migration_id),
            errors: Arc::new(Mutex::new(Vec::new())),
            operation: Arc::new(Mutex::new(Phase::Initialization.label().to_string())),
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    /// Record an error in the run's ordered error list and log it.
    pub fn record(&self, err: MigrationError) {
        let id = err.identifier().unwrap_or("-");
        match err.level {
            ErrorLevel::Warning => warn!("[{:?}] {}: {}", err.phase, id, err.message),
            ErrorLevel::Error | ErrorLevel::Fatal => {
                error!("[{:?}] {:?} {}: {}", err.phase, err.level, id, err.message)
            }
        }
        self.errors.lock().push(err);
    }

    pub fn errors(&self) -> Vec<MigrationError> {
        self.errors.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn has_fatal(&self) -> bool {
        self.errors.lock().iter().any(|e| e.level == ErrorLevel::Fatal)
    }

    pub fn set_operation(&self, label: impl Into<String>) {
        *self.operation.lock() = label.into();
    }

    pub fn operation(&self) -> String {
        self.operation.lock().clone()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }
}

/// Everything a phase needs from the run that owns it.
#[derive(Clone)]
pub struct RunContext {
    pub control: RunControl,
    pub reporter: RunReporter,
}

impl RunContext {
    pub fn new(migration_id: &str) -> Self {
        Self {
            control: RunControl::new(),
            reporter: RunReporter::new(migration_id),
        }
    }

    /// Context not attached to any orchestrated run, for calling a phase
    /// component directly.
    pub fn detached() -> Self {
        Self::new("detached")
    }
}
