//! Progress reporting and cancellation, supplied by the caller.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Events emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A stage is about to process `total` items.
    Started { total: usize },
    /// One item finished.
    Tick,
    /// Something the user should know about that does not stop the job.
    Warning(String),
}

/// Sink for [`ProgressEvent`]s and source of the cancellation flag.
///
/// Implementations are shared between the orchestrator and nothing else; workers never see
/// them.
pub trait Progress: Send + Sync {
    fn tick(&self, event: ProgressEvent);

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Ignores every event and is never cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn tick(&self, _event: ProgressEvent) {}
}

/// Counting implementation backed by atomics.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicBool,
    warnings: Mutex<Vec<String>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the running stage notices it at its next poll.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> Vec<String> {
        match self.warnings.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Progress for ProgressTracker {
    fn tick(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { total } => {
                self.total.store(total, Ordering::SeqCst);
                self.completed.store(0, Ordering::SeqCst);
            }
            ProgressEvent::Tick => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            ProgressEvent::Warning(message) => match self.warnings.lock() {
                Ok(mut guard) => guard.push(message),
                Err(poisoned) => poisoned.into_inner().push(message),
            },
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
