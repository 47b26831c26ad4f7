//! Concurrent page processing.
//!
//! Every image in the workspace becomes one blocking render task. Tasks start through a
//! semaphore so at most `workers` renders run at once. The supervisor loop drains results,
//! ticks progress and polls the cancellation flag; the first failure (or a cancellation)
//! closes the semaphore, waits for the renders already running, and deletes the workspace.
//! No partial result ever leaves this module.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rayon::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet, spawn_blocking};

use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressEvent};
use crate::renderer::{ImageRenderer, PageRenderer, RENDERED_MARKER};
use crate::types::{PageRecord, ProcessingOptions, is_image_file};
use crate::workspace::{Workspace, list_files_recursive};

/// How often the supervisor re-checks the cancellation flag while no task finishes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Rough peak memory of one render.
const MEMORY_PER_WORKER: u64 = 512 * 1024 * 1024;
/// Share of low-resolution sources above which the user is warned.
const SMALL_IMAGE_WARNING_RATIO: f64 = 0.25;

/// Failure reported by a worker, as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub message: String,
    pub trace: String,
}

impl From<WorkerFailure> for Error {
    fn from(failure: WorkerFailure) -> Self {
        Error::WorkerFailed {
            message: failure.message,
            trace: failure.trace,
        }
    }
}

/// Result of one page task.
#[derive(Debug)]
pub enum TaskOutcome {
    Pages(Vec<PageRecord>),
    Failed(WorkerFailure),
    /// The run was aborted before the task acquired a worker slot.
    Skipped,
}

/// Outcome of the verification pass.
#[derive(Debug, Default)]
pub struct PrePass {
    pub images: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Worker count from the CPU count, lowered when free memory is short.
pub fn default_worker_count() -> usize {
    let cpus = num_cpus::get().max(1);
    match available_memory() {
        Some(bytes) => cpus.min((bytes / MEMORY_PER_WORKER).max(1) as usize),
        None => cpus,
    }
}

fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn join_failure(error: JoinError) -> WorkerFailure {
    if error.is_panic() {
        let payload = error.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        WorkerFailure {
            trace: format!("panic: {message}"),
            message,
        }
    } else {
        WorkerFailure {
            message: error.to_string(),
            trace: format!("{error:?}"),
        }
    }
}

/// Runs the render pipeline over every image of a workspace.
pub struct PageProcessor {
    renderer: Arc<dyn PageRenderer>,
    options: Arc<ProcessingOptions>,
    workers: usize,
}

impl std::fmt::Debug for PageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageProcessor")
            .field("options", &self.options)
            .field("workers", &self.workers)
            .finish()
    }
}

impl PageProcessor {
    pub fn new(options: ProcessingOptions) -> Self {
        Self {
            renderer: Arc::new(ImageRenderer::new()),
            options: Arc::new(options),
            workers: default_worker_count(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Overrides the worker count (values below 1 are raised to 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Removes non-image files and verifies every image. Nothing is rendered.
    pub fn pre_pass(&self, workspace: &Workspace) -> Result<PrePass> {
        let mut pass = PrePass::default();
        for path in list_files_recursive(&workspace.images_dir())? {
            if is_image_file(&path) {
                pass.images.push(path);
            } else {
                log::debug!("Removing non-image file {:?}", path);
                std::fs::remove_file(&path)?;
                pass.removed.push(path);
            }
        }

        let renderer = Arc::clone(&self.renderer);
        pass.images
            .par_iter()
            .try_for_each(|image| renderer.verify(image))?;

        if pass.images.iter().any(|p| {
            p.file_stem()
                .is_some_and(|s| s.to_string_lossy().ends_with(RENDERED_MARKER))
        }) {
            pass.warnings.push(
                "Source files look like they were already processed by this converter."
                    .to_string(),
            );
        }

        let profile = &self.options.profile;
        let small = pass
            .images
            .par_iter()
            .filter(|p| {
                image::image_dimensions(p)
                    .map(|(w, h)| w < profile.width && h < profile.height)
                    .unwrap_or(false)
            })
            .count();
        if !pass.images.is_empty()
            && small as f64 / pass.images.len() as f64 > SMALL_IMAGE_WARNING_RATIO
        {
            pass.warnings.push(format!(
                "{small} of {} source images are smaller than the {}x{} target resolution.",
                pass.images.len(),
                profile.width,
                profile.height
            ));
        }

        for warning in &pass.warnings {
            log::warn!("{warning}");
        }
        Ok(pass)
    }

    /// Processes every image of `workspace`.
    ///
    /// On success the returned records are sorted by file name and the source images are
    /// deleted. On any failure, including cancellation, the workspace is removed.
    pub async fn process(
        &self,
        workspace: &Workspace,
        progress: &dyn Progress,
    ) -> Result<Vec<PageRecord>> {
        let pass = match self.pre_pass(workspace) {
            Ok(pass) => pass,
            Err(e) => {
                Self::discard(workspace);
                return Err(e);
            }
        };
        if pass.images.is_empty() {
            Self::discard(workspace);
            return Err(Error::EmptySource(workspace.images_dir()));
        }

        progress.tick(ProgressEvent::Started {
            total: pass.images.len(),
        });
        for warning in &pass.warnings {
            progress.tick(ProgressEvent::Warning(warning.clone()));
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let abort = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

        for image in pass.images.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let abort = Arc::clone(&abort);
            let renderer = Arc::clone(&self.renderer);
            let options = Arc::clone(&self.options);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TaskOutcome::Skipped;
                };
                if abort.load(Ordering::SeqCst) {
                    return TaskOutcome::Skipped;
                }
                match spawn_blocking(move || renderer.render(&image, &options)).await {
                    Ok(Ok(pages)) => TaskOutcome::Pages(pages),
                    Ok(Err(e)) => TaskOutcome::Failed(WorkerFailure {
                        message: e.to_string(),
                        trace: format!("{e:?}"),
                    }),
                    Err(join) => TaskOutcome::Failed(join_failure(join)),
                }
            });
        }

        let mut records = Vec::new();
        let mut failure: Option<Error> = None;
        loop {
            if progress.is_cancelled() {
                failure = Some(Error::Cancelled);
                break;
            }
            match tokio::time::timeout(POLL_INTERVAL, tasks.join_next()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Ok(TaskOutcome::Pages(pages)))) => {
                    records.extend(pages);
                    progress.tick(ProgressEvent::Tick);
                }
                Ok(Some(Ok(TaskOutcome::Skipped))) => {}
                Ok(Some(Ok(TaskOutcome::Failed(f)))) => {
                    failure = Some(f.into());
                    break;
                }
                Ok(Some(Err(join))) => {
                    failure = Some(join_failure(join).into());
                    break;
                }
            }
        }

        if let Some(error) = failure {
            log::error!("Page processing aborted: {error}");
            abort.store(true, Ordering::SeqCst);
            semaphore.close();
            while tasks.join_next().await.is_some() {}
            Self::discard(workspace);
            return Err(error);
        }

        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        for image in &pass.images {
            std::fs::remove_file(image)?;
        }
        log::info!(
            "Processed {} images into {} pages",
            pass.images.len(),
            records.len()
        );
        Ok(records)
    }

    fn discard(workspace: &Workspace) {
        if let Err(e) = workspace.remove() {
            log::error!("Failed to remove workspace {:?}: {e}", workspace.root());
        }
    }
}
