use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;

use crate::error::{Error, Result};
use crate::kindlegen::{KindleGen, MobiCompiler};
use crate::mobi::{RewriteOptions, rewrite_file};
use crate::packager::package_volume;
use crate::path_utils::{sanitize_filename, unique_output_path, validate_path};
use crate::processor::{POLL_INTERVAL, PageProcessor, default_worker_count};
use crate::progress::{Progress, ProgressEvent};
use crate::renderer::PageRenderer;
use crate::types::{
    CdeType, Direction, EbookMetadata, OutputFormat, PageRecord, ProcessingOptions, SplitMode,
    SplitPolicy,
};
use crate::volume::{
    DEFAULT_TARGET_SIZE, Volume, VolumeSplitOptions, WEBTOON_TARGET_SIZE, split_volumes,
};
use crate::workspace::{DirectoryExtractor, Extractor, Workspace};

/// One conversion job, built declaratively with [`ShuppanConfig::builder`].
///
/// The job runs in three stages:
///
/// 1. every page of the workspace is rendered by a bounded worker pool,
/// 2. the rendered tree is cut into size-bounded volumes,
/// 3. every volume is packaged; Kindle output is compiled and then rewritten
///    (SRCS strip, optional split, ASIN/cdeType patch).
///
/// ```rust,no_run
/// # use shuppan::prelude::*;
/// # #[tokio::main]
/// # async fn main() -> shuppan::error::Result<()> {
/// let config = ShuppanConfig::builder()
///     .metadata(EbookMetadata::default_with_title("My Comic"))
///     .source_path(PathBuf::from("./pages"))
///     .target_path(PathBuf::from("./output"))
///     .output_format(OutputFormat::Cbz)
///     .build()?;
///
/// let outputs = config.convert(&ProgressTracker::new()).await?;
/// println!("Wrote {:?}", outputs);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, derive_builder::Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ShuppanConfig {
    /// Title, authors and the other fields embedded in every output.
    #[builder(default = "EbookMetadata::default_with_title(\"Untitled\")")]
    pub metadata: EbookMetadata,

    /// Directory of source images, copied into a workspace by the extractor.
    #[builder(default)]
    pub source_path: PathBuf,

    /// Directory the outputs are written to.
    #[builder(default)]
    pub target_path: PathBuf,

    /// If `true`, outputs go to `target_path/<title>/`.
    #[builder(default = "true")]
    pub create_output_directory: bool,

    #[builder(default)]
    pub output_format: OutputFormat,

    /// Options shared by every page worker, including the device profile.
    #[builder(default)]
    pub processing: ProcessingOptions,

    /// Volume size target in bytes. Defaults to 400 MiB (100 MiB for webtoons).
    #[builder(default)]
    pub volume_target_size: Option<u64>,

    #[builder(default)]
    pub split_policy: SplitPolicy,

    /// Separator between title and volume number in output names.
    #[builder(default = "\" - \".to_string()")]
    pub volume_separator: String,

    /// Page worker count. Defaults to the CPU count, lowered when memory is short.
    #[builder(default)]
    pub worker_count: Option<usize>,

    /// Split combo Kindle files; `None` keeps both parts.
    #[builder(default)]
    pub mobi_split_mode: Option<SplitMode>,

    /// Remove the SRCS block from Kindle files.
    #[builder(default = "true")]
    pub strip_source: bool,

    /// ASIN written into Kindle files. Generated from the title when absent.
    #[builder(default)]
    pub asin: Option<String>,

    /// Where workspaces and temporary volumes are created. Defaults to the system temp dir.
    #[builder(default)]
    pub temp_dir: Option<PathBuf>,

    #[builder(default)]
    #[cfg_attr(feature = "serde", serde(skip))]
    #[cfg_attr(feature = "specta", specta(skip))]
    pub extractor: Option<Arc<dyn Extractor>>,

    #[builder(default)]
    #[cfg_attr(feature = "serde", serde(skip))]
    #[cfg_attr(feature = "specta", specta(skip))]
    pub renderer: Option<Arc<dyn PageRenderer>>,

    /// Kindle compiler. Defaults to `kindlegen` on the `PATH`.
    #[builder(default)]
    #[cfg_attr(feature = "serde", serde(skip))]
    #[cfg_attr(feature = "specta", specta(skip))]
    pub compiler: Option<Arc<dyn MobiCompiler>>,
}

impl std::fmt::Debug for ShuppanConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |present: bool| if present { "Some(..)" } else { "None" };
        f.debug_struct("ShuppanConfig")
            .field("metadata", &self.metadata)
            .field("source_path", &self.source_path)
            .field("target_path", &self.target_path)
            .field("create_output_directory", &self.create_output_directory)
            .field("output_format", &self.output_format)
            .field("processing", &self.processing)
            .field("volume_target_size", &self.volume_target_size)
            .field("split_policy", &self.split_policy)
            .field("volume_separator", &self.volume_separator)
            .field("worker_count", &self.worker_count)
            .field("mobi_split_mode", &self.mobi_split_mode)
            .field("strip_source", &self.strip_source)
            .field("asin", &self.asin)
            .field("temp_dir", &self.temp_dir)
            .field("extractor", &set(self.extractor.is_some()))
            .field("renderer", &set(self.renderer.is_some()))
            .field("compiler", &set(self.compiler.is_some()))
            .finish()
    }
}

/// ASIN derived from the title and the current time.
pub fn generate_asin(title: &str) -> String {
    let mut hasher = DefaultHasher::new();
    title.hash(&mut hasher);
    chrono::Utc::now().timestamp_micros().hash(&mut hasher);
    format!("{:016X}", hasher.finish())
}

/// What one finished volume needs to become an output file.
struct VolumeJob {
    volume: Volume,
    output: PathBuf,
    /// Intermediate EPUB handed to the Kindle compiler.
    kindle_epub: Option<PathBuf>,
    number: Option<usize>,
}

impl ShuppanConfig {
    pub fn builder() -> ShuppanConfigBuilder {
        ShuppanConfigBuilder::default()
    }

    /// Checks paths before any work starts.
    ///
    /// `check_source` additionally requires `source_path` to be an existing directory.
    pub fn preflight_check(&self, check_source: bool) -> Result<&Self> {
        if self.metadata.title.trim().is_empty() {
            return Err(Error::Other("Ebook title is required".to_string()));
        }
        if self.target_path.as_os_str().is_empty() {
            return Err(Error::Other("Target path is required".to_string()));
        }
        validate_path(&self.target_path)?;
        if !self.create_output_directory && !self.target_path.is_dir() {
            return Err(Error::NotFound(format!(
                "Target directory does not exist: {:?}",
                self.target_path
            )));
        }

        if check_source {
            if self.source_path.as_os_str().is_empty() {
                return Err(Error::Other("`source_path` must be set".to_string()));
            }
            validate_path(&self.source_path)?;
            if !self.source_path.exists() {
                return Err(Error::NotFound(format!(
                    "Source path does not exist: {:?}",
                    self.source_path
                )));
            }
            if !self.source_path.is_dir() {
                return Err(Error::InvalidPath(
                    self.source_path.clone(),
                    "Source path is not a directory.".to_string(),
                ));
            }
        }
        Ok(self)
    }

    /// Effective volume size target.
    pub fn target_size(&self) -> u64 {
        self.volume_target_size.unwrap_or(if self.processing.webtoon {
            WEBTOON_TARGET_SIZE
        } else {
            DEFAULT_TARGET_SIZE
        })
    }

    pub fn cde_type(&self) -> CdeType {
        self.processing.profile.cde_type()
    }

    /// Extracts `source_path` into a fresh workspace and converts it.
    pub async fn convert(&self, progress: &dyn Progress) -> Result<Vec<PathBuf>> {
        self.preflight_check(true)?;
        let parent = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let workspace = match &self.extractor {
            Some(extractor) => extractor.extract(&self.source_path, &parent).await?,
            None => DirectoryExtractor.extract(&self.source_path, &parent).await?,
        };
        self.convert_workspace(workspace, progress).await
    }

    /// Converts an existing workspace. The workspace is consumed: it is deleted when the job
    /// ends, whether it succeeds or not.
    pub async fn convert_workspace(
        &self,
        workspace: Workspace,
        progress: &dyn Progress,
    ) -> Result<Vec<PathBuf>> {
        let result = self.run(&workspace, progress).await;
        if let Err(e) = workspace.remove() {
            log::error!("Failed to remove workspace {:?}: {e}", workspace.root());
        }
        result
    }

    /// Renders the workspace pages in place.
    pub async fn process_pages(
        &self,
        workspace: &Workspace,
        progress: &dyn Progress,
    ) -> Result<Vec<PageRecord>> {
        let mut processor = PageProcessor::new(self.processing.clone())
            .with_workers(self.worker_count.unwrap_or_else(default_worker_count));
        if let Some(renderer) = &self.renderer {
            processor = processor.with_renderer(Arc::clone(renderer));
        }
        processor.process(workspace, progress).await
    }

    async fn run(&self, workspace: &Workspace, progress: &dyn Progress) -> Result<Vec<PathBuf>> {
        self.process_pages(workspace, progress).await?;
        if progress.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let volumes = split_volumes(
            workspace,
            &VolumeSplitOptions {
                target_size: self.target_size(),
                policy: self.split_policy,
            },
        )?;

        let output_dir = self.output_directory().await?;
        let jobs = self.plan_outputs(volumes, &output_dir);
        self.package_all(jobs, progress).await
    }

    async fn output_directory(&self) -> Result<PathBuf> {
        if self.create_output_directory {
            let path = self
                .target_path
                .join(sanitize_filename(&self.metadata.title));
            fs::create_dir_all(&path).await?;
            Ok(path)
        } else if self.target_path.is_dir() {
            Ok(self.target_path.clone())
        } else {
            Err(Error::NotFound(
                "Target directory does not exist".to_string(),
            ))
        }
    }

    fn plan_outputs(&self, volumes: Vec<Volume>, output_dir: &Path) -> Vec<VolumeJob> {
        let total = volumes.len();
        let extension = self.output_format.extension();
        let mut taken: Vec<PathBuf> = Vec::new();

        volumes
            .into_iter()
            .map(|volume| {
                let base = if total > 1 {
                    format!(
                        "{}{}Volume {}",
                        self.metadata.title,
                        self.volume_separator,
                        volume.number()
                    )
                } else {
                    self.metadata.title.clone()
                };
                let mut output = unique_output_path(output_dir, &base, extension);
                let mut counter = 0;
                while taken.contains(&output) {
                    counter += 1;
                    let name = format!("{base}_{counter}");
                    output = unique_output_path(output_dir, &name, extension);
                }
                taken.push(output.clone());
                let kindle_epub = (self.output_format == OutputFormat::Mobi).then(|| {
                    let stem = format!("{}.kindle", file_stem(&output));
                    unique_output_path(output_dir, &stem, "epub")
                });
                VolumeJob {
                    number: (total > 1).then(|| volume.number()),
                    volume,
                    output,
                    kindle_epub,
                }
            })
            .collect()
    }

    async fn package_all(
        &self,
        jobs: Vec<VolumeJob>,
        progress: &dyn Progress,
    ) -> Result<Vec<PathBuf>> {
        let semaphore = Arc::new(Semaphore::new(num_cpus::get().min(4)));
        let compiler: Arc<dyn MobiCompiler> = match &self.compiler {
            Some(compiler) => Arc::clone(compiler),
            None => Arc::new(KindleGen::default()),
        };
        let ctx = Arc::new(PackageContext {
            compiler,
            rewrite: RewriteOptions {
                strip_source: self.strip_source,
                split_mode: self.mobi_split_mode,
                asin: Some(
                    self.asin
                        .clone()
                        .unwrap_or_else(|| generate_asin(&self.metadata.title)),
                ),
                cde_type: self.cde_type(),
            },
            metadata: self.metadata.clone(),
            format: self.output_format,
            direction: self.processing.direction,
            abort: AtomicBool::new(false),
        });

        progress.tick(ProgressEvent::Started { total: jobs.len() });
        let mut tasks = Vec::new();
        for job in jobs {
            if progress.is_cancelled() {
                ctx.abort.store(true, Ordering::SeqCst);
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await?;
                if ctx.abort.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
                match ctx.package(&job).await {
                    Ok(()) => Ok(job.output),
                    Err(e) => {
                        log::error!("Packaging {:?} failed: {e}", job.output);
                        for path in PackageContext::scratch_paths(&job) {
                            remove_if_present(&path).await;
                        }
                        Err(e)
                    }
                }
            }));
        }

        let mut joined = pin!(join_all(tasks));
        let results = loop {
            match tokio::time::timeout(POLL_INTERVAL, joined.as_mut()).await {
                Ok(results) => break results,
                Err(_) if progress.is_cancelled() => ctx.abort.store(true, Ordering::SeqCst),
                Err(_) => {}
            }
        };

        let mut outputs = Vec::new();
        let mut failure: Option<Error> = None;
        for result in results {
            match result {
                Ok(Ok(path)) => {
                    progress.tick(ProgressEvent::Tick);
                    outputs.push(path);
                }
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(e.into());
                }
            }
        }
        if progress.is_cancelled() || ctx.abort.load(Ordering::SeqCst) {
            failure = Some(Error::Cancelled);
        }

        if let Some(error) = failure {
            for path in &outputs {
                remove_if_present(path).await;
            }
            return Err(error);
        }
        Ok(outputs)
    }
}

/// Everything a packaging task needs besides its volume.
struct PackageContext {
    compiler: Arc<dyn MobiCompiler>,
    rewrite: RewriteOptions,
    metadata: EbookMetadata,
    format: OutputFormat,
    direction: Direction,
    abort: AtomicBool,
}

impl PackageContext {
    async fn package(&self, job: &VolumeJob) -> Result<()> {
        let images = job.volume.images_dir();
        let Some(epub) = &job.kindle_epub else {
            return package_volume(
                self.format,
                &images,
                &job.output,
                &self.metadata,
                job.number,
                self.direction,
            )
            .await
            .map(|_| ());
        };

        package_volume(
            self.format,
            &images,
            epub,
            &self.metadata,
            job.number,
            self.direction,
        )
        .await?;
        if self.abort.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let compiled = self.compiler.compile(epub).await;
        fs::remove_file(epub).await?;
        let mobi = compiled?;
        let finished = self.finish_mobi(&mobi, &job.output).await;
        if finished.is_err() {
            remove_if_present(&mobi).await;
        }
        finished
    }

    /// Rewrites the compiled file where it lies; it takes the output name only afterwards.
    async fn finish_mobi(&self, mobi: &Path, output: &Path) -> Result<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let staged = mobi.to_path_buf();
        let rewrite = self.rewrite.clone();
        spawn_blocking(move || rewrite_file(&staged, &rewrite)).await??;
        if mobi != output {
            fs::rename(mobi, output).await?;
        }
        Ok(())
    }

    /// Files a failed task may have left behind.
    fn scratch_paths(job: &VolumeJob) -> Vec<PathBuf> {
        let mut paths = vec![job.output.clone()];
        if let Some(epub) = &job.kindle_epub {
            paths.push(epub.with_extension("mobi"));
            paths.push(epub.clone());
        }
        paths
    }
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove partial output {:?}: {e}", path),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string())
}

impl ShuppanConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(processing) = &self.processing {
            if !(1..=100).contains(&processing.jpeg_quality) {
                return Err("JPEG quality must be between 1 and 100.".to_string());
            }
        }
        if let Some(Some(0)) = self.volume_target_size {
            return Err("Volume target size must be positive.".to_string());
        }
        if let Some(Some(0)) = self.worker_count {
            return Err("Worker count must be positive.".to_string());
        }
        if let Some(Some(asin)) = &self.asin {
            if asin.trim().is_empty() {
                return Err("ASIN must not be empty.".to_string());
            }
        }
        Ok(())
    }
}
