//! Packaging of one volume into a CBZ or EPUB container.
//!
//! Both containers follow the same protocol: create, add pages in order, set metadata, save.
//! [`package_volume`] drives it for a whole volume.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::path_utils::get_file_name_lossy;
use crate::types::{Direction, EbookMetadata, OutputFormat};
use crate::workspace::list_files_recursive;

pub mod cbz;
pub mod epub;

pub use cbz::CbzPackager;
pub use epub::EpubPackager;

/// Volume-level information handed to [`Packager::set_metadata`].
#[derive(Debug, Clone)]
pub struct VolumeInfo<'a> {
    pub metadata: &'a EbookMetadata,
    /// 1-based volume number, `None` for a single-volume book.
    pub volume: Option<usize>,
    pub total_pages: usize,
    pub direction: Direction,
}

/// Common interface of the container writers.
#[async_trait]
pub trait Packager {
    /// Creates a packager writing to `output_file`.
    fn new(output_file: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Appends a page. `chapter` starts a new table-of-contents entry.
    async fn add_page(&mut self, image_path: &Path, chapter: Option<&str>) -> Result<&mut Self>
    where
        Self: Sized;

    async fn set_metadata(&mut self, info: &VolumeInfo<'_>) -> Result<&mut Self>
    where
        Self: Sized;

    /// Finalizes the container and returns its path.
    async fn save(self) -> Result<PathBuf>;
}

/// Chapter label of a page: its parent directory name when that differs from the
/// previous page's.
fn chapter_label(images_dir: &Path, page: &Path, previous: Option<&Path>) -> Option<String> {
    let parent = page.parent()?;
    if parent == images_dir || previous.and_then(Path::parent) == Some(parent) {
        return None;
    }
    Some(get_file_name_lossy(parent))
}

async fn fill<P: Packager + Send>(
    mut packager: P,
    images_dir: &Path,
    pages: &[PathBuf],
    info: &VolumeInfo<'_>,
) -> Result<PathBuf> {
    let mut previous: Option<&Path> = None;
    for page in pages {
        let chapter = chapter_label(images_dir, page, previous);
        packager.add_page(page, chapter.as_deref()).await?;
        previous = Some(page.as_path());
    }
    packager.set_metadata(info).await?;
    packager.save().await
}

/// Packages every page below `images_dir` into `output_file`.
///
/// `OutputFormat::Mobi` produces the EPUB that the Kindle compiler consumes.
pub async fn package_volume(
    format: OutputFormat,
    images_dir: &Path,
    output_file: &Path,
    metadata: &EbookMetadata,
    volume: Option<usize>,
    direction: Direction,
) -> Result<PathBuf> {
    let pages = list_files_recursive(images_dir)?;
    if pages.is_empty() {
        return Err(Error::EmptySource(images_dir.to_path_buf()));
    }
    let info = VolumeInfo {
        metadata,
        volume,
        total_pages: pages.len(),
        direction,
    };
    log::info!(
        "Packaging {} pages from {:?} into {:?}",
        pages.len(),
        images_dir,
        output_file
    );

    match format {
        OutputFormat::Cbz => fill(CbzPackager::new(output_file)?, images_dir, &pages, &info).await,
        OutputFormat::Epub | OutputFormat::Mobi => {
            let mut epub = EpubPackager::new(output_file)?;
            epub.set_cover(&pages[0])?;
            fill(epub, images_dir, &pages, &info).await
        }
    }
}
