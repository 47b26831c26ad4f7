use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::packager::cbz::escape_xml;
use crate::packager::{Packager, VolumeInfo};
use crate::path_utils::prepare_output_file;
use crate::types::image_info;
use async_trait::async_trait;
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ZipLibrary};
use memmap2::MmapOptions;
use tokio::task::spawn_blocking;

/// XHTML wrapper of one page image.
fn page_xhtml(image_source: &str, page_title: &str, width: u32, height: u32) -> String {
    const TEMPLATE: &str = include_str!("../../templates/Epub.xhtml");
    TEMPLATE
        .replace("%title%", &escape_xml(page_title))
        .replace("%src%", image_source)
        .replace("%width%", &width.to_string())
        .replace("%height%", &height.to_string())
}

/// Writes one XHTML page per image into an EPUB 3 container.
pub struct EpubPackager {
    epub: EpubBuilder<ZipLibrary>,
    output_file: PathBuf,
    page_index: usize,
}

impl EpubPackager {
    /// Sets the cover image (stored as `images/cover.<ext>`).
    pub fn set_cover(&mut self, cover_image_path: &Path) -> Result<&mut Self> {
        let (extension, mime) = image_info(cover_image_path)?;
        let cover_file = File::open(cover_image_path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to open cover image '{}': {}",
                    cover_image_path.display(),
                    e
                ),
            ))
        })?;

        self.epub
            .add_cover_image(format!("images/cover.{extension}"), cover_file, mime)?;
        Ok(self)
    }

    /// Adds an image resource through a read-only memory map.
    async fn add_resource_mmap(&mut self, resource_path: &str, image_path: &Path) -> Result<()> {
        let (_, mime) = image_info(image_path)?;
        let file = tokio::fs::File::open(image_path).await?;
        let file_std = file.into_std().await;
        let mmap = spawn_blocking(move || unsafe { MmapOptions::new().map(&file_std) }).await??;

        self.epub
            .add_resource(resource_path, Cursor::new(&mmap[..]), mime)?;
        Ok(())
    }
}

#[async_trait]
impl Packager for EpubPackager {
    fn new(output_file: &Path) -> Result<Self> {
        let mut epub = EpubBuilder::new(ZipLibrary::new()?)?;
        epub.epub_version(EpubVersion::V30);
        epub.stylesheet(include_bytes!("../../templates/Epub.css").as_slice())?;

        let output_file = prepare_output_file(output_file)?;

        Ok(EpubPackager {
            epub,
            output_file,
            page_index: 0,
        })
    }

    async fn add_page(&mut self, image_path: &Path, chapter: Option<&str>) -> Result<&mut Self> {
        let (extension, _) = image_info(image_path)?;
        let path = image_path.to_path_buf();
        let (width, height) = spawn_blocking(move || image::image_dimensions(path)).await??;

        self.page_index += 1;
        let image_name = format!("images/page_{:04}.{}", self.page_index, extension);
        let page_title = chapter
            .map(str::to_string)
            .unwrap_or_else(|| format!("Page {}", self.page_index));
        let xhtml = page_xhtml(&image_name, &page_title, width, height);

        self.add_resource_mmap(&image_name, image_path).await?;

        let mut content = EpubContent::new(
            format!("page_{:04}.xhtml", self.page_index),
            xhtml.as_bytes(),
        );
        if self.page_index == 1 || chapter.is_some() {
            content = content.title(page_title);
        }
        self.epub.add_content(content)?;

        Ok(self)
    }

    async fn set_metadata(&mut self, info: &VolumeInfo<'_>) -> Result<&mut Self> {
        let metadata = info.metadata;
        let mut title = metadata.title.clone();
        if let Some(volume) = info.volume {
            title = format!("{title} Vol {volume}");
        }
        self.epub.metadata("title", &title)?;
        for author in &metadata.authors {
            self.epub.metadata("author", author)?;
        }
        if let Some(description) = &metadata.description {
            self.epub.metadata("description", description)?;
        }
        self.epub.set_lang(&metadata.language);
        self.epub.metadata("direction", info.direction.to_string())?;

        Ok(self)
    }

    async fn save(mut self) -> Result<PathBuf> {
        let file = File::create(&self.output_file).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create EPUB file '{}': {}",
                    self.output_file.display(),
                    e
                ),
            ))
        })?;

        self.epub.generate(file)?;
        Ok(self.output_file)
    }
}
