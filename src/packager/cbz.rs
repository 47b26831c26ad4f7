use crate::error::{Error, Result};
use crate::packager::{Packager, VolumeInfo};
use crate::path_utils::prepare_output_file;
use crate::types::{Direction, image_info};
use async_trait::async_trait;
use chrono::prelude::*;
use memmap2::MmapOptions;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::task::spawn_blocking;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Escapes the five XML special characters.
pub(crate) fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Writes pages into a Comic Book ZIP with a `ComicInfo.xml` entry.
pub struct CbzPackager {
    zip: Option<ZipWriter<File>>,
    options: SimpleFileOptions,
    output_file: PathBuf,
    page_index: usize,
}

impl CbzPackager {
    fn writer(&mut self) -> Result<&mut ZipWriter<File>> {
        self.zip
            .as_mut()
            .ok_or_else(|| Error::Unsupported("Zip writer not available".to_string()))
    }
}

#[async_trait]
impl Packager for CbzPackager {
    fn new(output_file: &Path) -> Result<Self> {
        // Pages are already compressed images.
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o644);

        let output_file = prepare_output_file(output_file)?;
        let file = File::create(&output_file)?;

        Ok(CbzPackager {
            zip: Some(ZipWriter::new(file)),
            options,
            output_file,
            page_index: 0,
        })
    }

    async fn add_page(&mut self, image_path: &Path, _chapter: Option<&str>) -> Result<&mut Self> {
        let (extension, _) = image_info(image_path)?;

        let file = fs::File::open(image_path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to open image file '{}': {}",
                    image_path.display(),
                    e
                ),
            ))
        })?;
        let file_std = file.into_std().await;
        let mmap = spawn_blocking(move || unsafe { MmapOptions::new().map(&file_std) }).await??;

        self.page_index += 1;
        let entry = format!("{:04}.{}", self.page_index, extension);
        let options = self.options;
        let zip = self.writer()?;
        zip.start_file(entry, options)?;
        zip.write_all(&mmap[..])?;

        Ok(self)
    }

    async fn set_metadata(&mut self, info: &VolumeInfo<'_>) -> Result<&mut Self> {
        const TEMPLATE: &str = include_str!("../../templates/ComicInfo.xml");
        let metadata = info.metadata;

        let release_date = metadata.release_date.unwrap_or_else(Utc::now);
        let manga = match info.direction {
            Direction::Rtl => "YesAndRightToLeft",
            Direction::Ltr => "No",
        };

        let xml = TEMPLATE
            .replace("%title%", &escape_xml(&metadata.title))
            .replace(
                "%series%",
                &escape_xml(metadata.series.as_deref().unwrap_or(&metadata.title)),
            )
            .replace("%volume%", &info.volume.unwrap_or(1).to_string())
            .replace("%pagecount%", &info.total_pages.to_string())
            .replace(
                "%summary%",
                &escape_xml(metadata.description.as_deref().unwrap_or("")),
            )
            .replace("%writer%", &escape_xml(&metadata.authors.join(", ")))
            .replace(
                "%publisher%",
                &escape_xml(metadata.publisher.as_deref().unwrap_or("")),
            )
            .replace("%language%", &escape_xml(&metadata.language))
            .replace("%year%", &release_date.year().to_string())
            .replace("%month%", &release_date.month().to_string())
            .replace("%day%", &release_date.day().to_string())
            .replace("%manga%", manga);

        let options = self.options;
        let zip = self.writer()?;
        zip.start_file("ComicInfo.xml", options)?;
        zip.write_all(xml.as_bytes())?;

        Ok(self)
    }

    async fn save(mut self) -> Result<PathBuf> {
        let zip = self
            .zip
            .take()
            .ok_or_else(|| Error::Unsupported("Zip writer not available".to_string()))?;

        spawn_blocking(move || zip.finish().map(|_| ()).map_err(Error::Zip)).await??;
        Ok(self.output_file)
    }
}
