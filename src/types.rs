//! Core data types and options shared by the Shuppan pipeline stages.
//!
//! - Output and layout enumerations (`OutputFormat`, `Direction`, `SplitPolicy`, `TreeShape`)
//! - Mobipocket rewrite settings (`SplitMode`, `CdeType`)
//! - Page processing options and results (`ProcessingOptions`, `DeviceProfile`, `PageRecord`)
//! - Book metadata used by the packagers (`EbookMetadata`)

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Container produced for every volume.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum OutputFormat {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "CBZ"))]
    Cbz,
    #[cfg_attr(feature = "serde", serde(rename = "EPUB"))]
    Epub,
    /// EPUB compiled by the Kindle compiler, then rewritten.
    #[cfg_attr(feature = "serde", serde(rename = "MOBI"))]
    Mobi,
}

impl OutputFormat {
    /// File extension of the final output.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Cbz => "cbz",
            OutputFormat::Epub => "epub",
            OutputFormat::Mobi => "mobi",
        }
    }
}

/// Reading direction, used for spread ordering and EPUB page progression.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum Direction {
    #[default]
    Ltr,
    Rtl,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ltr => f.write_str("ltr"),
            Direction::Rtl => f.write_str("rtl"),
        }
    }
}

/// Which half of a combo Mobipocket container survives a split.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum SplitMode {
    /// Keep the legacy MOBI6 part.
    Mobi7Standalone,
    /// Keep the KF8 part.
    Mobi8Standalone,
}

/// Content type written as EXTH 501.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum CdeType {
    /// Listed as a book on the device.
    #[default]
    Ebok,
    /// Listed as a personal document.
    Pdoc,
}

impl CdeType {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            CdeType::Ebok => b"EBOK",
            CdeType::Pdoc => b"PDOC",
        }
    }
}

/// How the processed tree is cut into volumes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum SplitPolicy {
    /// Pack siblings into volumes up to the target size.
    #[default]
    SizeBounded,
    /// One volume per top-level directory.
    PerDirectory,
}

/// Layout of the `OEBPS/Images` tree.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TreeShape {
    /// Only files.
    Flat,
    /// Directories containing files.
    OneLevel,
    /// Directories containing directories containing files.
    TwoLevel,
}

/// Encoding of rendered pages.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// Target reader.
#[derive(Debug, PartialEq, Eq, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct DeviceProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Sideloaded books are tagged `PDOC` instead of `EBOK`.
    pub is_personal_document: bool,
}

impl DeviceProfile {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            is_personal_document: false,
        }
    }

    /// A 1072x1448 Kindle Paperwhite class screen.
    pub fn kindle_paperwhite() -> Self {
        Self::new("Kindle Paperwhite", 1072, 1448)
    }

    /// A 1264x1680 Kindle Oasis/Paperwhite 5 class screen.
    pub fn kindle_oasis() -> Self {
        Self::new("Kindle Oasis", 1264, 1680)
    }

    /// Content type matching this profile.
    pub fn cde_type(&self) -> CdeType {
        if self.is_personal_document {
            CdeType::Pdoc
        } else {
            CdeType::Ebok
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::kindle_paperwhite()
    }
}

/// Read-only options shared by every page worker.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct ProcessingOptions {
    pub profile: DeviceProfile,
    /// Cut landscape spreads into two pages.
    pub split_spreads: bool,
    /// Rotate landscape spreads instead of cutting them.
    pub rotate_spreads: bool,
    pub grayscale: bool,
    pub image_format: ImageFormat,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    pub direction: Direction,
    /// Long-strip content: no spread handling, smaller volumes.
    pub webtoon: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            profile: DeviceProfile::default(),
            split_spreads: true,
            rotate_spreads: false,
            grayscale: true,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 85,
            direction: Direction::Ltr,
            webtoon: false,
        }
    }
}

/// Per-page markers the packagers may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageFlags {
    pub rotated: bool,
    pub black_background: bool,
}

/// One rendered output page.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageRecord {
    pub filename: PathBuf,
    pub flags: PageFlags,
}

/// Metadata embedded into the packaged files.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EbookMetadata {
    pub title: String,
    pub series: Option<String>,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub language: String,
    pub release_date: Option<DateTime<Utc>>,
}

impl EbookMetadata {
    /// Metadata with only a title and language "en".
    pub fn default_with_title(title: &str) -> Self {
        Self {
            title: title.to_string(),
            language: "en".to_string(),
            ..Default::default()
        }
    }
}

/// Returns `(extension, mime type)` for a supported page image.
pub fn image_info(image_path: &Path) -> Result<(&'static str, &'static str)> {
    let extension = image_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => Ok(("jpg", "image/jpeg")),
        Some("png") => Ok(("png", "image/png")),
        Some("gif") => Ok(("gif", "image/gif")),
        Some("webp") => Ok(("webp", "image/webp")),
        _ => Err(Error::Unsupported(format!(
            "Image format {:?}",
            image_path.extension()
        ))),
    }
}

/// `true` when [`image_info`] accepts the path.
pub fn is_image_file(path: &Path) -> bool {
    image_info(path).is_ok()
}
