//! Shuppan - comic page pipeline and Mobipocket container rewriter
//!
//! Shuppan turns a tree of comic/manga page images into e-reader packages (CBZ, EPUB or
//! Kindle Mobipocket). A job renders every page through a bounded worker pool, cuts the
//! result into size-bounded volumes, packages each volume and, for Kindle output, rewrites
//! the compiled `.mobi` (source block strip, combo split, ASIN/cdeType patch).
//!
//! # Getting Started
//!
//! ```rust,no_run
//! use shuppan::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> shuppan::error::Result<()> {
//!     let metadata = EbookMetadata {
//!         title: "My Awesome Series".to_string(),
//!         authors: vec!["Jane Doe".to_string()],
//!         ..EbookMetadata::default_with_title("My Awesome Series")
//!     };
//!
//!     let config = ShuppanConfig::builder()
//!         .metadata(metadata)
//!         .source_path(PathBuf::from("./my_manga/volume_01"))
//!         .target_path(PathBuf::from("./converted"))
//!         .output_format(OutputFormat::Mobi)
//!         .mobi_split_mode(SplitMode::Mobi8Standalone)
//!         .build()?;
//!
//!     config.preflight_check(true)?;
//!     let progress = ProgressTracker::new();
//!     let outputs = config.convert(&progress).await?;
//!     println!("Wrote {} file(s)", outputs.len());
//!     Ok(())
//! }
//! ```
//!
//! The Mobipocket tooling is usable on its own:
//!
//! ```rust,no_run
//! use shuppan::mobi::{RewriteOptions, rewrite_file};
//! use shuppan::types::SplitMode;
//!
//! # fn main() -> shuppan::error::Result<()> {
//! let report = rewrite_file(
//!     std::path::Path::new("book.mobi"),
//!     &RewriteOptions {
//!         split_mode: Some(SplitMode::Mobi7Standalone),
//!         asin: Some("B000000000".to_string()),
//!         ..Default::default()
//!     },
//! )?;
//! println!("{} -> {} bytes", report.size_before, report.size_after);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod kindlegen;
pub mod mobi;
pub mod packager;
pub mod path_utils;
pub mod pdb;
pub mod processor;
pub mod progress;
pub mod renderer;
pub mod shuppan;
pub mod types;
pub mod volume;
pub mod workspace;

pub use shuppan::ShuppanConfig;
pub use shuppan::ShuppanConfigBuilder;

pub use types::{
    CdeType, DeviceProfile, Direction, EbookMetadata, ImageFormat, OutputFormat, PageFlags,
    PageRecord, ProcessingOptions, SplitMode, SplitPolicy, TreeShape,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use super::{
        CdeType, DeviceProfile, Direction, EbookMetadata, ImageFormat, OutputFormat, PageFlags,
        PageRecord, ProcessingOptions, ShuppanConfig, ShuppanConfigBuilder, SplitMode,
        SplitPolicy, TreeShape, error, types,
    };
    pub use crate::kindlegen::{KindleGen, MobiCompiler};
    pub use crate::pdb::Pdb;
    pub use crate::processor::PageProcessor;
    pub use crate::progress::{NoProgress, Progress, ProgressEvent, ProgressTracker};
    pub use crate::renderer::{ImageRenderer, PageRenderer};
    pub use crate::volume::{Volume, VolumeSplitOptions, split_volumes};
    pub use crate::workspace::{DirectoryExtractor, Extractor, Workspace};
    pub use std::path::{Path, PathBuf};
    pub use std::sync::Arc;
}
