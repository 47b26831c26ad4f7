//! Mobipocket container post-processing.
//!
//! A `.mobi` produced by the Kindle compiler goes through three stages, always in this order
//! and always one file at a time:
//!
//! 1. [`strip::strip_srcs`] removes the archived source block,
//! 2. [`split::split`] turns a combo container into a standalone MOBI7 or MOBI8 file,
//! 3. [`metafix::patch_in_place`] writes the ASIN and content type into the EXTH block.
//!
//! Each stage re-parses what the previous one produced. The first two work on an in-memory
//! [`Pdb`] and the result only reaches the disk through an atomic rename; the patcher then
//! works on the written file through a memory map.

use std::path::Path;

use crate::error::{Error, Result};
use crate::pdb::Pdb;
use crate::types::{CdeType, SplitMode};

pub mod header;
pub mod metafix;
pub mod split;
pub mod strip;

pub use header::{ExthEntry, MobiHeader, Record0};
pub use metafix::{PatchReport, patch_bytes, patch_copy, patch_in_place};
pub use split::{SplitOutcome, split};
pub use strip::{Stripped, strip_srcs};

/// What to do with one Mobipocket file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Remove the SRCS block when there is one.
    pub strip_source: bool,
    /// Split a combo container; `None` keeps both parts.
    pub split_mode: Option<SplitMode>,
    /// ASIN written as EXTH 113; `None` skips the metadata patch.
    pub asin: Option<String>,
    pub cde_type: CdeType,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            strip_source: true,
            split_mode: None,
            asin: None,
            cde_type: CdeType::Ebok,
        }
    }
}

/// Summary of the stages that changed the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Bytes removed by the SRCS strip (0 when there was nothing to strip).
    pub stripped_bytes: usize,
    /// `true` when the input was a combo container and a split was performed.
    pub split: bool,
    pub patch: Option<PatchReport>,
    pub size_before: u64,
    pub size_after: u64,
}

/// Runs strip, split and patch over `path`, replacing the file in place.
///
/// A file without an SRCS block is not an error: the strip is skipped and logged. Any other
/// failure leaves the original file untouched, except for a failed metadata patch, which is
/// reported after the stripped/split container has already been written.
pub fn rewrite_file(path: &Path, options: &RewriteOptions) -> Result<RewriteReport> {
    let original = Pdb::open(path)?;
    let mut report = RewriteReport {
        size_before: original.len() as u64,
        ..Default::default()
    };

    let mut current = original;
    let mut changed = false;

    if options.strip_source {
        match strip::strip_srcs(&current) {
            Ok(stripped) => {
                report.stripped_bytes = stripped.removed_bytes;
                current = stripped.pdb;
                changed = true;
            }
            Err(Error::MissingSourceBlock) => {
                log::warn!("{:?} has no SRCS block, keeping it unstripped", path);
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(mode) = options.split_mode {
        let outcome = split::split(&current, mode)?;
        if outcome.is_combo {
            current = outcome.pdb;
            report.split = true;
            changed = true;
        }
    }

    if changed {
        current.write_atomic(path)?;
    }

    if let Some(asin) = &options.asin {
        report.patch = Some(metafix::patch_in_place(
            path,
            asin.as_bytes(),
            options.cde_type,
        )?);
    }

    report.size_after = std::fs::metadata(path)?.len();
    log::info!(
        "Rewrote {:?}: {} -> {} bytes",
        path,
        report.size_before,
        report.size_after
    );
    Ok(report)
}
