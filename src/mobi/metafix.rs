//! In-place ASIN/cdeType patching of record 0 (and the KF8 record 0 of a combo file).
//!
//! The file is memory-mapped and patched without moving a single section: each EXTH field is
//! deleted (the record is padded back with nulls) and re-added (the same number of trailing
//! nulls is trimmed), so record 0 keeps its exact length. Both records are computed before
//! anything is written, and the mapping is flushed whenever the guard goes out of scope.

use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::mobi::header::{Record0, exth};
use crate::pdb;
use crate::types::CdeType;

/// Which records a patch touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReport {
    /// `true` when the file was still a combo and the KF8 record 0 was patched too.
    pub patched_kf8: bool,
}

/// A writable memory map that is flushed on every exit path.
struct MappedFile {
    map: MmapMut,
    // Keeps the descriptor open for the lifetime of the map.
    _file: File,
}

impl MappedFile {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // The file is private to the conversion job while it is being patched.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self { map, _file: file })
    }

    fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for MappedFile {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush() {
            log::error!("Failed to flush memory-mapped file: {e}");
        }
    }
}

/// Replaces one EXTH field while keeping the record length.
fn replace_field(rec0: &mut Record0, kind: u32, data: &[u8]) -> Result<()> {
    let length = rec0.len();

    let removed = rec0.remove_exth(kind)?;
    rec0.pad_nulls(removed);
    if rec0.len() != length {
        return Err(Error::DualMetaFix(format!(
            "deleting EXTH {kind} changed the record size"
        )));
    }

    rec0.add_exth(kind, data)?;
    rec0.trim_nulls(8 + data.len())?;
    if rec0.len() != length {
        return Err(Error::DualMetaFix(format!(
            "adding EXTH {kind} changed the record size"
        )));
    }
    Ok(())
}

/// Patched copy of a record 0 with EXTH 501 and 113 set.
fn fix_record(data: &[u8], asin: &[u8], cde_type: CdeType) -> Result<Vec<u8>> {
    let mut rec0 = Record0::from_slice(data)?;
    replace_field(&mut rec0, exth::CDE_TYPE, cde_type.as_bytes())?;
    replace_field(&mut rec0, exth::ASIN, asin)?;
    if rec0.len() != data.len() {
        return Err(Error::DualMetaFix(
            "record 0 length changed while patching".to_string(),
        ));
    }
    Ok(rec0.into_bytes())
}

/// Patches a PDB buffer in place. Works on any mutable byte slice, mapped or not.
pub fn patch_bytes(data: &mut [u8], asin: &[u8], cde_type: CdeType) -> Result<PatchReport> {
    pdb::validate(data)?;
    let original = pdb::section(data, 0)?;
    let boundary = Record0::from_slice(original)?.header()?.kf8_boundary();

    let mut patches = vec![(0usize, fix_record(original, asin, cde_type)?)];
    if let Some(boundary) = boundary {
        let index = boundary as usize;
        let kf8 = pdb::section(data, index)?;
        patches.push((index, fix_record(kf8, asin, cde_type)?));
    }

    for (index, bytes) in &patches {
        pdb::overwrite_section_in_place(data, *index, bytes)?;
    }
    Ok(PatchReport {
        patched_kf8: patches.len() > 1,
    })
}

/// Patches the file at `path` through a scoped memory map.
pub fn patch_in_place(path: &Path, asin: &[u8], cde_type: CdeType) -> Result<PatchReport> {
    let mut mapped = MappedFile::open(path)?;
    let report = patch_bytes(&mut mapped, asin, cde_type)?;
    mapped.flush()?;
    log::info!(
        "Patched ASIN/cdeType in {:?} (KF8 part: {})",
        path,
        report.patched_kf8
    );
    Ok(report)
}

/// Copies `source` to `target` and patches the copy.
pub fn patch_copy(
    source: &Path,
    target: &Path,
    asin: &[u8],
    cde_type: CdeType,
) -> Result<PatchReport> {
    std::fs::copy(source, target)?;
    patch_in_place(target, asin, cde_type)
}
