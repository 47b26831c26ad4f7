//! Removal of the SRCS block (the archived source EPUB some generators append).

use crate::error::{Error, Result};
use crate::mobi::header::{NULL_INDEX, Record0, SRCS_COUNT, SRCS_INDEX, exth};
use crate::pdb::Pdb;

/// Container identity expected at the PDB type/creator slot.
pub const BOOKMOBI: &[u8; 8] = b"BOOKMOBI";
const SRCS_MAGIC: &[u8; 4] = b"SRCS";

/// Result of a successful strip.
#[derive(Debug, Clone)]
pub struct Stripped {
    pub pdb: Pdb,
    pub removed_sections: usize,
    pub removed_bytes: usize,
}

/// Deletes the SRCS sections announced in record 0 and clears the record-0 pointer pair.
///
/// Fails with [`Error::MissingSourceBlock`] when the container has nothing to strip; callers
/// treat that as "keep the file as is".
pub fn strip_srcs(pdb: &Pdb) -> Result<Stripped> {
    if pdb.type_creator() != BOOKMOBI {
        return Err(Error::InvalidContainer("invalid file format".to_string()));
    }

    let mut rec0 = Record0::from_slice(pdb.section(0)?)?;
    let header = rec0.header()?;
    let (first, count) = (header.srcs_index, header.srcs_count);
    if first == NULL_INDEX || count == 0 {
        return Err(Error::MissingSourceBlock);
    }

    let first = first as usize;
    let last = first + count as usize - 1;
    if last >= pdb.section_count() {
        return Err(Error::InvalidContainer(format!(
            "SRCS block {first}..={last} exceeds {} sections",
            pdb.section_count()
        )));
    }
    if !pdb.section(first)?.starts_with(SRCS_MAGIC) {
        return Err(Error::InvalidContainer(
            "SRCS section num does not point to SRCS.".to_string(),
        ));
    }

    let removed_bytes: usize = (first..=last)
        .map(|i| pdb.section(i).map(<[u8]>::len))
        .sum::<Result<usize>>()?;
    log::info!("Found SRCS section number {first}, and count {count} ({removed_bytes} bytes)");

    let stripped = pdb.delete_section_range(first, last)?;

    rec0.set_u32(SRCS_INDEX, NULL_INDEX)?;
    rec0.set_u32(SRCS_COUNT, 0)?;
    if let Some(boundary) = header.kf8_boundary() {
        if boundary as usize >= first {
            let moved = (boundary as usize > last)
                .then(|| boundary.checked_sub(count))
                .flatten()
                .ok_or_else(|| {
                    Error::InvalidContainer(format!(
                        "KF8 boundary {boundary} lies inside the SRCS block {first}..={last}"
                    ))
                })?;
            log::debug!("Moving KF8 boundary from {boundary} to {moved}");
            rec0.write_exth(exth::KF8_BOUNDARY, &moved.to_be_bytes())?;
        }
    }
    let stripped = stripped.replace_section(0, rec0.as_bytes())?;

    let expected = pdb.section_count() - count as usize;
    if stripped.section_count() != expected {
        return Err(Error::PdbInvariant(format!(
            "stripping left {} sections, expected {expected}",
            stripped.section_count()
        )));
    }

    Ok(Stripped {
        pdb: stripped,
        removed_sections: count as usize,
        removed_bytes,
    })
}
