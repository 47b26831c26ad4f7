//! Splitting of combo containers (a MOBI6 part followed by an embedded KF8 part) into a
//! standalone MOBI7 or MOBI8 file.
//!
//! The MOBI6 part owns the shared image/font/resource sections; the KF8 part refers to them
//! through its own `first_image_record`. Splitting therefore either drops the KF8 part and
//! empties the fonts/resources only it needs, or drops the MOBI6 part and copies the shared
//! sections into the KF8 part.
//!
//! FONT/RESC sections of the MOBI7 result are nulled rather than deleted: image maps and the
//! FCIS/FLIS/DATP tables address sections by number, and deleting would renumber them.

use crate::error::{Error, Result};
use crate::mobi::header::{
    DATP_INDEX, FCIS_INDEX, FLAG_EMBEDDED_FONTS, FLAG_SHARED_RESOURCES, FLIS_INDEX,
    HEADER_FLAGS, HUFFTBL_OFFSET, KF8_FDST_INDEX, MobiHeader, NULL_INDEX, NULL_INDEX_U16,
    Record0, SRCS_COUNT, SRCS_INDEX, exth,
};
use crate::pdb::Pdb;
use crate::types::SplitMode;

/// Content type marker every standalone output gets.
pub const EBOK: &[u8; 4] = b"EBOK";

/// Index fields that point past the shared image range in a KF8 header.
const KF8_INDEX_FIELDS: [usize; 5] = [
    KF8_FDST_INDEX,
    FCIS_INDEX,
    FLIS_INDEX,
    DATP_INDEX,
    HUFFTBL_OFFSET,
];

/// Output of [`split`]. `is_combo == false` means the input was returned unchanged.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub pdb: Pdb,
    pub is_combo: bool,
}

/// Inclusive range of shared image/resource sections announced by a MOBI6 record 0.
///
/// When `last_content_index` is unset, the range ends just before the lowest of the
/// FCIS/FLIS/DATP/HUFF-table records that follow it.
pub fn image_range(header: &MobiHeader) -> Option<(usize, usize)> {
    let first = header.first_image_record;
    if first == NULL_INDEX {
        return None;
    }
    let mut last = header.last_content_index as u32;
    if header.last_content_index == NULL_INDEX_U16 {
        for n in [
            header.fcis_index,
            header.flis_index,
            header.datp_index,
            header.hufftbl_offset,
        ] {
            if n > 0 && n < last {
                last = n - 1;
            }
        }
    }
    (last >= first).then_some((first as usize, last as usize))
}

/// Splits a combo container. Non-combo input is returned as is.
pub fn split(pdb: &Pdb, mode: SplitMode) -> Result<SplitOutcome> {
    let rec0 = Record0::from_slice(pdb.section(0)?)?;
    let header = rec0.header()?;
    let Some(boundary) = header.kf8_boundary() else {
        log::debug!("No KF8 boundary in record 0, nothing to split");
        return Ok(SplitOutcome {
            pdb: pdb.clone(),
            is_combo: false,
        });
    };

    let boundary = boundary as usize;
    if boundary < 2 || boundary >= pdb.section_count() {
        return Err(Error::InvalidContainer(format!(
            "KF8 boundary {boundary} outside of {} sections",
            pdb.section_count()
        )));
    }

    let result = match mode {
        SplitMode::Mobi7Standalone => mobi7_standalone(pdb, rec0, &header, boundary)?,
        SplitMode::Mobi8Standalone => mobi8_standalone(pdb, &header, boundary)?,
    };
    Ok(SplitOutcome {
        pdb: result,
        is_combo: true,
    })
}

fn mobi7_standalone(
    pdb: &Pdb,
    mut rec0: Record0,
    header: &MobiHeader,
    boundary: usize,
) -> Result<Pdb> {
    // Drop the boundary record and the KF8 part, keep the trailing EOF record.
    let count = pdb.section_count();
    let mut out = pdb.delete_section_range(boundary - 1, count - 2)?;
    log::info!(
        "MOBI7: dropped sections {}..={} of {count}",
        boundary - 1,
        count - 2
    );

    if header.srcs_index != NULL_INDEX && header.srcs_count > 0 {
        let first = header.srcs_index as usize;
        let last = first + header.srcs_count as usize - 1;
        if last + 1 < out.section_count() {
            out = out.delete_section_range(first, last)?;
        }
        rec0.set_u32(SRCS_INDEX, NULL_INDEX)?;
        rec0.set_u32(SRCS_COUNT, 0)?;
    }

    rec0.write_exth(exth::KF8_BOUNDARY, &NULL_INDEX.to_be_bytes())?;
    rec0.write_exth(exth::KF8_MASTHEAD, b"")?;
    let flags =
        rec0.u32_at(HEADER_FLAGS)? & 0x1FFF & !(FLAG_SHARED_RESOURCES | FLAG_EMBEDDED_FONTS);
    rec0.set_u32(HEADER_FLAGS, flags)?;
    rec0.ensure_exth(exth::CDE_TYPE, EBOK)?;

    let mut out = out.replace_section(0, rec0.as_bytes())?;

    if let Some((first, last)) = image_range(header) {
        // The trailing EOF record is never part of the image range.
        let last = last.min(out.section_count().saturating_sub(2));
        for index in first..=last {
            let section = out.section(index)?;
            if section.starts_with(b"FONT") || section.starts_with(b"RESC") {
                log::debug!("MOBI7: nulling section {index}");
                out = out.null_section(index)?;
            }
        }
    }

    Ok(out)
}

fn mobi8_standalone(pdb: &Pdb, header: &MobiHeader, boundary: usize) -> Result<Pdb> {
    let kf8_rec0 = Record0::from_slice(pdb.section(boundary)?)?;
    let target = kf8_rec0.header()?.first_image_record;
    if target == NULL_INDEX {
        return Err(Error::InvalidContainer(
            "KF8 record 0 has no first image record".to_string(),
        ));
    }

    let mut out = pdb.delete_section_range(0, boundary - 1)?;
    log::info!("MOBI8: dropped sections 0..={}", boundary - 1);

    let images = image_range(header);
    let delta = match images {
        Some((first, last)) => {
            if last >= boundary {
                return Err(Error::InvalidContainer(format!(
                    "shared image range {first}..={last} crosses the KF8 boundary {boundary}"
                )));
            }
            if target as usize > out.section_count() {
                return Err(Error::InvalidContainer(format!(
                    "KF8 image target {target} beyond {} sections",
                    out.section_count()
                )));
            }
            out = out.insert_section_range(pdb, first, last, target as usize)?;
            log::info!("MOBI8: copied shared sections {first}..={last} to {target}");
            (last - first + 1) as u32
        }
        None => 0,
    };

    let mut rec0 = Record0::from_slice(out.section(0)?)?;
    rec0.keep_last_exth(exth::START_OFFSET)?;
    rec0.write_exth(exth::KF8_RESOURCE_COUNT, &delta.to_be_bytes())?;

    let flags = (rec0.u32_at(HEADER_FLAGS)? & 0x1FFF) | FLAG_SHARED_RESOURCES;
    rec0.set_u32(HEADER_FLAGS, flags)?;

    for offset in KF8_INDEX_FIELDS {
        let value = rec0.u32_at(offset)?;
        if value != NULL_INDEX {
            let moved = value.checked_add(delta).ok_or_else(|| {
                Error::InvalidContainer(format!("index at {offset} overflows"))
            })?;
            rec0.set_u32(offset, moved)?;
        }
    }
    rec0.ensure_exth(exth::CDE_TYPE, EBOK)?;

    out.replace_section(0, rec0.as_bytes())
}
