//! Palm Database (PDB) section-table engine.
//!
//! A Mobipocket file is a PDB container: a 78-byte header, a table with one 8-byte slot per
//! section (`u32` offset, `u32` attributes/unique id) and then the section payloads, laid out
//! back to back. This module reads sections and performs the structural edits the Mobipocket
//! rewriter needs. Every edit produces a new buffer and re-validates it, so a table that would
//! come out inconsistent is reported as [`Error::PdbInvariant`] and never written anywhere.

use std::io::Write;
use std::ops::Range;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Offset of the "next unique id" seed in the PDB header.
pub const UNIQUE_ID_SEED: usize = 68;
/// Offset of the `u16` section count in the PDB header.
pub const NUMBER_OF_PDB_RECORDS: usize = 76;
/// Offset of the first section-table slot.
pub const FIRST_PDB_RECORD: usize = 78;
/// Offset of the 8-byte type/creator pair (`BOOKMOBI` for Mobipocket).
pub const TYPE_CREATOR: usize = 0x3C;
/// Size of one section-table slot.
const ENTRY_SIZE: usize = 8;
/// Padding written between the table and the first payload by PDB writers.
const TABLE_PADDING: usize = 2;

/// Reads a big-endian `u32`, failing instead of panicking on short input.
pub(crate) fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(BigEndian::read_u32)
        .ok_or_else(|| Error::InvalidContainer(format!("u32 read at {offset} is out of bounds")))
}

/// Reads a big-endian `u16`, failing instead of panicking on short input.
pub(crate) fn be_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(BigEndian::read_u16)
        .ok_or_else(|| Error::InvalidContainer(format!("u16 read at {offset} is out of bounds")))
}

pub(crate) fn put_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 4)
        .ok_or_else(|| Error::InvalidContainer(format!("u32 write at {offset} is out of bounds")))?;
    BigEndian::write_u32(slot, value);
    Ok(())
}

pub(crate) fn put_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 2)
        .ok_or_else(|| Error::InvalidContainer(format!("u16 write at {offset} is out of bounds")))?;
    BigEndian::write_u16(slot, value);
    Ok(())
}

/// One slot of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub offset: u32,
    /// Attribute byte and 24-bit unique id, kept as the raw word.
    pub unique_id: u32,
}

/// Number of sections announced by the header.
pub fn section_count(data: &[u8]) -> Result<usize> {
    Ok(be_u16(data, NUMBER_OF_PDB_RECORDS)? as usize)
}

/// Reads the whole section table.
pub fn read_entries(data: &[u8]) -> Result<Vec<SectionEntry>> {
    let count = section_count(data)?;
    (0..count)
        .map(|i| {
            let slot = FIRST_PDB_RECORD + i * ENTRY_SIZE;
            Ok(SectionEntry {
                offset: be_u32(data, slot)?,
                unique_id: be_u32(data, slot + 4)?,
            })
        })
        .collect()
}

/// Byte range of section `index`: up to the next offset, or to the end of the buffer for
/// the last section.
pub fn section_range(data: &[u8], index: usize) -> Result<Range<usize>> {
    let count = section_count(data)?;
    if index >= count {
        return Err(Error::InvalidContainer(format!(
            "section {index} out of range (count {count})"
        )));
    }
    let start = be_u32(data, FIRST_PDB_RECORD + index * ENTRY_SIZE)? as usize;
    let end = if index + 1 == count {
        data.len()
    } else {
        be_u32(data, FIRST_PDB_RECORD + (index + 1) * ENTRY_SIZE)? as usize
    };
    if start > end || end > data.len() {
        return Err(Error::PdbInvariant(format!(
            "section {index} spans {start}..{end} in a buffer of {} bytes",
            data.len()
        )));
    }
    Ok(start..end)
}

/// Payload of section `index`.
pub fn section(data: &[u8], index: usize) -> Result<&[u8]> {
    let range = section_range(data, index)?;
    Ok(&data[range])
}

/// Overwrites a section payload without moving anything. Used on memory-mapped files, so the
/// replacement must have exactly the current length.
pub fn overwrite_section_in_place(data: &mut [u8], index: usize, bytes: &[u8]) -> Result<()> {
    let range = section_range(data, index)?;
    if range.len() != bytes.len() {
        return Err(Error::DualMetaFix(format!(
            "section {index} length change in place ({} -> {})",
            range.len(),
            bytes.len()
        )));
    }
    data[range].copy_from_slice(bytes);
    Ok(())
}

/// Checks the header/table invariants of a PDB buffer.
pub fn validate(data: &[u8]) -> Result<()> {
    if data.len() < FIRST_PDB_RECORD {
        return Err(Error::InvalidContainer(format!(
            "{} bytes is too short for a PDB header",
            data.len()
        )));
    }
    let count = section_count(data)?;
    let table_end = FIRST_PDB_RECORD + count * ENTRY_SIZE;
    if table_end > data.len() {
        return Err(Error::PdbInvariant(format!(
            "section table of {count} slots does not fit in {} bytes",
            data.len()
        )));
    }

    let mut previous = table_end;
    for (i, entry) in read_entries(data)?.iter().enumerate() {
        let offset = entry.offset as usize;
        if offset < previous {
            return Err(Error::PdbInvariant(format!(
                "offset of section {i} ({offset}) precedes {previous}"
            )));
        }
        if offset > data.len() {
            return Err(Error::PdbInvariant(format!(
                "offset of section {i} ({offset}) is past the end ({})",
                data.len()
            )));
        }
        previous = offset;
    }
    Ok(())
}

/// An owned, validated Palm Database buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Pdb {
    data: Vec<u8>,
}

impl std::fmt::Debug for Pdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pdb")
            .field("len", &self.data.len())
            .field("sections", &self.section_count())
            .finish()
    }
}

impl Pdb {
    /// Wraps a buffer after checking its table.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        validate(&data)?;
        Ok(Self { data })
    }

    /// Reads and validates a PDB file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(std::fs::read(path)?)
    }

    /// Builds a fresh database from a list of payloads.
    ///
    /// `name` is truncated to 31 bytes (the header keeps a terminating NUL).
    pub fn from_sections(name: &str, type_creator: &[u8; 8], sections: &[&[u8]]) -> Result<Self> {
        let mut header = vec![0u8; FIRST_PDB_RECORD];
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(31);
        header[..name_len].copy_from_slice(&name_bytes[..name_len]);
        header[TYPE_CREATOR..TYPE_CREATOR + 8].copy_from_slice(type_creator);

        let parts: Vec<&[u8]> = sections.to_vec();
        assemble(&header, &[0u8; TABLE_PADDING], &parts, None, true)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn section_count(&self) -> usize {
        // Validated on construction.
        section_count(&self.data).unwrap_or(0)
    }

    pub fn entries(&self) -> Result<Vec<SectionEntry>> {
        read_entries(&self.data)
    }

    pub fn section(&self, index: usize) -> Result<&[u8]> {
        section(&self.data, index)
    }

    /// The 8-byte type/creator pair.
    pub fn type_creator(&self) -> &[u8] {
        &self.data[TYPE_CREATOR..TYPE_CREATOR + 8]
    }

    /// Inserts `bytes` as a new section at `index` (`index == count` appends).
    pub fn insert_section(&self, index: usize, bytes: &[u8]) -> Result<Pdb> {
        let count = self.section_count();
        if index > count {
            return Err(Error::PdbInvariant(format!(
                "cannot insert at {index} into {count} sections"
            )));
        }
        let (header, gap, mut parts, uids) = self.split_parts()?;
        parts.insert(index, bytes);
        let uids = renumber_from(&uids, index, count + 1);
        assemble(header, gap, &parts, Some(&uids), true)
    }

    /// Inserts the sections `first..=last` of `source` at `target`, keeping their order.
    pub fn insert_section_range(
        &self,
        source: &Pdb,
        first: usize,
        last: usize,
        target: usize,
    ) -> Result<Pdb> {
        let mut result = self.clone();
        for index in (first..=last).rev() {
            result = result.insert_section(target, source.section(index)?)?;
        }
        Ok(result)
    }

    /// Removes the sections `first..=last`.
    pub fn delete_section_range(&self, first: usize, last: usize) -> Result<Pdb> {
        let count = self.section_count();
        if first > last || last >= count {
            return Err(Error::PdbInvariant(format!(
                "cannot delete sections {first}..={last} of {count}"
            )));
        }
        let (header, gap, mut parts, uids) = self.split_parts()?;
        parts.drain(first..=last);
        let removed = last - first + 1;
        let mut kept: Vec<u32> = uids[..first].to_vec();
        kept.extend_from_slice(&uids[last + 1..]);
        let uids = renumber_from(&kept, first, count - removed);
        assemble(header, gap, &parts, Some(&uids), true)
    }

    /// Empties section `index` but keeps its slot, so every other slot keeps its number.
    pub fn null_section(&self, index: usize) -> Result<Pdb> {
        let count = self.section_count();
        if index >= count {
            return Err(Error::PdbInvariant(format!(
                "cannot null section {index} of {count}"
            )));
        }
        let (header, gap, mut parts, uids) = self.split_parts()?;
        parts[index] = &[];
        assemble(header, gap, &parts, Some(&uids), false)
    }

    /// Replaces the payload of section `index`; the length may change.
    pub fn replace_section(&self, index: usize, bytes: &[u8]) -> Result<Pdb> {
        let count = self.section_count();
        if index >= count {
            return Err(Error::PdbInvariant(format!(
                "cannot replace section {index} of {count}"
            )));
        }
        let (header, gap, mut parts, mut uids) = self.split_parts()?;
        parts[index] = bytes;
        uids[index] = 2 * index as u32;
        assemble(header, gap, &parts, Some(&uids), true)
    }

    /// Writes the buffer next to `path` and renames it into place.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&self.data)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Splits the buffer into header, padding gap, payload slices and unique ids.
    #[allow(clippy::type_complexity)]
    fn split_parts(&self) -> Result<(&[u8], &[u8], Vec<&[u8]>, Vec<u32>)> {
        let entries = self.entries()?;
        let count = entries.len();
        let table_end = FIRST_PDB_RECORD + count * ENTRY_SIZE;
        let data_start = entries
            .first()
            .map(|e| e.offset as usize)
            .unwrap_or(table_end);
        let parts = (0..count)
            .map(|i| self.section(i))
            .collect::<Result<Vec<_>>>()?;
        Ok((
            &self.data[..FIRST_PDB_RECORD],
            &self.data[table_end..data_start],
            parts,
            entries.iter().map(|e| e.unique_id).collect(),
        ))
    }
}

/// Keeps the ids before `from` and numbers the rest `2 * index`.
fn renumber_from(uids: &[u32], from: usize, count: usize) -> Vec<u32> {
    (0..count)
        .map(|i| if i < from { uids[i] } else { 2 * i as u32 })
        .collect()
}

/// Lays out header, table, gap and payloads into a fresh buffer.
fn assemble(
    header: &[u8],
    gap: &[u8],
    parts: &[&[u8]],
    uids: Option<&[u32]>,
    reseed: bool,
) -> Result<Pdb> {
    let count = parts.len();
    let count_u16 = u16::try_from(count)
        .map_err(|_| Error::PdbInvariant(format!("{count} sections do not fit a PDB table")))?;
    let table_end = FIRST_PDB_RECORD + count * ENTRY_SIZE;
    let payload: usize = parts.iter().map(|p| p.len()).sum();

    let mut data = Vec::with_capacity(table_end + gap.len() + payload);
    data.extend_from_slice(header);
    data.resize(table_end, 0);
    data.extend_from_slice(gap);

    if reseed {
        put_u32(&mut data, UNIQUE_ID_SEED, 2 * count as u32 + 1)?;
    }
    put_u16(&mut data, NUMBER_OF_PDB_RECORDS, count_u16)?;

    for (i, part) in parts.iter().enumerate() {
        let offset = u32::try_from(data.len())
            .map_err(|_| Error::PdbInvariant("section offset exceeds 4 GiB".to_string()))?;
        let slot = FIRST_PDB_RECORD + i * ENTRY_SIZE;
        put_u32(&mut data, slot, offset)?;
        let uid = uids.map(|u| u[i]).unwrap_or(2 * i as u32);
        put_u32(&mut data, slot + 4, uid)?;
        data.extend_from_slice(part);
    }

    Pdb::new(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Pdb {
        Pdb::from_sections(
            "sample",
            b"BOOKMOBI",
            &[b"rec0-header", b"img0", b"img1", b"srcs0", b"srcs1"],
        )
        .unwrap()
    }

    fn assert_consistent(pdb: &Pdb) {
        let entries = pdb.entries().unwrap();
        assert_eq!(entries.len(), pdb.section_count());
        assert_eq!(
            be_u32(pdb.as_bytes(), UNIQUE_ID_SEED).unwrap(),
            2 * pdb.section_count() as u32 + 1
        );
        for pair in entries.windows(2) {
            assert!(pair[0].offset <= pair[1].offset);
        }
    }

    #[test]
    fn test_from_sections_layout() {
        let pdb = sample();
        assert_eq!(pdb.section_count(), 5);
        assert_eq!(pdb.type_creator(), b"BOOKMOBI");
        assert_eq!(pdb.section(0).unwrap(), b"rec0-header");
        assert_eq!(pdb.section(4).unwrap(), b"srcs1");
        let first = pdb.entries().unwrap()[0].offset as usize;
        assert_eq!(first, FIRST_PDB_RECORD + 5 * 8 + TABLE_PADDING);
        assert_consistent(&pdb);
    }

    #[test]
    fn test_insert_section_shifts_offsets() {
        let pdb = sample();
        let before = pdb.entries().unwrap();
        let out = pdb.insert_section(2, b"new!").unwrap();
        let after = out.entries().unwrap();

        assert_eq!(out.section_count(), 6);
        assert_eq!(out.section(2).unwrap(), b"new!");
        assert_eq!(out.section(3).unwrap(), b"img1");
        assert_eq!(after[1].offset, before[1].offset + 8);
        assert_eq!(after[3].offset, before[2].offset + 4 + 8);
        assert_eq!(after[2].unique_id, 4);
        assert_eq!(after[5].unique_id, 10);
        assert_consistent(&out);
    }

    #[test]
    fn test_insert_section_append() {
        let out = sample().insert_section(5, b"tail").unwrap();
        assert_eq!(out.section_count(), 6);
        assert_eq!(out.section(5).unwrap(), b"tail");
        assert!(sample().insert_section(7, b"x").is_err());
    }

    #[test]
    fn test_delete_section_range() {
        let pdb = sample();
        let before = pdb.entries().unwrap();
        let out = pdb.delete_section_range(1, 2).unwrap();
        let after = out.entries().unwrap();

        assert_eq!(out.section_count(), 3);
        assert_eq!(out.section(1).unwrap(), b"srcs0");
        assert_eq!(after[0].offset, before[0].offset - 16);
        assert_eq!(after[1].offset, before[3].offset - (8 + 16));
        assert_eq!(after[1].unique_id, 2);
        assert_eq!(out.len(), pdb.len() - 8 - 16);
        assert_consistent(&out);
    }

    #[test]
    fn test_delete_section_range_rejects_bad_bounds() {
        let pdb = sample();
        assert!(matches!(
            pdb.delete_section_range(3, 2),
            Err(Error::PdbInvariant(_))
        ));
        assert!(matches!(
            pdb.delete_section_range(4, 5),
            Err(Error::PdbInvariant(_))
        ));
    }

    #[test]
    fn test_null_section_keeps_slot() {
        let pdb = sample();
        let out = pdb.null_section(2).unwrap();
        assert_eq!(out.section_count(), 5);
        assert!(out.section(2).unwrap().is_empty());
        assert_eq!(out.section(3).unwrap(), b"srcs0");
        assert_eq!(out.entries().unwrap()[2].unique_id, pdb.entries().unwrap()[2].unique_id);
        assert_eq!(out.len(), pdb.len() - 4);
        assert_consistent(&out);
    }

    #[test]
    fn test_replace_section_changes_length() {
        let out = sample().replace_section(0, b"a much longer record zero").unwrap();
        assert_eq!(out.section(0).unwrap(), b"a much longer record zero");
        assert_eq!(out.section(1).unwrap(), b"img0");
        assert_consistent(&out);
    }

    #[test]
    fn test_insert_section_range_preserves_order() {
        let source = sample();
        let target = Pdb::from_sections("t", b"BOOKMOBI", &[b"kf8-rec0", b"text"]).unwrap();
        let out = target.insert_section_range(&source, 1, 2, 1).unwrap();
        assert_eq!(out.section_count(), 4);
        assert_eq!(out.section(1).unwrap(), b"img0");
        assert_eq!(out.section(2).unwrap(), b"img1");
        assert_eq!(out.section(3).unwrap(), b"text");
    }

    #[test]
    fn test_sequence_of_operations_stays_consistent() {
        let mut pdb = sample();
        pdb = pdb.insert_section(0, b"front").unwrap();
        pdb = pdb.null_section(3).unwrap();
        pdb = pdb.delete_section_range(4, 5).unwrap();
        pdb = pdb.insert_section(2, b"").unwrap();
        pdb = pdb.null_section(0).unwrap();
        assert_eq!(pdb.section_count(), 5);
        assert_consistent(&pdb);
        assert!(validate(pdb.as_bytes()).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_monotonic_table() {
        let mut bytes = sample().into_bytes();
        let third = FIRST_PDB_RECORD + 2 * 8;
        put_u32(&mut bytes, third, 10).unwrap();
        assert!(matches!(Pdb::new(bytes), Err(Error::PdbInvariant(_))));
    }

    #[test]
    fn test_overwrite_in_place_requires_same_length() {
        let mut bytes = sample().into_bytes();
        overwrite_section_in_place(&mut bytes, 1, b"IMG0").unwrap();
        assert_eq!(section(&bytes, 1).unwrap(), b"IMG0");
        assert!(overwrite_section_in_place(&mut bytes, 1, b"longer").is_err());
    }

    #[test]
    fn test_write_atomic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.mobi");
        let pdb = sample();
        pdb.write_atomic(&path).unwrap();
        assert_eq!(Pdb::open(&path).unwrap(), pdb);
    }
}
