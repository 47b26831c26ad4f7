//! Record 0 of a Mobipocket container: the MOBI header and its EXTH metadata block.
//!
//! [`Record0`] owns the raw bytes and edits them the way the container expects: EXTH
//! entries are inserted at the front of the block, and every size change inside the block
//! moves the title (which lives after it) so `title_offset` is kept in step.

use crate::error::{Error, Result};
use crate::pdb::{be_u16, be_u32, put_u16, put_u32};

/// Sentinel for "no such section" in record-0 index fields and EXTH 121.
pub const NULL_INDEX: u32 = 0xFFFF_FFFF;
/// 16-bit flavour of [`NULL_INDEX`] used by `last_content_index`.
pub const NULL_INDEX_U16: u16 = 0xFFFF;

/// Start of the MOBI header inside record 0 (after the PalmDOC header).
pub const MOBI_HEADER_BASE: usize = 16;
pub const MOBI_HEADER_LENGTH: usize = 20;
pub const MOBI_TYPE: usize = 24;
pub const MOBI_VERSION: usize = 36;
pub const TITLE_OFFSET: usize = 84;
pub const FIRST_IMAGE_RECORD: usize = 108;
pub const HUFFTBL_OFFSET: usize = 120;
/// Header flags word (0x40 = EXTH present, 0x0800 = shared resources, 0x1000 = fonts).
pub const HEADER_FLAGS: usize = 0x80;
/// In a KF8 header the first-content/last-content pair is reused as the FDST index.
pub const KF8_FDST_INDEX: usize = 192;
pub const LAST_CONTENT_INDEX: usize = 194;
pub const FCIS_INDEX: usize = 200;
pub const FLIS_INDEX: usize = 208;
pub const SRCS_INDEX: usize = 224;
pub const SRCS_COUNT: usize = 228;
pub const DATP_INDEX: usize = 256;

pub const FLAG_SHARED_RESOURCES: u32 = 0x0800;
pub const FLAG_EMBEDDED_FONTS: u32 = 0x1000;

/// EXTH record types used by the rewriter.
pub mod exth {
    pub const ASIN: u32 = 113;
    pub const START_OFFSET: u32 = 116;
    pub const KF8_BOUNDARY: u32 = 121;
    pub const KF8_RESOURCE_COUNT: u32 = 125;
    pub const KF8_MASTHEAD: u32 = 129;
    pub const CDE_TYPE: u32 = 501;
}

const EXTH_MAGIC: &[u8; 4] = b"EXTH";
const EXTH_PREAMBLE: usize = 12;
const EXTH_ENTRY_HEADER: usize = 8;

/// One typed EXTH entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExthEntry {
    pub kind: u32,
    pub data: Vec<u8>,
}

impl ExthEntry {
    /// Interprets a 4-byte payload as a big-endian number.
    pub fn as_u32(&self) -> Option<u32> {
        be_u32(&self.data, 0).ok().filter(|_| self.data.len() == 4)
    }
}

/// Parsed view of record 0. Fields outside the stored record read as the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobiHeader {
    pub header_length: u32,
    pub mobi_type: u32,
    pub version: u32,
    pub title_offset: u32,
    pub first_image_record: u32,
    pub last_content_index: u16,
    pub kf8_fdst_index: u32,
    pub srcs_index: u32,
    pub srcs_count: u32,
    pub fcis_index: u32,
    pub flis_index: u32,
    pub datp_index: u32,
    pub hufftbl_offset: u32,
    pub flags: u32,
    pub exth: Vec<ExthEntry>,
}

impl MobiHeader {
    /// The first EXTH entry of `kind`.
    pub fn exth_value(&self, kind: u32) -> Option<&ExthEntry> {
        self.exth.iter().find(|e| e.kind == kind)
    }

    /// Boundary section index of the embedded KF8 part, if this is a combo container.
    pub fn kf8_boundary(&self) -> Option<u32> {
        if self.version == 8 {
            return None;
        }
        self.exth_value(exth::KF8_BOUNDARY)
            .and_then(ExthEntry::as_u32)
            .filter(|&b| b != NULL_INDEX)
    }
}

/// Owned record-0 bytes with typed accessors and EXTH editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record0 {
    data: Vec<u8>,
}

impl Record0 {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.get(MOBI_HEADER_BASE..MOBI_HEADER_BASE + 4) != Some(b"MOBI".as_slice()) {
            return Err(Error::InvalidContainer(
                "record 0 does not carry a MOBI header".to_string(),
            ));
        }
        Ok(Self { data })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
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

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        be_u32(&self.data, offset)
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        put_u32(&mut self.data, offset, value)
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        be_u16(&self.data, offset)
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        put_u16(&mut self.data, offset, value)
    }

    /// Reads an index field, treating bytes past the end of the record as the sentinel.
    fn index_field(&self, offset: usize) -> u32 {
        self.u32_at(offset).unwrap_or(NULL_INDEX)
    }

    pub fn header(&self) -> Result<MobiHeader> {
        Ok(MobiHeader {
            header_length: self.u32_at(MOBI_HEADER_LENGTH)?,
            mobi_type: self.u32_at(MOBI_TYPE)?,
            version: self.u32_at(MOBI_VERSION)?,
            title_offset: self.u32_at(TITLE_OFFSET)?,
            first_image_record: self.index_field(FIRST_IMAGE_RECORD),
            last_content_index: self.u16_at(LAST_CONTENT_INDEX).unwrap_or(NULL_INDEX_U16),
            kf8_fdst_index: self.index_field(KF8_FDST_INDEX),
            srcs_index: self.index_field(SRCS_INDEX),
            srcs_count: self.u32_at(SRCS_COUNT).unwrap_or(0),
            fcis_index: self.index_field(FCIS_INDEX),
            flis_index: self.index_field(FLIS_INDEX),
            datp_index: self.index_field(DATP_INDEX),
            hufftbl_offset: self.index_field(HUFFTBL_OFFSET),
            flags: self.u32_at(HEADER_FLAGS).unwrap_or(0),
            exth: self.exth_entries()?,
        })
    }

    /// Start of the EXTH block, its declared length and entry count.
    fn exth_params(&self) -> Result<(usize, u32, u32)> {
        let base = MOBI_HEADER_BASE + self.u32_at(MOBI_HEADER_LENGTH)? as usize;
        if self.data.get(base..base + 4) != Some(EXTH_MAGIC.as_slice()) {
            return Err(Error::InvalidContainer(format!(
                "no EXTH block at offset {base}"
            )));
        }
        Ok((base, self.u32_at(base + 4)?, self.u32_at(base + 8)?))
    }

    /// Walks the EXTH entries as `(position, kind, size)` triples.
    fn exth_layout(&self) -> Result<Vec<(usize, u32, usize)>> {
        let (base, _, count) = match self.exth_params() {
            Ok(params) => params,
            Err(_) => return Ok(Vec::new()),
        };
        let mut layout = Vec::with_capacity(count as usize);
        let mut pos = base + EXTH_PREAMBLE;
        for _ in 0..count {
            let kind = self.u32_at(pos)?;
            let size = self.u32_at(pos + 4)? as usize;
            if size < EXTH_ENTRY_HEADER || pos + size > self.data.len() {
                return Err(Error::InvalidContainer(format!(
                    "EXTH entry {kind} at {pos} has invalid size {size}"
                )));
            }
            layout.push((pos, kind, size));
            pos += size;
        }
        Ok(layout)
    }

    pub fn exth_entries(&self) -> Result<Vec<ExthEntry>> {
        Ok(self
            .exth_layout()?
            .into_iter()
            .map(|(pos, kind, size)| ExthEntry {
                kind,
                data: self.data[pos + EXTH_ENTRY_HEADER..pos + size].to_vec(),
            })
            .collect())
    }

    /// Every payload stored under `kind`, in block order.
    pub fn exth_values(&self, kind: u32) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .exth_entries()?
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.data)
            .collect())
    }

    fn shift_title(&mut self, delta: i64) -> Result<()> {
        let title = self.u32_at(TITLE_OFFSET)? as i64 + delta;
        let title = u32::try_from(title)
            .map_err(|_| Error::InvalidContainer(format!("title offset {title} out of range")))?;
        self.set_u32(TITLE_OFFSET, title)
    }

    fn set_exth_totals(&mut self, base: usize, length: u32, count: u32) -> Result<()> {
        self.set_u32(base + 4, length)?;
        self.set_u32(base + 8, count)
    }

    /// Inserts a new entry at the front of the block. The record grows by `8 + data.len()`.
    pub fn add_exth(&mut self, kind: u32, data: &[u8]) -> Result<()> {
        let (base, length, count) = self.exth_params()?;
        let size = EXTH_ENTRY_HEADER + data.len();
        let mut entry = Vec::with_capacity(size);
        entry.extend_from_slice(&kind.to_be_bytes());
        entry.extend_from_slice(&(size as u32).to_be_bytes());
        entry.extend_from_slice(data);

        let at = base + EXTH_PREAMBLE;
        self.data.splice(at..at, entry);
        self.set_exth_totals(base, length + size as u32, count + 1)?;
        self.shift_title(size as i64)
    }

    /// Removes the first entry of `kind`. Returns the number of bytes removed (0 when absent).
    pub fn remove_exth(&mut self, kind: u32) -> Result<usize> {
        let Some((pos, _, size)) = self
            .exth_layout()?
            .into_iter()
            .find(|&(_, k, _)| k == kind)
        else {
            return Ok(0);
        };
        let (base, length, count) = self.exth_params()?;
        self.data.drain(pos..pos + size);
        self.set_exth_totals(base, length.saturating_sub(size as u32), count.saturating_sub(1))?;
        self.shift_title(-(size as i64))?;
        Ok(size)
    }

    /// Rewrites the payload of the first entry of `kind` in place in the block. Returns
    /// `false` (and leaves the record untouched) when there is no such entry.
    pub fn write_exth(&mut self, kind: u32, data: &[u8]) -> Result<bool> {
        let Some((pos, _, size)) = self
            .exth_layout()?
            .into_iter()
            .find(|&(_, k, _)| k == kind)
        else {
            return Ok(false);
        };
        let (base, length, count) = self.exth_params()?;
        let new_size = EXTH_ENTRY_HEADER + data.len();
        let delta = new_size as i64 - size as i64;

        self.data
            .splice(pos + EXTH_ENTRY_HEADER..pos + size, data.iter().copied());
        self.set_u32(pos + 4, new_size as u32)?;
        let length = u32::try_from(length as i64 + delta)
            .map_err(|_| Error::InvalidContainer("EXTH length underflow".to_string()))?;
        self.set_exth_totals(base, length, count)?;
        if delta != 0 {
            self.shift_title(delta)?;
        }
        Ok(true)
    }

    /// Adds `kind = data` only when no entry of that type exists yet.
    pub fn ensure_exth(&mut self, kind: u32, data: &[u8]) -> Result<()> {
        if self.exth_values(kind)?.is_empty() {
            self.add_exth(kind, data)?;
        }
        Ok(())
    }

    /// Appends `count` null bytes at the end of the record.
    pub fn pad_nulls(&mut self, count: usize) {
        self.data.resize(self.data.len() + count, 0);
    }

    /// Drops `count` trailing bytes, which must all be null padding.
    pub fn trim_nulls(&mut self, count: usize) -> Result<()> {
        let keep = self.data.len().checked_sub(count).ok_or_else(|| {
            Error::DualMetaFix(format!("cannot trim {count} bytes from record 0"))
        })?;
        if self.data[keep..].iter().any(|&b| b != 0) {
            return Err(Error::DualMetaFix(
                "trimmed non-null bytes at end of record 0".to_string(),
            ));
        }
        self.data.truncate(keep);
        Ok(())
    }

    /// Removes every entry of `kind` except the last one.
    pub fn keep_last_exth(&mut self, kind: u32) -> Result<()> {
        let mut duplicates = self.exth_values(kind)?.len();
        while duplicates > 1 {
            self.remove_exth(kind)?;
            duplicates -= 1;
        }
        Ok(())
    }
}
