use shuppan::error::{Error, Result};
use shuppan::mobi::header::{
    DATP_INDEX, FCIS_INDEX, FLIS_INDEX, HEADER_FLAGS, KF8_FDST_INDEX, LAST_CONTENT_INDEX,
    NULL_INDEX, NULL_INDEX_U16, Record0, SRCS_COUNT, SRCS_INDEX, exth,
};
use shuppan::mobi::split::image_range;
use shuppan::mobi::{RewriteOptions, patch_bytes, patch_copy, rewrite_file, split, strip_srcs};
use shuppan::pdb::Pdb;
use shuppan::types::{CdeType, SplitMode};

mod common;
use common::*;

fn header_of(pdb: &Pdb, index: usize) -> shuppan::mobi::MobiHeader {
    Record0::from_slice(pdb.section(index).unwrap())
        .unwrap()
        .header()
        .unwrap()
}

fn exth_bytes(pdb: &Pdb, index: usize, kind: u32) -> Option<Vec<u8>> {
    header_of(pdb, index).exth_value(kind).map(|e| e.data.clone())
}

/// The combo fixture with a two-section SRCS block in front of the boundary record.
fn combo_with_srcs() -> Pdb {
    let pdb = combo_book(64)
        .insert_section(5, b"SRCS-archive")
        .unwrap()
        .insert_section(6, b"CMET-archive")
        .unwrap();
    let mut rec0 = Record0::from_slice(pdb.section(0).unwrap()).unwrap();
    rec0.set_u32(SRCS_INDEX, 5).unwrap();
    rec0.set_u32(SRCS_COUNT, 2).unwrap();
    rec0.write_exth(exth::KF8_BOUNDARY, &(COMBO_BOUNDARY + 2).to_be_bytes())
        .unwrap();
    pdb.replace_section(0, rec0.as_bytes()).unwrap()
}

/// The combo fixture without a last content index; its DATP record sits at section 4.
fn combo_with_datp_bound() -> Pdb {
    let pdb = combo_book(64);
    let mut rec0 = Record0::from_slice(pdb.section(0).unwrap()).unwrap();
    rec0.set_u16(LAST_CONTENT_INDEX, NULL_INDEX_U16).unwrap();
    rec0.set_u32(DATP_INDEX, 4).unwrap();
    pdb.replace_section(0, rec0.as_bytes()).unwrap()
}

#[test]
fn test_strip_removes_srcs_block() -> Result<()> {
    let pdb = book_with_srcs();
    let stripped = strip_srcs(&pdb)?;

    assert_eq!(stripped.pdb.section_count(), 3);
    assert_eq!(stripped.removed_sections, 2);
    assert_eq!(
        stripped.removed_bytes,
        b"SRCS-archive".len() + b"CMET-archive".len()
    );
    assert_eq!(stripped.pdb.section(1)?, b"img0-data");
    assert_eq!(stripped.pdb.section(2)?, b"img1-data");

    let header = header_of(&stripped.pdb, 0);
    assert_eq!(header.srcs_index, NULL_INDEX);
    assert_eq!(header.srcs_count, 0);
    Ok(())
}

#[test]
fn test_strip_without_srcs_reports_missing_block() {
    let pdb = combo_book(16);
    assert!(matches!(strip_srcs(&pdb), Err(Error::MissingSourceBlock)));
}

#[test]
fn test_strip_rejects_wrong_type_creator() {
    let pdb = Pdb::from_sections("Fixture", b"TEXtREAd", &[b"whatever"]).unwrap();
    assert!(matches!(
        strip_srcs(&pdb),
        Err(Error::InvalidContainer(_))
    ));
}

#[test]
fn test_strip_moves_kf8_boundary() -> Result<()> {
    let pdb = combo_with_srcs();
    let stripped = strip_srcs(&pdb)?;

    assert_eq!(stripped.pdb.section_count(), pdb.section_count() - 2);
    assert_eq!(
        header_of(&stripped.pdb, 0).kf8_boundary(),
        Some(COMBO_BOUNDARY)
    );
    // The boundary still points at the KF8 record 0.
    assert_eq!(header_of(&stripped.pdb, COMBO_BOUNDARY as usize).version, 8);
    Ok(())
}

#[test]
fn test_strip_rejects_boundary_inside_srcs_block() -> Result<()> {
    let pdb = combo_with_srcs();
    let mut rec0 = Record0::from_slice(pdb.section(0)?)?;
    rec0.write_exth(exth::KF8_BOUNDARY, &6u32.to_be_bytes())?;
    let pdb = pdb.replace_section(0, rec0.as_bytes())?;

    assert!(matches!(
        strip_srcs(&pdb),
        Err(Error::InvalidContainer(_))
    ));
    Ok(())
}

#[test]
fn test_mobi7_split() -> Result<()> {
    let pdb = combo_book(64);
    let outcome = split(&pdb, SplitMode::Mobi7Standalone)?;
    assert!(outcome.is_combo);
    let out = outcome.pdb;

    assert_eq!(out.section_count(), COMBO_BOUNDARY as usize);
    assert_eq!(out.section(out.section_count() - 1)?, b"\xe9\x8e\r\n");

    let header = header_of(&out, 0);
    assert_eq!(header.kf8_boundary(), None);
    assert_eq!(
        exth_bytes(&out, 0, exth::KF8_BOUNDARY),
        Some(NULL_INDEX.to_be_bytes().to_vec())
    );
    assert_eq!(exth_bytes(&out, 0, exth::KF8_MASTHEAD), Some(Vec::new()));
    assert_eq!(exth_bytes(&out, 0, exth::CDE_TYPE), Some(b"EBOK".to_vec()));
    assert_eq!(header.flags, 0x0050);

    // Fonts and resources are emptied, images are kept.
    assert_eq!(out.section(2)?, b"img0-data");
    assert!(out.section(3)?.is_empty());
    assert!(out.section(4)?.is_empty());
    Ok(())
}

#[test]
fn test_mobi8_split() -> Result<()> {
    let pdb = combo_book(64);
    let out = split(&pdb, SplitMode::Mobi8Standalone)?.pdb;

    // KF8 part (6 sections) plus the shared range 2..=4.
    assert_eq!(out.section_count(), 9);
    assert_eq!(header_of(&out, 0).version, 8);
    assert_eq!(out.section(1)?, b"text8");
    assert_eq!(out.section(2)?, b"img0-data");
    assert_eq!(out.section(3)?, b"FONT-data");
    assert_eq!(out.section(4)?, b"RESC-data");

    let rec0 = Record0::from_slice(out.section(0)?)?;
    for (offset, magic) in [
        (KF8_FDST_INDEX, b"FDST"),
        (FCIS_INDEX, b"FCIS"),
        (FLIS_INDEX, b"FLIS"),
    ] {
        let index = rec0.u32_at(offset)? as usize;
        assert!(out.section(index)?.starts_with(magic));
    }
    assert_eq!(rec0.u32_at(HEADER_FLAGS)? & 0x0800, 0x0800);

    assert_eq!(
        exth_bytes(&out, 0, exth::KF8_RESOURCE_COUNT),
        Some(3u32.to_be_bytes().to_vec())
    );
    assert_eq!(rec0.exth_values(exth::START_OFFSET)?, vec![2u32.to_be_bytes().to_vec()]);
    assert_eq!(exth_bytes(&out, 0, exth::CDE_TYPE), Some(b"EBOK".to_vec()));
    Ok(())
}

#[test]
fn test_image_range_ends_before_index_records() -> Result<()> {
    let pdb = combo_with_datp_bound();
    assert_eq!(image_range(&header_of(&pdb, 0)), Some((2, 3)));

    // Only the FONT slot lies inside the range.
    let mobi7 = split(&pdb, SplitMode::Mobi7Standalone)?.pdb;
    assert_eq!(mobi7.section(2)?, b"img0-data");
    assert!(mobi7.section(3)?.is_empty());
    assert_eq!(mobi7.section(4)?, b"RESC-data");

    let mobi8 = split(&pdb, SplitMode::Mobi8Standalone)?.pdb;
    assert_eq!(mobi8.section_count(), 8);
    assert_eq!(mobi8.section(3)?, b"FONT-data");
    assert_eq!(mobi8.section(4)?, b"FDST-data");
    let rec0 = Record0::from_slice(mobi8.section(0)?)?;
    assert_eq!(rec0.u32_at(KF8_FDST_INDEX)?, 4);
    assert_eq!(
        exth_bytes(&mobi8, 0, exth::KF8_RESOURCE_COUNT),
        Some(2u32.to_be_bytes().to_vec())
    );
    Ok(())
}

#[test]
fn test_split_of_plain_file_is_noop() -> Result<()> {
    let pdb = book_with_srcs();
    let outcome = split(&pdb, SplitMode::Mobi8Standalone)?;
    assert!(!outcome.is_combo);
    assert_eq!(outcome.pdb.as_bytes(), pdb.as_bytes());
    Ok(())
}

#[test]
fn test_metafix_keeps_section_layout() -> Result<()> {
    let pdb = combo_book(64);
    let entries_before = pdb.entries()?;
    let mut bytes = pdb.into_bytes();
    let length = bytes.len();

    let report = patch_bytes(&mut bytes, b"B00TESTASIN", CdeType::Pdoc)?;
    assert!(report.patched_kf8);
    assert_eq!(bytes.len(), length);

    let patched = Pdb::new(bytes)?;
    assert_eq!(patched.entries()?, entries_before);
    for index in [0, COMBO_BOUNDARY as usize] {
        assert_eq!(exth_bytes(&patched, index, exth::ASIN), Some(b"B00TESTASIN".to_vec()));
        assert_eq!(exth_bytes(&patched, index, exth::CDE_TYPE), Some(b"PDOC".to_vec()));
    }
    // Untouched entries survive.
    assert_eq!(exth_bytes(&patched, 0, 100), Some(b"Author".to_vec()));
    Ok(())
}

#[test]
fn test_metafix_replaces_existing_fields() -> Result<()> {
    let mut bytes = combo_book(64).into_bytes();
    patch_bytes(&mut bytes, b"FIRSTASIN", CdeType::Pdoc)?;
    patch_bytes(&mut bytes, b"SECOND", CdeType::Ebok)?;

    let patched = Pdb::new(bytes)?;
    let rec0 = Record0::from_slice(patched.section(0)?)?;
    assert_eq!(rec0.exth_values(exth::ASIN)?, vec![b"SECOND".to_vec()]);
    assert_eq!(rec0.exth_values(exth::CDE_TYPE)?, vec![b"EBOK".to_vec()]);
    Ok(())
}

#[test]
fn test_metafix_needs_padding() {
    let mut bytes = combo_book(0).into_bytes();
    let original = bytes.clone();
    let result = patch_bytes(&mut bytes, b"B00TESTASIN", CdeType::Ebok);
    assert!(matches!(result, Err(Error::DualMetaFix(_))));
    // Nothing is written before both records are computed.
    assert_eq!(bytes, original);
}

#[test]
fn test_patch_copy_leaves_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("book.mobi");
    let target = dir.path().join("patched.mobi");
    std::fs::write(&source, combo_book(64).as_bytes())?;

    patch_copy(&source, &target, b"B00COPY", CdeType::Ebok)?;

    let original = Pdb::open(&source)?;
    let patched = Pdb::open(&target)?;
    assert_eq!(exth_bytes(&original, 0, exth::ASIN), None);
    assert_eq!(exth_bytes(&patched, 0, exth::ASIN), Some(b"B00COPY".to_vec()));
    assert_eq!(original.len(), patched.len());
    Ok(())
}

#[test]
fn test_rewrite_file_runs_every_stage() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("book.mobi");
    let pdb = combo_with_srcs();
    std::fs::write(&path, pdb.as_bytes())?;

    let report = rewrite_file(
        &path,
        &RewriteOptions {
            split_mode: Some(SplitMode::Mobi7Standalone),
            asin: Some("B00REWRITE".to_string()),
            cde_type: CdeType::Pdoc,
            ..Default::default()
        },
    )?;

    assert_eq!(report.size_before, pdb.len() as u64);
    assert!(report.size_after < report.size_before);
    assert!(report.stripped_bytes > 0);
    assert!(report.split);
    assert_eq!(report.patch.map(|p| p.patched_kf8), Some(false));

    let out = Pdb::open(&path)?;
    assert_eq!(out.section_count(), COMBO_BOUNDARY as usize);
    assert_eq!(exth_bytes(&out, 0, exth::ASIN), Some(b"B00REWRITE".to_vec()));
    assert_eq!(exth_bytes(&out, 0, exth::CDE_TYPE), Some(b"PDOC".to_vec()));
    assert_eq!(header_of(&out, 0).srcs_index, NULL_INDEX);
    Ok(())
}

#[test]
fn test_rewrite_file_without_srcs_is_not_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("book.mobi");
    let pdb = combo_book(64);
    std::fs::write(&path, pdb.as_bytes())?;

    let report = rewrite_file(&path, &RewriteOptions::default())?;
    assert_eq!(report.stripped_bytes, 0);
    assert!(!report.split);
    assert!(report.patch.is_none());
    assert_eq!(std::fs::read(&path)?, pdb.as_bytes());
    Ok(())
}
