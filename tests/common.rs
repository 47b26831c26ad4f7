//! Common test utilities for the Shuppan crate.
//!
//! Provides random-suffixed test directories, dummy page images and synthetic
//! Mobipocket containers.

use image::{Rgb, RgbImage};
use rand::{Rng, distributions::Alphanumeric};
use shuppan::error::{Error, Result};
use shuppan::mobi::header::{
    DATP_INDEX, FCIS_INDEX, FIRST_IMAGE_RECORD, FLIS_INDEX, HEADER_FLAGS, HUFFTBL_OFFSET,
    KF8_FDST_INDEX, LAST_CONTENT_INDEX, MOBI_HEADER_BASE, MOBI_HEADER_LENGTH, MOBI_TYPE,
    MOBI_VERSION, NULL_INDEX, SRCS_COUNT, SRCS_INDEX, TITLE_OFFSET,
};
use shuppan::pdb::Pdb;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[allow(dead_code)]
pub const TEST_TMP_DIR: &str = "tests/tmp";
#[allow(dead_code)]
pub const LONG_TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Paths of one test's scratch area.
#[allow(dead_code)]
pub struct TestDirs {
    pub test_dir: PathBuf,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
}

/// Creates `tests/tmp/<sub_path>-<random>/{source,target}`.
#[allow(dead_code)]
pub async fn setup_test_dirs(sub_path: &str) -> TestDirs {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let test_dir = PathBuf::from(TEST_TMP_DIR).join(format!("{}-{}", sub_path, rand_string));
    if test_dir.exists() {
        fs::remove_dir_all(&test_dir).await.unwrap();
    }
    let source_dir = test_dir.join("source");
    let target_dir = test_dir.join("target");
    fs::create_dir_all(&source_dir).await.unwrap();
    fs::create_dir_all(&target_dir).await.unwrap();

    TestDirs {
        test_dir,
        source_dir,
        target_dir,
    }
}

/// Writes a solid-color JPEG of the given size.
#[allow(dead_code)]
pub async fn create_dummy_image(
    path: &Path,
    width: u32,
    height: u32,
    color: Rgb<u8>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let img = RgbImage::from_pixel(width, height, color);
    let path_clone = path.to_path_buf();
    tokio::task::spawn_blocking(move || img.save_with_format(path_clone, image::ImageFormat::Jpeg))
        .await?
        .map_err(Error::Image)?;
    Ok(())
}

/// A 100x150 portrait page.
#[allow(dead_code)]
pub async fn create_dummy_page(path: &Path) -> Result<()> {
    create_dummy_image(path, 100, 150, Rgb([200, 30, 30])).await
}

/// A 300x150 landscape spread.
#[allow(dead_code)]
pub async fn create_dummy_spread(path: &Path) -> Result<()> {
    create_dummy_image(path, 300, 150, Rgb([30, 30, 200])).await
}

/// Writes `bytes` zero bytes at `path`, creating parents.
#[allow(dead_code)]
pub fn create_sized_file(path: &Path, bytes: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![0u8; bytes]).unwrap();
}

/// Builds a `OEBPS/Images` workspace root inside `dir`.
#[allow(dead_code)]
pub fn workspace_root(dir: &Path) -> (PathBuf, PathBuf) {
    let root = dir.join("workspace");
    let images = root.join("OEBPS").join("Images");
    std::fs::create_dir_all(&images).unwrap();
    (root, images)
}

/// Checks that a ZIP file (CBZ or EPUB) exists and has entries.
#[allow(dead_code)]
pub async fn assert_valid_zip_file(path: &Path) {
    assert!(path.is_file(), "Output ZIP file does not exist: {:?}", path);
    let file = fs::File::open(path).await.unwrap();
    let zip = zip::ZipArchive::new(file.into_std().await).unwrap();
    assert!(zip.len() > 0, "Output ZIP file is empty: {:?}", path);
}

/// Names of every entry of a ZIP file.
#[allow(dead_code)]
pub fn zip_entry_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let zip = zip::ZipArchive::new(file).unwrap();
    zip.file_names().map(str::to_string).collect()
}

/// Reads `ComicInfo.xml` from a CBZ.
#[allow(dead_code)]
pub fn get_comic_info_xml(cbz_path: &Path) -> String {
    let file = std::fs::File::open(cbz_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name("ComicInfo.xml").unwrap();
    let mut content = String::new();
    std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
    content
}

// --- Mobipocket fixtures ---

#[allow(dead_code)]
pub fn set_u32(rec: &mut [u8], offset: usize, value: u32) {
    rec[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[allow(dead_code)]
pub fn set_u16(rec: &mut [u8], offset: usize, value: u16) {
    rec[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[allow(dead_code)]
pub fn get_u32(rec: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(rec[offset..offset + 4].try_into().unwrap())
}

/// A record 0 with every index field unset, an EXTH block, a title and `padding` nulls.
#[allow(dead_code)]
pub fn record0(version: u32, exth: &[(u32, &[u8])], padding: usize) -> Vec<u8> {
    let header_length = 264usize;
    let mut rec = vec![0u8; MOBI_HEADER_BASE + header_length];
    rec[MOBI_HEADER_BASE..MOBI_HEADER_BASE + 4].copy_from_slice(b"MOBI");
    set_u32(&mut rec, MOBI_HEADER_LENGTH, header_length as u32);
    set_u32(&mut rec, MOBI_TYPE, 2);
    set_u32(&mut rec, MOBI_VERSION, version);
    set_u32(&mut rec, HEADER_FLAGS, 0x1850);
    for offset in [
        FIRST_IMAGE_RECORD,
        HUFFTBL_OFFSET,
        KF8_FDST_INDEX,
        FCIS_INDEX,
        FLIS_INDEX,
        SRCS_INDEX,
        DATP_INDEX,
    ] {
        set_u32(&mut rec, offset, NULL_INDEX);
    }
    set_u32(&mut rec, SRCS_COUNT, 0);

    let mut block = Vec::new();
    for (kind, data) in exth {
        block.extend_from_slice(&kind.to_be_bytes());
        block.extend_from_slice(&((8 + data.len()) as u32).to_be_bytes());
        block.extend_from_slice(data);
    }
    rec.extend_from_slice(b"EXTH");
    rec.extend_from_slice(&((12 + block.len()) as u32).to_be_bytes());
    rec.extend_from_slice(&(exth.len() as u32).to_be_bytes());
    rec.extend_from_slice(&block);

    let title = b"Fixture";
    let title_at = rec.len() as u32;
    set_u32(&mut rec, TITLE_OFFSET, title_at);
    set_u32(&mut rec, TITLE_OFFSET + 4, title.len() as u32);
    rec.extend_from_slice(title);
    rec.extend(std::iter::repeat_n(0u8, padding));
    rec
}

/// `[rec0, img0, img1, srcs0, srcs1]` with the SRCS block at 3..=4.
#[allow(dead_code)]
pub fn book_with_srcs() -> Pdb {
    let mut rec0 = record0(6, &[(100, b"Author")], 32);
    set_u32(&mut rec0, FIRST_IMAGE_RECORD, 1);
    set_u32(&mut rec0, SRCS_INDEX, 3);
    set_u32(&mut rec0, SRCS_COUNT, 2);
    Pdb::from_sections(
        "Fixture",
        b"BOOKMOBI",
        &[rec0.as_slice(), b"img0-data", b"img1-data", b"SRCS-archive", b"CMET-archive"],
    )
    .unwrap()
}

/// Section index of the KF8 record 0 in [`combo_book`].
#[allow(dead_code)]
pub const COMBO_BOUNDARY: u32 = 6;

/// A MOBI6+KF8 combo container:
///
/// ```text
/// 0 rec0(v6)  1 text6  2 img0  3 FONT  4 RESC  5 BOUNDARY
/// 6 rec0(v8)  7 text8  8 FDST  9 FCIS  10 FLIS  11 EOF
/// ```
#[allow(dead_code)]
pub fn combo_book(padding: usize) -> Pdb {
    let mut mobi6 = record0(
        6,
        &[
            (121, &COMBO_BOUNDARY.to_be_bytes()),
            (129, b"kindle:embed:0001"),
            (100, b"Author"),
        ],
        padding,
    );
    set_u32(&mut mobi6, FIRST_IMAGE_RECORD, 2);
    set_u16(&mut mobi6, KF8_FDST_INDEX, 1);
    set_u16(&mut mobi6, LAST_CONTENT_INDEX, 4);

    let mut kf8 = record0(
        8,
        &[
            (116, &1u32.to_be_bytes()),
            (116, &2u32.to_be_bytes()),
            (125, &0u32.to_be_bytes()),
            (100, b"Author"),
        ],
        padding,
    );
    // Indices relative to the KF8 part once the MOBI6 part is gone.
    set_u32(&mut kf8, FIRST_IMAGE_RECORD, 2);
    set_u32(&mut kf8, KF8_FDST_INDEX, 2);
    set_u32(&mut kf8, FCIS_INDEX, 3);
    set_u32(&mut kf8, FLIS_INDEX, 4);

    Pdb::from_sections(
        "Fixture",
        b"BOOKMOBI",
        &[
            mobi6.as_slice(),
            b"text6",
            b"img0-data",
            b"FONT-data",
            b"RESC-data",
            b"BOUNDARY",
            kf8.as_slice(),
            b"text8",
            b"FDST-data",
            b"FCIS-data",
            b"FLIS-data",
            b"\xe9\x8e\r\n",
        ],
    )
    .unwrap()
}
