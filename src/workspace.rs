//! Workspace layout and tree inspection.
//!
//! A workspace is a directory holding `OEBPS/Images/...`; every later stage (page processing,
//! volume splitting, packaging) works on that subtree. This module also owns the natural
//! sibling ordering and the tree-shape detection the volume splitter relies on.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use tokio::task::spawn_blocking;

use crate::error::{Error, Result};
use crate::path_utils::is_hidden_file;
use crate::types::{TreeShape, is_image_file};

/// Prefix of every temporary directory the pipeline creates.
pub const TEMP_PREFIX: &str = "KCC-";

lazy_static! {
    /// Splits a name into digit and non-digit runs for natural ordering.
    static ref NATURAL_CHUNK_REGEX: Regex = Regex::new(r"\d+|\D+").unwrap();
}

/// Produces the normalized `OEBPS/Images` workspace from some source.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Materializes `source` as a fresh workspace inside `parent`.
    async fn extract(&self, source: &Path, parent: &Path) -> Result<Workspace>;
}

/// Extractor for sources that already are plain image directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryExtractor;

#[async_trait]
impl Extractor for DirectoryExtractor {
    async fn extract(&self, source: &Path, parent: &Path) -> Result<Workspace> {
        Workspace::from_directory(source, parent).await
    }
}

/// Root of an `OEBPS/Images` tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Relative location of the page tree inside a workspace or volume root.
    pub fn images_subdir() -> PathBuf {
        Path::new("OEBPS").join("Images")
    }

    /// Opens an existing workspace.
    pub fn open(root: &Path) -> Result<Self> {
        let images = root.join(Self::images_subdir());
        if !images.is_dir() {
            return Err(Error::NotFound(format!(
                "Workspace has no OEBPS/Images directory: {:?}",
                root
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Creates an empty workspace at `root`.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(Self::images_subdir()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Copies the image files of `source` (recursively, keeping the layout) into a new
    /// `KCC-` directory under `parent`.
    pub async fn from_directory(source: &Path, parent: &Path) -> Result<Self> {
        if !source.is_dir() {
            return Err(Error::InvalidPath(
                source.to_path_buf(),
                "Source path is not a directory.".to_string(),
            ));
        }
        let source = source.to_path_buf();
        let parent = parent.to_path_buf();

        spawn_blocking(move || {
            fs::create_dir_all(&parent)?;
            let root = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempdir_in(&parent)?
                .keep();
            let workspace = Self::create(&root)?;
            let copied = copy_images(&source, &workspace.images_dir())?;
            if copied == 0 {
                workspace.remove()?;
                return Err(Error::EmptySource(source));
            }
            log::info!("Copied {copied} images from {:?} into {:?}", source, root);
            Ok(workspace)
        })
        .await?
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(Self::images_subdir())
    }

    /// Deletes the whole workspace directory.
    pub fn remove(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

fn copy_images(source: &Path, target: &Path) -> Result<usize> {
    let (dirs, files) = list_entries(source)?;
    let mut copied = 0;
    for file in files.iter().filter(|f| is_image_file(f)) {
        if let Some(name) = file.file_name() {
            fs::copy(file, target.join(name))?;
            copied += 1;
        }
    }
    for dir in dirs {
        if let Some(name) = dir.file_name() {
            let sub = target.join(name);
            fs::create_dir_all(&sub)?;
            copied += copy_images(&dir, &sub)?;
        }
    }
    Ok(copied)
}

/// Compares two names the way a reader expects ("2" before "10").
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = NATURAL_CHUNK_REGEX.find_iter(a);
    let mut right = NATURAL_CHUNK_REGEX.find_iter(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let (x, y) = (x.as_str(), y.as_str());
                let is_number = |s: &str| s.starts_with(|c: char| c.is_ascii_digit());
                let order = if is_number(x) && is_number(y) {
                    let (xt, yt) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                    xt.len().cmp(&yt.len()).then_with(|| xt.cmp(yt))
                } else {
                    x.to_lowercase().cmp(&y.to_lowercase())
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

/// Natural ordering of paths by file name.
pub fn natural_path_cmp(a: &Path, b: &Path) -> Ordering {
    let name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    natural_cmp(&name(a), &name(b))
}

/// Lists the visible children of `dir` as `(directories, files)`, both naturally sorted.
pub fn list_entries(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_hidden_file(&path) {
            continue;
        }
        if path.is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }
    dirs.par_sort_by(|a, b| natural_path_cmp(a, b));
    files.par_sort_by(|a, b| natural_path_cmp(a, b));
    Ok((dirs, files))
}

/// Every file below `dir`, depth first, in natural order.
pub fn list_files_recursive(dir: &Path) -> Result<Vec<PathBuf>> {
    let (dirs, mut files) = list_entries(dir)?;
    for sub in dirs {
        files.extend(list_files_recursive(&sub)?);
    }
    Ok(files)
}

/// Total size in bytes of every file below `path` (or of `path` itself).
pub fn directory_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let children = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    children
        .par_iter()
        .map(|child| directory_size(child))
        .sum()
}

#[derive(Debug, PartialEq, Eq)]
enum Level {
    Files,
    Dirs,
}

fn level_of(dir: &Path) -> Result<Level> {
    let (dirs, files) = list_entries(dir)?;
    match (dirs.is_empty(), files.is_empty()) {
        (true, _) => Ok(Level::Files),
        (false, true) => Ok(Level::Dirs),
        (false, false) => Err(Error::UnsupportedTreeShape(format!(
            "files mixed with directories in {:?}",
            dir
        ))),
    }
}

/// Detects the layout of the page tree rooted at `images_dir`.
///
/// Anything that is not uniformly flat, one level or two levels deep is rejected.
pub fn detect_tree_shape(images_dir: &Path) -> Result<TreeShape> {
    let (dirs, files) = list_entries(images_dir)?;
    if dirs.is_empty() {
        if files.is_empty() {
            return Err(Error::EmptySource(images_dir.to_path_buf()));
        }
        return Ok(TreeShape::Flat);
    }
    if !files.is_empty() {
        return Err(Error::UnsupportedTreeShape(format!(
            "files mixed with directories in {:?}",
            images_dir
        )));
    }

    let levels = dirs
        .iter()
        .map(|d| level_of(d))
        .collect::<Result<Vec<_>>>()?;

    if levels.iter().all(|l| *l == Level::Files) {
        return Ok(TreeShape::OneLevel);
    }
    if levels.iter().any(|l| *l == Level::Files) {
        return Err(Error::UnsupportedTreeShape(format!(
            "inconsistent directory depth in {:?}",
            images_dir
        )));
    }

    for dir in &dirs {
        let (children, _) = list_entries(dir)?;
        for child in children {
            if level_of(&child)? != Level::Files {
                return Err(Error::UnsupportedTreeShape(format!(
                    "directory tree deeper than two levels at {:?}",
                    child
                )));
            }
        }
    }
    Ok(TreeShape::TwoLevel)
}
