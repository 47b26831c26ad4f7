//! Splitting of a processed page tree into size-bounded volumes.
//!
//! Packing is a single pass over the naturally ordered siblings of the tree: a new volume
//! starts whenever the next unit would push the current one over the target size. The first
//! volume is the workspace itself; every further volume is a `KCC-` temporary directory next
//! to it, so units are moved with plain renames.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::types::{SplitPolicy, TreeShape};
use crate::workspace::{TEMP_PREFIX, Workspace, detect_tree_shape, directory_size, list_entries};

/// Default volume size target.
pub const DEFAULT_TARGET_SIZE: u64 = 400 * 1024 * 1024;
/// Volume size target for long-strip content.
pub const WEBTOON_TARGET_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSplitOptions {
    pub target_size: u64,
    pub policy: SplitPolicy,
}

impl Default for VolumeSplitOptions {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            policy: SplitPolicy::SizeBounded,
        }
    }
}

/// Where a volume lives on disk.
#[derive(Debug)]
pub enum VolumeRoot {
    /// The original workspace directory, owned by the caller.
    Workspace(PathBuf),
    /// A temporary directory removed when the volume is dropped.
    Temporary(TempDir),
}

/// One output unit with its own `OEBPS/Images` tree.
#[derive(Debug)]
pub struct Volume {
    index: usize,
    root: VolumeRoot,
}

impl Volume {
    /// 1-based position of the volume.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn root(&self) -> &Path {
        match &self.root {
            VolumeRoot::Workspace(path) => path,
            VolumeRoot::Temporary(dir) => dir.path(),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root().join(Workspace::images_subdir())
    }

    pub fn is_workspace(&self) -> bool {
        matches!(self.root, VolumeRoot::Workspace(_))
    }

    /// Size of every page in the volume.
    pub fn size(&self) -> Result<u64> {
        directory_size(&self.images_dir())
    }
}

/// A sibling that is moved as a whole.
#[derive(Debug, Clone)]
struct Unit {
    relative: PathBuf,
    size: u64,
}

fn units_of(images: &Path, paths: &[PathBuf]) -> Result<Vec<Unit>> {
    paths
        .iter()
        .map(|path| {
            let relative = path
                .strip_prefix(images)
                .map_err(|_| {
                    Error::InvalidPath(path.clone(), "outside of the page tree".to_string())
                })?
                .to_path_buf();
            Ok(Unit {
                relative,
                size: directory_size(path)?,
            })
        })
        .collect()
}

fn pack(units: Vec<Unit>, target: u64) -> Vec<Vec<Unit>> {
    let mut bins: Vec<Vec<Unit>> = vec![Vec::new()];
    let mut current = 0u64;
    for unit in units {
        let bin_is_empty = bins.last().is_none_or(Vec::is_empty);
        if !bin_is_empty && current + unit.size > target {
            bins.push(Vec::new());
            current = 0;
        }
        current += unit.size;
        if let Some(bin) = bins.last_mut() {
            bin.push(unit);
        }
    }
    bins.retain(|b| !b.is_empty());
    bins
}

/// Groups the tree under `images` into bins of units, without touching the disk.
fn plan(images: &Path, shape: TreeShape, options: &VolumeSplitOptions) -> Result<Vec<Vec<Unit>>> {
    let (dirs, files) = list_entries(images)?;

    if options.policy == SplitPolicy::PerDirectory {
        if shape == TreeShape::Flat {
            return Err(Error::UnsupportedTreeShape(
                "one volume per directory needs a directory tree".to_string(),
            ));
        }
        return Ok(units_of(images, &dirs)?.into_iter().map(|u| vec![u]).collect());
    }

    let units = match shape {
        TreeShape::Flat => units_of(images, &files)?,
        TreeShape::OneLevel => units_of(images, &dirs)?,
        TreeShape::TwoLevel => {
            let mut units = Vec::new();
            for top in units_of(images, &dirs)? {
                if top.size > options.target_size {
                    let (children, _) = list_entries(&images.join(&top.relative))?;
                    log::debug!(
                        "Splitting {:?} ({} bytes) by its {} subdirectories",
                        top.relative,
                        top.size,
                        children.len()
                    );
                    units.extend(units_of(images, &children)?);
                } else {
                    units.push(top);
                }
            }
            units
        }
    };
    Ok(pack(units, options.target_size))
}

fn prune_empty_dirs(dir: &Path) -> Result<()> {
    let (children, _) = list_entries(dir)?;
    for child in &children {
        prune_empty_dirs(child)?;
        if fs::read_dir(child)?.next().is_none() {
            fs::remove_dir(child)?;
        }
    }
    Ok(())
}

/// Splits the processed tree of `workspace` into volumes.
///
/// The first returned volume always is the workspace path itself.
pub fn split_volumes(workspace: &Workspace, options: &VolumeSplitOptions) -> Result<Vec<Volume>> {
    if options.target_size == 0 {
        return Err(Error::Other("Volume target size must be positive".to_string()));
    }
    let images = workspace.images_dir();
    let shape = detect_tree_shape(&images)?;
    let bins = plan(&images, shape, options)?;
    log::info!("Splitting {:?} tree into {} volume(s)", shape, bins.len());

    let parent = workspace
        .root()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workspace.root().to_path_buf());

    let mut volumes = vec![Volume {
        index: 0,
        root: VolumeRoot::Workspace(workspace.root().to_path_buf()),
    }];

    for (index, bin) in bins.into_iter().enumerate().skip(1) {
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&parent)?;
        let target_images = dir.path().join(Workspace::images_subdir());
        fs::create_dir_all(&target_images)?;

        for unit in bin {
            let target = target_images.join(&unit.relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(images.join(&unit.relative), &target)?;
        }
        volumes.push(Volume {
            index,
            root: VolumeRoot::Temporary(dir),
        });
    }

    if volumes.len() > 1 {
        prune_empty_dirs(&images)?;
    }
    Ok(volumes)
}
