//! Naming rules for job outputs and workspace entries.

use crate::error::{Error, Result};

use std::path::{Component, Path, PathBuf};

/// Characters that break zip entry names or Windows file systems.
const RESERVED: [char; 6] = ['<', '>', '"', '|', '?', '*'];

/// Longest single component most file systems accept, in bytes.
const MAX_COMPONENT_LEN: usize = 255;

/// File name of `path`, or `"unknown"` when it has none.
pub fn get_file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rejects target and output paths that cannot be written portably.
///
/// A path fails with [`Error::InvalidPath`] when it contains a reserved character, and with
/// [`Error::PathTooLong`] when one of its components exceeds 255 bytes.
pub fn validate_path(path: &Path) -> Result<()> {
    for component in path.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let part = part.to_string_lossy();
        if part.chars().any(|c| RESERVED.contains(&c)) {
            return Err(Error::InvalidPath(
                path.to_path_buf(),
                format!("'{part}' contains a reserved character"),
            ));
        }
        if part.len() > MAX_COMPONENT_LEN {
            return Err(Error::PathTooLong(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Validates an output file path and creates its parent directory.
pub fn prepare_output_file(path: &Path) -> Result<PathBuf> {
    validate_path(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path.to_path_buf())
}

/// Dot files are dropped from a workspace before rendering.
pub fn is_hidden_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Turns a title into a single path component.
///
/// Reserved characters and separators become `-`, control characters `_`, and surrounding
/// whitespace is trimmed so volume names never start or end with a blank.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .trim()
        .chars()
        .map(|c| match c {
            c if RESERVED.contains(&c) => '-',
            ':' | '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// First free output path in `dir` for `base.extension`.
///
/// An existing file is never overwritten: `base_kcc1.extension`, `base_kcc2.extension`, ...
/// are tried in turn.
pub fn unique_output_path(dir: &Path, base: &str, extension: &str) -> PathBuf {
    let base = sanitize_filename(base);
    let mut candidate = dir.join(format!("{base}.{extension}"));
    let mut counter = 0usize;
    while candidate.exists() {
        counter += 1;
        candidate = dir.join(format!("{base}_kcc{counter}.{extension}"));
    }
    candidate
}
