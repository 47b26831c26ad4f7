//! Invocation of the external Kindle compiler (EPUB → combo `.mobi`).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Turns an EPUB into a Mobipocket file next to it.
#[async_trait]
pub trait MobiCompiler: Send + Sync {
    /// Compiles `epub` and returns the path of the produced `.mobi`.
    async fn compile(&self, epub: &Path) -> Result<PathBuf>;
}

/// Runs a `kindlegen`-compatible binary.
#[derive(Debug, Clone)]
pub struct KindleGen {
    pub binary: PathBuf,
}

impl Default for KindleGen {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kindlegen"),
        }
    }
}

impl KindleGen {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MobiCompiler for KindleGen {
    async fn compile(&self, epub: &Path) -> Result<PathBuf> {
        let output = Command::new(&self.binary)
            .arg("-dont_append_source")
            .arg("-locale")
            .arg("en")
            .arg(epub)
            .output()
            .await
            .map_err(|e| Error::MobiCompiler(format!("cannot run {:?}: {e}", self.binary)))?;

        let mobi = epub.with_extension("mobi");
        // Exit code 1 means "built with warnings".
        let accepted = matches!(output.status.code(), Some(0) | Some(1));
        if !accepted || !mobi.is_file() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let reason = stdout
                .lines()
                .find(|l| l.contains("Error("))
                .unwrap_or("no output file produced");
            return Err(Error::MobiCompiler(format!(
                "{:?} failed ({}): {reason}",
                epub, output.status
            )));
        }

        log::info!("Compiled {:?} into {:?}", epub, mobi);
        Ok(mobi)
    }
}
