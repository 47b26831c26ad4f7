//! Custom error types and result handling for Shuppan operations.
//!
//! All operations return a [`Result<T>`] which is a type alias for `std::result::Result<T, Error>`.
//! Errors are grouped by [`Severity`] so callers can tell "abort this job" apart from
//! "the container would be corrupt" and from conditions that only skip an optional step.
//!
use std::path::PathBuf;

/// Type alias for Results with Shuppan errors.
pub type Result<T> = std::result::Result<T, Error>;

/// How a caller is expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// Abort the current job only and show the message to the user.
    Recoverable,
    /// Abort the job and discard all temporary state; never deliver partial output.
    Fatal,
    /// The optional step had nothing to do; keep going with the unmodified input.
    Fallback,
}

/// Comprehensive error type for all Shuppan operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O errors from the standard library
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Image decoding/encoding errors
    #[error(transparent)]
    Image(#[from] image::ImageError),
    /// EPUB generation errors
    #[error(transparent)]
    Epub(#[from] epub_builder::Error),
    /// ZIP file operation errors
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// Async task join errors
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error(transparent)]
    ConfigBuilder(#[from] crate::shuppan::ShuppanConfigBuilderError),

    /// The processed page tree has a layout the volume splitter refuses to guess about.
    #[error("Unsupported directory structure: {0}")]
    UnsupportedTreeShape(String),
    /// The workspace contains no images.
    #[error("Source directory is empty: {0:?}")]
    EmptySource(PathBuf),
    /// The path exceeds what the platform can address without long-path support.
    #[error("Path is too long: {0:?}")]
    PathTooLong(PathBuf),
    /// The job was cancelled through the progress interface.
    #[error("Conversion interrupted.")]
    Cancelled,
    /// A source image failed the integrity pre-pass.
    #[error("Image file {0:?} is corrupted: {1}")]
    CorruptedImage(PathBuf, String),
    /// A page worker returned a failure (or panicked).
    #[error("One of workers crashed. Cause: {message}")]
    WorkerFailed { message: String, trace: String },

    /// A section-table operation would produce an inconsistent database.
    #[error("PDB consistency error: {0}")]
    PdbInvariant(String),
    /// The file is not a Mobipocket container this crate understands.
    #[error("Invalid Mobipocket container: {0}")]
    InvalidContainer(String),
    /// The container carries no SRCS block to strip.
    #[error("File doesn't contain the sources section.")]
    MissingSourceBlock,
    /// An in-place metadata patch would change the record-0 length.
    #[error("Dual metadata fix failed: {0}")]
    DualMetaFix(String),
    /// The external Kindle compiler failed.
    #[error("Kindle compiler failed: {0}")]
    MobiCompiler(String),

    /// Error for invalid file or directory paths
    #[error("The given path '{0:?}' is invalid: {1}")]
    InvalidPath(PathBuf, String),
    /// Error for unsupported operations or formats (e.g., unknown image extension)
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Error for resources that couldn't be found (e.g., workspace directory)
    #[error("Not found: {0}")]
    NotFound(String),
    /// Other errors that don't fit into specific categories
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Classifies the error for the caller.
    pub fn severity(&self) -> Severity {
        match self {
            Error::MissingSourceBlock => Severity::Fallback,
            Error::UnsupportedTreeShape(_)
            | Error::EmptySource(_)
            | Error::PathTooLong(_)
            | Error::Cancelled
            | Error::InvalidPath(..)
            | Error::Unsupported(_)
            | Error::NotFound(_)
            | Error::ConfigBuilder(_) => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    /// Shorthand for `severity() == Severity::Fatal`.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

// Basic From<String> conversion for convenience
impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Other(error)
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Error::Other(error.to_string())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
