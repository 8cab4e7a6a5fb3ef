//! Error type for the streaming transcoder.
//!
//! Every failure a consumer can observe funnels into [`Error`]. Because
//! [`GrowingFileStream`](super::GrowingFileStream) implements the standard
//! `Read`/`Seek` traits, the error also converts into [`std::io::Error`] with a
//! matching [`std::io::ErrorKind`], and converts back via
//! [`Error::from_io`] without losing the original variant.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Unified error type for opening, reading, and tearing down a stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source file does not exist and no reusable output was found.
    #[error("source not found: {}", path.display())]
    SourceNotFound {
        /// Absolute path that was looked up.
        path: PathBuf,
    },

    /// The encoder terminated abnormally, or the encode it was producing
    /// disappeared.
    #[error("transcode failed for {}: {reason}", source_path.display())]
    TranscodeFailed {
        /// Absolute source path of the failed encode.
        source_path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// The operation is not supported on a read-only stream.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A bounded wait ran out.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A blocked read or seek was cancelled through a cancel handle.
    #[error("operation cancelled")]
    Cancelled,

    /// Seek target lies beyond the end of a completed output.
    #[error("seek to {target} is past the end of the output ({length} bytes)")]
    SeekOutOfRange {
        /// Requested absolute position.
        target: u64,
        /// Final output length.
        length: u64,
    },

    /// Seek target is negative or overflows.
    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    /// A lock file could not be opened or locked.
    #[error("lock error on {}: {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// The encoder could not be located or launched.
    #[error(transparent)]
    Encoder(#[from] streamcoder_av::Error),

    /// Invalid source descriptor or artifact failure.
    #[error(transparent)]
    Common(#[from] streamcoder_common::Error),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Convenience constructor for [`Error::TranscodeFailed`].
    pub fn transcode_failed(source_path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::TranscodeFailed {
            source_path: source_path.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::Lock`].
    pub fn lock(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Lock {
            path: path.into(),
            source,
        }
    }

    /// Recover an [`Error`] from an [`io::Error`] produced by the `Read`/`Seek`
    /// impls; plain I/O errors become [`Error::Io`].
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_none() {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(ours) => *ours,
                Err(other) => Error::Io(io::Error::new(kind, other)),
            },
            None => Error::Io(io::Error::from(kind)),
        }
    }

    /// The [`io::ErrorKind`] this error maps to.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::SourceNotFound { .. } => io::ErrorKind::NotFound,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            Error::Timeout { .. } => io::ErrorKind::TimedOut,
            Error::SeekOutOfRange { .. } | Error::InvalidSeek(_) => io::ErrorKind::InvalidInput,
            Error::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
