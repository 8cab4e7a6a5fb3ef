//! Core type definitions for encode requests.
//!
//! [`TargetFormat`] enumerates the containers the encoder can be asked to
//! produce; it is serialized in lowercase so it can be named directly in
//! configuration files. [`SourceDescriptor`] pins down *what* is being
//! encoded and never changes after construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Container format of the encoded output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    /// MPEG-4 Part 14 container.
    #[default]
    Mp4,
    /// Matroska container.
    Mkv,
    /// WebM container.
    Webm,
}

impl TargetFormat {
    /// File extension appended to the source path, always lowercase.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
        }
    }

    /// Whether the container understands the `faststart` muxer flag
    /// (moov atom relocated to the front of the file).
    pub fn supports_faststart(&self) -> bool {
        matches!(self, Self::Mp4)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for TargetFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mp4" | "m4v" => Ok(Self::Mp4),
            "mkv" | "matroska" => Ok(Self::Mkv),
            "webm" => Ok(Self::Webm),
            _ => Err(Error::invalid_input(format!("unknown target format: {s}"))),
        }
    }
}

/// An encode request: the absolute source path and the format to produce.
///
/// The path is made absolute (but not canonicalized) at construction so that
/// every caller naming the same file, from any working directory, derives the
/// same artifacts and the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDescriptor {
    path: PathBuf,
    format: TargetFormat,
}

impl SourceDescriptor {
    /// Create a descriptor, resolving `path` against the current directory.
    ///
    /// The source does not have to exist yet; existence is checked by the
    /// caller at the point where it matters.
    pub fn new(path: impl AsRef<Path>, format: TargetFormat) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_input("empty source path"));
        }

        Ok(Self {
            path: std::path::absolute(path)?,
            format,
        })
    }

    /// Absolute path of the source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Requested output format.
    pub fn format(&self) -> TargetFormat {
        self.format
    }

    /// Whether the source file currently exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.path.display(), self.format)
    }
}
