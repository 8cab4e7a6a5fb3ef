//! Artifact path conventions.
//!
//! An encode of `<source>` into format `fmt` writes `<source>.<fmt>` and keeps
//! a zero-byte marker at `<source>.<fmt>.tran` for as long as the encode is in
//! flight. A marker that outlives its encoder is the sign of a crashed run.
//! Everything here is derived from filesystem presence only, so the state
//! survives process restarts.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{SourceDescriptor, TargetFormat};

/// Extension of the in-progress marker file.
pub const MARKER_EXTENSION: &str = "tran";

/// Append `.ext` to the full file name (`clip.avi` -> `clip.avi.mp4`).
fn with_appended_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Output path for encoding `source` into `format`.
pub fn output_path_for(source: &Path, format: TargetFormat) -> PathBuf {
    with_appended_extension(source, format.extension())
}

/// Marker path belonging to an output path.
pub fn marker_path_for(output: &Path) -> PathBuf {
    with_appended_extension(output, MARKER_EXTENSION)
}

/// Remove a file, treating "already gone" as success.
fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// The pair of files an encode produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    output: PathBuf,
    marker: PathBuf,
}

impl OutputArtifact {
    /// Derive the artifact paths for a source descriptor.
    pub fn for_source(source: &SourceDescriptor) -> Self {
        let output = output_path_for(source.path(), source.format());
        let marker = marker_path_for(&output);
        Self { output, marker }
    }

    /// Path of the encoded output.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Path of the in-progress marker.
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Whether the output file exists.
    pub fn has_output(&self) -> bool {
        self.output.exists()
    }

    /// Whether the marker file exists.
    pub fn has_marker(&self) -> bool {
        self.marker.exists()
    }

    /// Output exists and no marker: the encode finished and may be reused.
    pub fn is_complete(&self) -> bool {
        self.has_output() && !self.has_marker()
    }

    /// Neither file exists: nothing was produced, or it was discarded.
    pub fn is_absent(&self) -> bool {
        !self.has_output() && !self.has_marker()
    }

    /// Create the zero-byte marker, truncating one that already exists.
    pub fn create_marker(&self) -> io::Result<()> {
        fs::File::create(&self.marker).map(drop)
    }

    /// Remove the marker. Returns whether a file was removed.
    pub fn remove_marker(&self) -> io::Result<bool> {
        remove_if_present(&self.marker)
    }

    /// Remove the output. Returns whether a file was removed.
    pub fn remove_output(&self) -> io::Result<bool> {
        remove_if_present(&self.output)
    }

    /// Remove both files. The output goes first so that the pair never looks
    /// complete halfway through.
    pub fn discard(&self) -> io::Result<()> {
        self.remove_output()?;
        self.remove_marker()?;
        Ok(())
    }
}
