//! Streamcoder - read the encoded form of a media file while it is still
//! being encoded.
//!
//! [`GrowingFileStream::open`] starts (or joins, or reuses) the encode of a
//! source and returns a blocking `Read` + `Seek` stream over its output. At
//! most one encoder runs per source across all processes on the machine.
//!
//! This library crate also exposes the configuration loader used by the
//! `streamcoder` binary.

pub mod coder;
pub mod config;

pub use coder::{
    CancelHandle, CoderSettings, Error, GrowingFileStream, Origin, Result, StaleMarkerPolicy,
    WorkerState,
};
pub use streamcoder_common::{OutputArtifact, SourceDescriptor, TargetFormat};
