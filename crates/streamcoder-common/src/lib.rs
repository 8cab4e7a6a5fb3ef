//! Streamcoder-Common: Shared types, path conventions, and errors.
//!
//! This crate provides the pieces every other streamcoder crate agrees on:
//!
//! - **Core Types**: [`TargetFormat`] and the immutable [`SourceDescriptor`]
//! - **Path Utilities**: the [`OutputArtifact`] naming convention
//!   (`<source>.<format>` plus the `<output>.tran` marker)
//! - **Error Handling**: Common error types and result aliases
//!
//! # Examples
//!
//! ```
//! use streamcoder_common::{OutputArtifact, SourceDescriptor, TargetFormat};
//!
//! let source = SourceDescriptor::new("/videos/clip.avi", TargetFormat::Mp4)?;
//! let artifact = OutputArtifact::for_source(&source);
//!
//! assert!(artifact.output().ends_with("clip.avi.mp4"));
//! assert!(artifact.marker().ends_with("clip.avi.mp4.tran"));
//! # Ok::<(), streamcoder_common::Error>(())
//! ```

pub mod error;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use paths::OutputArtifact;
pub use types::*;
