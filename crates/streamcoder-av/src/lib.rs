//! # streamcoder-av
//!
//! External encoder plumbing for streamcoder.
//!
//! The encoder is treated as a black box: a program that is handed an input
//! path and an output path, appends bytes to the output, and eventually exits.
//! This crate provides:
//! - Tool discovery ([`check_tool`], [`require_tool`], [`resolve_tool`])
//! - Argument templates with `{input}`/`{output}`/`{resolution}` substitution
//!   ([`TemplateContext`], [`default_template`])
//! - Spawning and supervising the encoder process ([`EncoderCommand`],
//!   [`EncoderProcess`])
//!
//! ## Features
//!
//! - `tracing` - Log tool invocations and encoder progress
//!
//! ## Example
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use streamcoder_av::EncoderCommand;
//! use streamcoder_common::TargetFormat;
//!
//! let command = EncoderCommand::new(PathBuf::from("ffmpeg"), "800x450");
//! let mut process = command.spawn(
//!     Path::new("/videos/clip.avi"),
//!     Path::new("/videos/clip.avi.mp4"),
//!     TargetFormat::Mp4,
//! )?;
//! let status = process.wait()?;
//! println!("encoder exited with {status}");
//! # Ok::<(), streamcoder_av::Error>(())
//! ```

pub mod encoder;
mod error;
pub mod template;
pub mod tools;

// Re-exports
pub use encoder::{
    default_template, EncoderCommand, EncoderProcess, StderrMonitor, DEFAULT_RESOLUTION,
};
pub use error::{Error, Result};
pub use template::TemplateContext;
pub use tools::{check_tool, require_tool, resolve_tool, ToolInfo};
