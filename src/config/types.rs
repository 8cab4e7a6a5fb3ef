use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use streamcoder_av::{resolve_tool, EncoderCommand, DEFAULT_RESOLUTION};
use streamcoder_common::TargetFormat;

use crate::coder::{default_lock_dir, CoderSettings, StaleMarkerPolicy};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub locks: LocksConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    /// Encoder executable; a bare name is looked up on PATH
    #[serde(default = "default_program")]
    pub program: String,

    /// Target resolution, `WIDTHxHEIGHT`
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Pass `-movflags faststart` for MP4 output
    #[serde(default = "default_true")]
    pub faststart: bool,

    /// Full argument template; replaces the built-in one when set
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_resolution() -> String {
    DEFAULT_RESOLUTION.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            resolution: default_resolution(),
            faststart: true,
            args: None,
        }
    }
}

impl EncoderConfig {
    /// Resolve the program to a path, falling back to the configured string
    /// so a missing encoder is reported when it is first launched.
    pub fn program_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.program).to_string();
        resolve_tool(Path::new(&expanded)).unwrap_or_else(|_| PathBuf::from(expanded))
    }

    /// Argument template to use, if not the built-in one.
    pub fn template(&self) -> Option<Vec<String>> {
        if let Some(args) = &self.args {
            return Some(args.clone());
        }
        if self.faststart {
            return None;
        }
        Some(
            ["-i", "{input}", "-s", "{resolution}", "{output}"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }

    pub fn command(&self) -> EncoderCommand {
        let command = EncoderCommand::new(self.program_path(), self.resolution.clone());
        match self.template() {
            Some(template) => command.with_template(template),
            None => command,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub format: TargetFormat,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// 0 waits indefinitely
    #[serde(default)]
    pub read_timeout_secs: u64,

    /// 0 waits indefinitely
    #[serde(default)]
    pub startup_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: TargetFormat::default(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_secs: 0,
            startup_timeout_secs: 0,
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocksConfig {
    /// Lock file directory; defaults to a directory under the system temp dir
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub stale_marker: StaleMarkerPolicy,
}

impl LocksConfig {
    pub fn dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).as_ref()),
            None => default_lock_dir(),
        }
    }
}

impl Config {
    /// Runtime settings for opening streams.
    pub fn coder_settings(&self) -> CoderSettings {
        CoderSettings::default()
            .with_encoder(self.encoder.command())
            .with_poll_interval(Duration::from_millis(self.stream.poll_interval_ms))
            .with_read_timeout(optional_secs(self.stream.read_timeout_secs))
            .with_startup_timeout(optional_secs(self.stream.startup_timeout_secs))
            .with_lock_dir(self.locks.dir())
            .with_stale_marker(self.locks.stale_marker)
    }
}
