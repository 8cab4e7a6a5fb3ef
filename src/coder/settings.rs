//! Runtime settings for opening streams.
//!
//! [`CoderSettings`] is the resolved, ready-to-use form of the `[encoder]`,
//! `[stream]` and `[locks]` configuration sections. Library users can build it
//! directly; the CLI derives it from [`crate::config::Config`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use streamcoder_av::{EncoderCommand, DEFAULT_RESOLUTION};

/// Default interval between two filesystem polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What to do with a marker left behind by an encoder that is no longer running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleMarkerPolicy {
    /// Delete the marker and any partial output, then encode from scratch.
    #[default]
    Restart,
    /// Delete the leftovers and fail this open; the next open starts clean.
    Fail,
}

/// Directory for lock files when none is configured.
pub fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("streamcoder-locks")
}

/// Settings shared by every stream opened with them.
#[derive(Debug, Clone)]
pub struct CoderSettings {
    /// How to launch the encoder.
    pub encoder: EncoderCommand,
    /// Interval between filesystem polls while waiting for data.
    pub poll_interval: Duration,
    /// Upper bound on a single blocked read or seek. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Upper bound on waiting for the output to first appear. `None` waits
    /// forever.
    pub startup_timeout: Option<Duration>,
    /// Directory holding the per-source lock files.
    pub lock_dir: PathBuf,
    /// Handling of markers orphaned by a crashed encode.
    pub stale_marker: StaleMarkerPolicy,
}

impl Default for CoderSettings {
    fn default() -> Self {
        Self {
            encoder: EncoderCommand::new(PathBuf::from("ffmpeg"), DEFAULT_RESOLUTION),
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: None,
            startup_timeout: None,
            lock_dir: default_lock_dir(),
            stale_marker: StaleMarkerPolicy::default(),
        }
    }
}

impl CoderSettings {
    /// Use a different encoder command.
    pub fn with_encoder(mut self, encoder: EncoderCommand) -> Self {
        self.encoder = encoder;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound blocked reads and seeks.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Bound the wait for the output to first appear.
    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Keep lock files in `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Choose the stale marker policy.
    pub fn with_stale_marker(mut self, policy: StaleMarkerPolicy) -> Self {
        self.stale_marker = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = CoderSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(5));
        assert!(settings.read_timeout.is_none());
        assert!(settings.startup_timeout.is_none());
        assert_eq!(settings.stale_marker, StaleMarkerPolicy::Restart);
        assert_eq!(settings.encoder.resolution(), "800x450");
        assert!(settings.lock_dir.ends_with("streamcoder-locks"));
    }

    #[test]
    fn builders_override() {
        let settings = CoderSettings::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_read_timeout(Some(Duration::from_secs(1)))
            .with_lock_dir("/tmp/locks")
            .with_stale_marker(StaleMarkerPolicy::Fail);
        assert_eq!(settings.poll_interval, Duration::from_millis(20));
        assert_eq!(settings.read_timeout, Some(Duration::from_secs(1)));
        assert_eq!(settings.lock_dir, PathBuf::from("/tmp/locks"));
        assert_eq!(settings.stale_marker, StaleMarkerPolicy::Fail);
    }
}
