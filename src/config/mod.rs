mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./streamcoder.toml",
        "~/.config/streamcoder/config.toml",
        "/etc/streamcoder/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {}", path.display());
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.stream.poll_interval_ms == 0 {
        anyhow::bail!("stream.poll_interval_ms cannot be 0");
    }

    if !is_resolution(&config.encoder.resolution) {
        anyhow::bail!(
            "encoder.resolution must look like WIDTHxHEIGHT, got {:?}",
            config.encoder.resolution
        );
    }

    if config.encoder.program.trim().is_empty() {
        anyhow::bail!("encoder.program cannot be empty");
    }

    if let Some(args) = &config.encoder.args {
        streamcoder_av::template::validate_template(args).context("Invalid encoder.args")?;
    }

    if let Some(dir) = &config.locks.dir {
        if dir.is_file() {
            anyhow::bail!("locks.dir {:?} is a file", dir);
        }
    }

    Ok(())
}

fn is_resolution(value: &str) -> bool {
    let Some((w, h)) = value.split_once('x') else {
        return false;
    };
    let positive = |s: &str| s.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    positive(w) && positive(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coder::StaleMarkerPolicy;
    use std::path::PathBuf;
    use std::time::Duration;
    use streamcoder_common::TargetFormat;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.encoder.resolution, "800x450");
        assert!(config.encoder.faststart);
        assert_eq!(config.stream.format, TargetFormat::Mp4);
        assert_eq!(config.stream.poll_interval_ms, 5);
        assert_eq!(config.locks.stale_marker, StaleMarkerPolicy::Restart);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn full_file_resolves_settings() {
        let config = parse(
            r#"
            [encoder]
            program = "/opt/encoder/bin/ffmpeg"
            resolution = "1280x720"

            [stream]
            format = "mkv"
            poll_interval_ms = 20
            read_timeout_secs = 30

            [locks]
            dir = "/var/lock/streamcoder"
            stale_marker = "fail"
            "#,
        );
        assert!(validate_config(&config).is_ok());

        let settings = config.coder_settings();
        assert_eq!(settings.encoder.resolution(), "1280x720");
        assert_eq!(settings.encoder.program(), Path::new("/opt/encoder/bin/ffmpeg"));
        assert_eq!(settings.poll_interval, Duration::from_millis(20));
        assert_eq!(settings.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.startup_timeout, None);
        assert_eq!(settings.lock_dir, PathBuf::from("/var/lock/streamcoder"));
        assert_eq!(settings.stale_marker, StaleMarkerPolicy::Fail);
        assert_eq!(config.stream.format, TargetFormat::Mkv);
    }

    #[test]
    fn faststart_can_be_disabled() {
        let config = parse("[encoder]\nfaststart = false\n");
        let args = config.encoder.command().args_for(
            Path::new("/v/a.avi"),
            Path::new("/v/a.avi.mp4"),
            TargetFormat::Mp4,
        );
        assert_eq!(args, vec!["-i", "/v/a.avi", "-s", "800x450", "/v/a.avi.mp4"]);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let config = parse("[stream]\npoll_interval_ms = 0\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn rejects_bad_resolution() {
        for bad in ["800", "800x", "x450", "0x450", "wide x tall"] {
            let mut config = Config::default();
            config.encoder.resolution = bad.to_string();
            assert!(validate_config(&config).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_template_without_output() {
        let config = parse("[encoder]\nargs = [\"-i\", \"{input}\"]\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamcoder.toml");
        std::fs::write(&path, "[stream]\nformat = \"webm\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.stream.format, TargetFormat::Webm);

        let config = load_config_or_default(Some(&path)).unwrap();
        assert_eq!(config.stream.format, TargetFormat::Webm);
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[stream\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
