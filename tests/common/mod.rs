//! Shared test harness for integration tests.
//!
//! Provides [`Workspace`], a temp directory holding a source file, a lock
//! directory and a fake encoder. The fake encoder is a POSIX shell script that
//! appends numbered fixed-size chunks to its last argument (the output path)
//! and records every launch in a counter file, so tests can assert how many
//! encoders actually ran.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use streamcoder::{CoderSettings, OutputArtifact, SourceDescriptor, TargetFormat};
use streamcoder_av::{EncoderCommand, DEFAULT_RESOLUTION};
use tempfile::TempDir;

/// Size of one chunk written by the fake encoder.
pub const CHUNK_LEN: u64 = 28;

/// Behaviour of the fake encoder.
#[derive(Debug, Clone)]
pub struct FakeEncoder {
    /// Number of chunks to append.
    pub chunks: u32,
    /// Pause after each chunk.
    pub delay: Duration,
    /// Exit status once done.
    pub exit_code: i32,
    /// Block forever after the last chunk instead of exiting.
    pub stall: bool,
}

impl Default for FakeEncoder {
    fn default() -> Self {
        Self {
            chunks: 20,
            delay: Duration::from_millis(10),
            exit_code: 0,
            stall: false,
        }
    }
}

impl FakeEncoder {
    pub fn chunks(mut self, chunks: u32) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    fn script(&self, counter: &Path) -> String {
        let mut script = format!(
            "#!/bin/sh\n\
             for last; do :; done\n\
             echo launch >> '{counter}'\n\
             i=0\n\
             while [ \"$i\" -lt {chunks} ]; do\n\
             \x20 printf 'chunk-%04d:0123456789abcdef\\n' \"$i\" >> \"$last\"\n\
             \x20 i=$((i + 1))\n\
             \x20 sleep {delay} 2>/dev/null || sleep 1\n\
             done\n",
            counter = counter.display(),
            chunks = self.chunks,
            delay = self.delay.as_secs_f64(),
        );
        if self.stall {
            script.push_str("exec sleep 600\n");
        }
        if self.exit_code != 0 {
            script.push_str("echo 'fake encoder failing' >&2\n");
        }
        script.push_str(&format!("exit {}\n", self.exit_code));
        script
    }

    /// Bytes a complete run produces.
    pub fn expected_output(&self) -> Vec<u8> {
        (0..self.chunks)
            .flat_map(|i| format!("chunk-{:04}:0123456789abcdef\n", i).into_bytes())
            .collect()
    }

    /// Final output length of a complete run.
    pub fn expected_len(&self) -> u64 {
        self.chunks as u64 * CHUNK_LEN
    }
}

/// Isolated directory with a source file and a fake encoder.
pub struct Workspace {
    pub dir: TempDir,
    pub source: PathBuf,
    pub lock_dir: PathBuf,
    script: PathBuf,
    counter: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let source = dir.path().join("clip.avi");
        fs::write(&source, b"RIFF fake source").expect("failed to write source");
        let lock_dir = dir.path().join("locks");
        let script = dir.path().join("fake-encoder.sh");
        let counter = dir.path().join("launches.log");
        Self {
            dir,
            source,
            lock_dir,
            script,
            counter,
        }
    }

    /// Write the fake encoder script and return its path.
    pub fn install(&self, encoder: &FakeEncoder) -> PathBuf {
        fs::write(&self.script, encoder.script(&self.counter)).expect("failed to write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.script, fs::Permissions::from_mode(0o755))
                .expect("failed to chmod script");
        }
        self.script.clone()
    }

    /// Settings that launch `encoder` and keep locks inside the workspace.
    pub fn settings(&self, encoder: &FakeEncoder) -> CoderSettings {
        let program = self.install(encoder);
        CoderSettings::default()
            .with_encoder(EncoderCommand::new(program, DEFAULT_RESOLUTION))
            .with_lock_dir(&self.lock_dir)
    }

    pub fn shared_settings(&self, encoder: &FakeEncoder) -> Arc<CoderSettings> {
        Arc::new(self.settings(encoder))
    }

    /// Write a config file pointing the CLI at `encoder`.
    pub fn config_file(&self, encoder: &FakeEncoder) -> PathBuf {
        let program = self.install(encoder);
        let path = self.dir.path().join("streamcoder.toml");
        let content = format!(
            "[encoder]\nprogram = '{}'\n\n[locks]\ndir = '{}'\n",
            program.display(),
            self.lock_dir.display()
        );
        fs::write(&path, content).expect("failed to write config");
        path
    }

    /// How many times the fake encoder was started.
    pub fn launches(&self) -> usize {
        fs::read_to_string(&self.counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn artifact(&self) -> OutputArtifact {
        let descriptor = SourceDescriptor::new(&self.source, TargetFormat::Mp4)
            .expect("failed to build descriptor");
        OutputArtifact::for_source(&descriptor)
    }
}
