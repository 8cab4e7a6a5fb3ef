//! Encoder process spawning and supervision.
//!
//! The encoder is launched once per encode with a fixed argument template and
//! runs detached from the caller: stdin and stdout are closed, stderr is
//! drained by a monitor thread so the pipe never fills up. The monitor logs
//! progress lines and remembers the last diagnostic line so a failed encode can
//! report *why* it failed.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
#[cfg(feature = "tracing")]
use std::time::{Duration, Instant};

use streamcoder_common::TargetFormat;

use crate::template::TemplateContext;
use crate::{Error, Result};

/// Resolution passed to the encoder unless configured otherwise.
pub const DEFAULT_RESOLUTION: &str = "800x450";

/// Minimum spacing between two logged progress lines.
#[cfg(feature = "tracing")]
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// The stock argument template: input, fixed resolution, fast-start (MP4 only),
/// output.
pub fn default_template(format: TargetFormat) -> Vec<String> {
    let mut args = vec!["-i", "{input}", "-s", "{resolution}"];
    if format.supports_faststart() {
        args.extend(["-movflags", "faststart"]);
    }
    args.push("{output}");
    args.into_iter().map(String::from).collect()
}

/// How to launch the encoder.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    program: PathBuf,
    resolution: String,
    template: Option<Vec<String>>,
}

impl EncoderCommand {
    /// Create a command using the default argument template.
    pub fn new(program: PathBuf, resolution: impl Into<String>) -> Self {
        Self {
            program,
            resolution: resolution.into(),
            template: None,
        }
    }

    /// Replace the default argument template.
    pub fn with_template(mut self, template: Vec<String>) -> Self {
        self.template = Some(template);
        self
    }

    /// Path of the encoder executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Target resolution substituted for `{resolution}`.
    pub fn resolution(&self) -> &str {
        &self.resolution
    }

    /// Concrete arguments for one encode.
    pub fn args_for(&self, input: &Path, output: &Path, format: TargetFormat) -> Vec<String> {
        let ctx = TemplateContext::new().with_encode(input, output, &self.resolution, format);
        match &self.template {
            Some(template) => ctx.substitute_all(template),
            None => ctx.substitute_all(&default_template(format)),
        }
    }

    /// Launch the encoder for `input` -> `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolNotFound`] if the program does not exist, and
    /// [`Error::Io`] for any other spawn failure.
    pub fn spawn(&self, input: &Path, output: &Path, format: TargetFormat) -> Result<EncoderProcess> {
        let args = self.args_for(input, output, format);
        let label = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string());

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawning encoder {}: {:?}", self.program.display(), args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::tool_not_found(self.program.display().to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        let monitor = match child.stderr.take() {
            Some(stderr) => Some(spawn_monitor(stderr, label.clone())?),
            None => None,
        };

        #[cfg(feature = "tracing")]
        tracing::info!("Encoder {} started (pid {})", label, child.id());

        Ok(EncoderProcess {
            child,
            label,
            monitor,
            exited: None,
        })
    }
}

/// A running (or finished) encoder subprocess.
///
/// Dropping a process that is still running kills it; an encoder is never left
/// writing to an output nobody supervises.
#[derive(Debug)]
pub struct EncoderProcess {
    child: Child,
    label: String,
    monitor: Option<StderrMonitor>,
    exited: Option<ExitStatus>,
}

impl EncoderProcess {
    /// OS process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Short name of the encoder program, for messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Poll for exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exited {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        self.exited = status;
        Ok(status)
    }

    /// Block until the encoder exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.exited = Some(status);
        Ok(status)
    }

    /// Forcibly terminate the encoder and reap it.
    ///
    /// The stderr monitor is detached rather than joined: grandchildren of the
    /// encoder may still hold the pipe open.
    pub fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Killing encoder {} (pid {})", self.label, self.child.id());

        if let Err(e) = self.child.kill() {
            // InvalidInput means the process already exited on its own.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(Error::tool_failed(&self.label, format!("failed to kill: {e}")));
            }
        }
        self.monitor = None;
        self.wait()
    }

    /// Hand over the stderr monitor once the encoder has exited.
    ///
    /// Joining it may block for as long as a descendant of the encoder keeps
    /// stderr open, so callers holding a lock should take it out first and
    /// join after releasing.
    pub fn take_monitor(&mut self) -> Option<StderrMonitor> {
        self.exited?;
        self.monitor.take()
    }

    /// Last diagnostic line the encoder printed on stderr, once it has exited.
    ///
    /// Returns `None` while the encoder is still running or when nothing was
    /// printed.
    pub fn diagnostic(&mut self) -> Option<String> {
        self.take_monitor().and_then(StderrMonitor::join)
    }
}

/// The thread draining one encoder's stderr.
#[derive(Debug)]
pub struct StderrMonitor(JoinHandle<Option<String>>);

impl StderrMonitor {
    /// Wait for stderr to close and return the last diagnostic line.
    pub fn join(self) -> Option<String> {
        self.0.join().ok().flatten()
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(None)) {
            let _ = self.kill();
        }
    }
}

fn spawn_monitor(stderr: ChildStderr, label: String) -> Result<StderrMonitor> {
    let handle = thread::Builder::new()
        .name(format!("{label}-stderr"))
        .spawn(move || monitor_stderr(stderr, &label))?;
    Ok(StderrMonitor(handle))
}

/// Drain encoder stderr until EOF, returning the last non-progress line.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn monitor_stderr(stderr: impl Read, label: &str) -> Option<String> {
    let reader = BufReader::new(stderr);
    let mut last_diagnostic = None;
    #[cfg(feature = "tracing")]
    let mut last_progress_log: Option<Instant> = None;

    // ffmpeg rewrites its progress line with carriage returns.
    for chunk in reader.split(b'\r') {
        let Ok(chunk) = chunk else { break };
        let text = String::from_utf8_lossy(&chunk);

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if is_progress_line(line) {
                #[cfg(feature = "tracing")]
                {
                    let due = last_progress_log.map_or(true, |t| t.elapsed() >= PROGRESS_LOG_INTERVAL);
                    if due {
                        tracing::debug!(
                            "{} | time: {} | bitrate: {} | speed: {}",
                            label,
                            extract_value(line, "time=").unwrap_or_else(|| "??".to_string()),
                            extract_value(line, "bitrate=").unwrap_or_else(|| "N/A".to_string()),
                            extract_value(line, "speed=").unwrap_or_else(|| "??".to_string()),
                        );
                        last_progress_log = Some(Instant::now());
                    }
                }
            } else {
                #[cfg(feature = "tracing")]
                tracing::trace!("{} stderr: {}", label, line);
                last_diagnostic = Some(line.to_string());
            }
        }
    }

    last_diagnostic
}

fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

/// Value following `key` in an ffmpeg progress line, up to the next whitespace.
#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let value = line[start + key.len()..].trim_start();
    let end = value.find(char::is_whitespace).unwrap_or(value.len());
    Some(value[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_mp4() {
        let cmd = EncoderCommand::new(PathBuf::from("ffmpeg"), DEFAULT_RESOLUTION);
        let args = cmd.args_for(
            Path::new("/videos/clip.avi"),
            Path::new("/videos/clip.avi.mp4"),
            TargetFormat::Mp4,
        );
        assert_eq!(
            args,
            vec![
                "-i",
                "/videos/clip.avi",
                "-s",
                "800x450",
                "-movflags",
                "faststart",
                "/videos/clip.avi.mp4",
            ]
        );
    }

    #[test]
    fn test_default_template_skips_faststart_for_mkv() {
        let args = default_template(TargetFormat::Mkv);
        assert!(!args.iter().any(|a| a == "faststart"));
        assert_eq!(args.last().map(String::as_str), Some("{output}"));
    }

    #[test]
    fn test_custom_template() {
        let cmd = EncoderCommand::new(PathBuf::from("enc"), "320x240")
            .with_template(vec!["{input}".into(), "{output}".into(), "{resolution}".into()]);
        let args = cmd.args_for(Path::new("/a"), Path::new("/b"), TargetFormat::Webm);
        assert_eq!(args, vec!["/a", "/b", "320x240"]);
    }

    #[test]
    fn test_extract_value() {
        let line = "frame= 123 fps= 60.0 size= 1024kB time=00:00:10.00 bitrate= 2000.0kbits/s speed= 1.0x";
        assert_eq!(extract_value(line, "time="), Some("00:00:10.00".to_string()));
        assert_eq!(extract_value(line, "bitrate="), Some("2000.0kbits/s".to_string()));
        assert_eq!(extract_value(line, "speed="), Some("1.0x".to_string()));
        assert_eq!(extract_value(line, "missing="), None);
        assert!(is_progress_line(line));
    }

    #[test]
    fn test_monitor_keeps_last_diagnostic() {
        let stderr = b"Input #0, avi, from 'clip.avi':\nframe= 1 time=00:00:01.00 bitrate= 1k speed=1x\rframe= 2 time=00:00:02.00 bitrate= 1k speed=1x\rclip.avi: Invalid data found\n" as &[u8];
        let last = monitor_stderr(stderr, "ffmpeg");
        assert_eq!(last.as_deref(), Some("clip.avi: Invalid data found"));
    }

    #[test]
    fn test_spawn_missing_program() {
        let cmd = EncoderCommand::new(PathBuf::from("/no/such/encoder_12345"), DEFAULT_RESOLUTION);
        let err = cmd
            .spawn(Path::new("/a"), Path::new("/b"), TargetFormat::Mp4)
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_and_wait() {
        let cmd = EncoderCommand::new(PathBuf::from("sh"), DEFAULT_RESOLUTION).with_template(vec![
            "-c".into(),
            "echo \"bad input: $0\" >&2; exit 3".into(),
            "{input}".into(),
            "{output}".into(),
        ]);
        let mut process = cmd
            .spawn(Path::new("/a"), Path::new("/b"), TargetFormat::Mp4)
            .unwrap();
        let status = process.wait().unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.diagnostic().as_deref(), Some("bad input: /a"));
    }

    #[cfg(unix)]
    #[test]
    fn test_take_monitor_does_not_wait_for_stderr() {
        use std::time::{Duration, Instant};

        // The background sleep inherits stderr and keeps the pipe open.
        let cmd = EncoderCommand::new(PathBuf::from("sh"), DEFAULT_RESOLUTION).with_template(vec![
            "-c".into(),
            "sleep 1 & echo 'broken frame' >&2; exit 4".into(),
        ]);
        let mut process = cmd
            .spawn(Path::new("/a"), Path::new("/b"), TargetFormat::Mp4)
            .unwrap();
        assert!(process.take_monitor().is_none());
        assert_eq!(process.wait().unwrap().code(), Some(4));

        let started = Instant::now();
        let monitor = process.take_monitor().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(process.take_monitor().is_none());

        assert_eq!(monitor.join().as_deref(), Some("broken frame"));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_running_process() {
        let cmd = EncoderCommand::new(PathBuf::from("sleep"), DEFAULT_RESOLUTION)
            .with_template(vec!["30".into()]);
        let mut process = cmd
            .spawn(Path::new("/a"), Path::new("/b"), TargetFormat::Mp4)
            .unwrap();
        assert!(process.try_wait().unwrap().is_none());

        let status = process.kill().unwrap();
        assert!(!status.success());
        assert!(process.try_wait().unwrap().is_some());
    }
}
