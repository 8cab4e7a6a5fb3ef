//! Read-only stream over an output that may still be growing.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use streamcoder_common::{OutputArtifact, SourceDescriptor, TargetFormat};

use super::error::{Error, Result};
use super::lock::ReaderLease;
use super::settings::CoderSettings;
use super::worker::{Origin, TranscodeWorker, WorkerState, ORPHAN_CHECK_INTERVAL};

/// Aborts blocked reads and seeks of one stream from another thread.
///
/// Cancellation is sticky: every later wait fails with [`Error::Cancelled`].
/// Data that is already available can still be read.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Cancel current and future waits.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether two metadata records describe the same file.
#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.created().ok() == b.created().ok()
}

/// The encoded form of a source, readable while it is being produced.
///
/// Reads block until the requested bytes exist or the encode has finished.
/// Only one encoder runs per source, no matter how many streams are opened
/// for it, in how many processes.
///
/// # Example
///
/// ```no_run
/// use std::io::Read;
/// use std::sync::Arc;
/// use streamcoder::{CoderSettings, GrowingFileStream, TargetFormat};
///
/// let settings = Arc::new(CoderSettings::default());
/// let mut stream = GrowingFileStream::open("/videos/clip.avi", TargetFormat::Mp4, settings)?;
/// let mut encoded = Vec::new();
/// stream.read_to_end(&mut encoded)?;
/// stream.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct GrowingFileStream {
    descriptor: SourceDescriptor,
    artifact: OutputArtifact,
    settings: Arc<CoderSettings>,
    worker: TranscodeWorker,
    origin: Origin,
    reader: Option<ReaderLease>,
    file: Option<File>,
    position: u64,
    final_length: OnceLock<u64>,
    cancel: CancelHandle,
    last_orphan_check: Option<Instant>,
}

impl GrowingFileStream {
    /// Open the encoded form of `source`, starting the encode if needed.
    ///
    /// Returns once the output is readable, which for a fresh encode means
    /// the encoder has created its output file.
    ///
    /// # Errors
    ///
    /// - [`Error::SourceNotFound`] if `source` does not exist and no finished
    ///   output can be reused
    /// - [`Error::Encoder`] if the encoder cannot be launched
    /// - [`Error::TranscodeFailed`] if the encode failed before any output
    ///   could be opened
    /// - [`Error::Timeout`] if the configured startup timeout runs out
    pub fn open(
        source: impl AsRef<Path>,
        format: TargetFormat,
        settings: Arc<CoderSettings>,
    ) -> Result<Self> {
        let descriptor = SourceDescriptor::new(source.as_ref(), format)?;
        let artifact = OutputArtifact::for_source(&descriptor);

        // With any artifact present the worker decides; it re-checks the
        // source before encoding.
        if artifact.is_absent() && !descriptor.exists() {
            return Err(Error::SourceNotFound {
                path: descriptor.path().to_path_buf(),
            });
        }

        let (mut worker, ready) =
            TranscodeWorker::spawn(descriptor.clone(), artifact.clone(), Arc::clone(&settings))?;

        let file = match File::open(artifact.output()) {
            Ok(file) => file,
            Err(e) => {
                worker.shutdown(Some(ready.reader))?;
                return Err(match worker.state() {
                    WorkerState::Failed(reason) => Error::transcode_failed(descriptor.path(), reason),
                    _ => Error::Io(e),
                });
            }
        };

        tracing::debug!(
            "Opened {} ({})",
            artifact.output().display(),
            ready.origin
        );

        Ok(Self {
            descriptor,
            artifact,
            settings,
            worker,
            origin: ready.origin,
            reader: Some(ready.reader),
            file: Some(file),
            position: 0,
            final_length: OnceLock::new(),
            cancel: CancelHandle::default(),
            last_orphan_check: None,
        })
    }

    /// Final output length, or `None` while the encode is still running.
    ///
    /// Also `None` when the output this stream has open was discarded and
    /// replaced by another encode.
    pub fn length(&self) -> Option<u64> {
        if let Some(len) = self.final_length.get() {
            return Some(*len);
        }
        if !self.artifact.is_complete() || !self.output_is_ours().ok()? {
            return None;
        }
        let len = self.file.as_ref()?.metadata().ok()?.len();
        Some(*self.final_length.get_or_init(|| len))
    }

    /// Seeking is only meaningful once the length is known.
    pub fn can_seek(&self) -> bool {
        self.length().is_some()
    }

    /// Always true.
    pub fn can_read(&self) -> bool {
        true
    }

    /// Always false.
    pub fn can_write(&self) -> bool {
        false
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The source this stream encodes.
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Output and marker paths.
    pub fn artifact(&self) -> &OutputArtifact {
        &self.artifact
    }

    /// How the output was obtained.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// State of this stream's worker.
    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Handle for aborting blocked reads from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Streams are read-only.
    pub fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(Error::Unsupported("set_len"))
    }

    /// Stop the encode if this was its last reader and release the output.
    ///
    /// Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        let reader = self.reader.take();
        let result = self.worker.shutdown(reader);
        self.file = None;
        result
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "stream is closed")))
    }

    /// Bytes written so far.
    fn realized_length(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Err(Error::Io(io::Error::new(io::ErrorKind::Other, "stream is closed"))),
        }
    }

    /// Whether the output path still names the file this stream has open.
    fn output_is_ours(&self) -> Result<bool> {
        let Some(file) = &self.file else {
            return Ok(false);
        };
        let opened = file.metadata()?;
        match fs::metadata(self.artifact.output()) {
            Ok(current) => Ok(same_file(&opened, &current)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn complete(&self) -> bool {
        if self.length().is_some() {
            self.worker.note_completed();
            return true;
        }
        false
    }

    fn failed(&self, reason: impl Into<String>) -> Error {
        Error::transcode_failed(self.descriptor.path(), reason)
    }

    /// Turn an abnormal end of the encode into an error instead of a hang.
    fn check_failure(&mut self) -> Result<()> {
        if let WorkerState::Failed(reason) = self.worker.state() {
            return Err(self.failed(reason));
        }

        if self.artifact.is_absent() {
            // A local worker removes the files before it records why.
            if let WorkerState::Failed(reason) = self.worker.state() {
                return Err(self.failed(reason));
            }
            return Err(self.failed("output and marker disappeared"));
        }

        // A restart after a crash discards the output we have open.
        if !self.output_is_ours()? {
            return Err(self.failed("output was discarded and re-encoded"));
        }

        let due = self
            .last_orphan_check
            .map_or(true, |at| at.elapsed() >= ORPHAN_CHECK_INTERVAL);
        if due {
            self.last_orphan_check = Some(Instant::now());
            if self.worker.coordinator().marker_orphaned(&self.artifact)? {
                tracing::warn!(
                    "Encoder of {} stopped without finishing",
                    self.descriptor.path().display()
                );
                return Err(self.failed("encoder stopped without finishing"));
            }
        }
        Ok(())
    }

    /// Block until `needed` bytes exist (or, with `None`, until completion).
    ///
    /// Until completion, failures are checked before any data is handed out.
    fn wait_until(&mut self, needed: Option<u64>, what: &'static str) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.complete() {
                return Ok(());
            }
            self.check_failure()?;

            if let Some(needed) = needed {
                if self.realized_length()? >= needed {
                    return Ok(());
                }
            }

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(limit) = self.settings.read_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(Error::Timeout { what, waited });
                }
            }

            self.worker.wait_for_change(self.settings.poll_interval);
        }
    }

    fn offset(base: u64, delta: i64) -> Result<u64> {
        base.checked_add_signed(delta)
            .ok_or_else(|| Error::InvalidSeek(format!("position {} {:+} is out of range", base, delta)))
    }
}

impl Read for GrowingFileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let needed = self.position.saturating_add(buf.len() as u64);
        self.wait_until(Some(needed), "data")?;

        let file = self.file_mut()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.position += filled as u64;
        Ok(filled)
    }
}

impl Seek for GrowingFileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => Self::offset(self.position, delta)?,
            SeekFrom::End(delta) => {
                self.wait_until(None, "completion")?;
                let length = self.length().ok_or_else(|| self.failed("output disappeared"))?;
                Self::offset(length, delta)?
            }
        };

        self.wait_until(Some(target), "data")?;

        if let Some(length) = self.length() {
            if target > length {
                return Err(Error::SeekOutOfRange { target, length }.into());
            }
        }

        self.file_mut()?.seek(SeekFrom::Start(target))?;
        self.position = target;
        Ok(target)
    }
}

impl Write for GrowingFileStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(Error::Unsupported("write").into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for GrowingFileStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(
                "Failed to close stream for {}: {}",
                self.descriptor.path().display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use streamcoder_av::EncoderCommand;

    fn reuse_settings(dir: &Path) -> Arc<CoderSettings> {
        let encoder = EncoderCommand::new(PathBuf::from("/no/such/encoder"), "800x450");
        Arc::new(
            CoderSettings::default()
                .with_encoder(encoder)
                .with_lock_dir(dir.join("locks")),
        )
    }

    fn finished_output(dir: &Path, contents: &[u8]) -> PathBuf {
        let source = dir.join("clip.avi");
        fs::write(&source, b"source").unwrap();
        fs::write(dir.join("clip.avi.mp4"), contents).unwrap();
        source
    }

    #[test]
    fn reused_output_is_complete_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let source = finished_output(dir.path(), b"0123456789");

        let mut stream = GrowingFileStream::open(&source, TargetFormat::Mp4, reuse_settings(dir.path())).unwrap();
        assert_eq!(stream.origin(), Origin::Reused);
        assert_eq!(stream.length(), Some(10));
        assert!(stream.can_seek());
        assert!(stream.can_read());
        assert!(!stream.can_write());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(stream.position(), 10);
    }

    #[test]
    fn reuse_does_not_need_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = finished_output(dir.path(), b"data");
        fs::remove_file(&source).unwrap();

        let stream = GrowingFileStream::open(&source, TargetFormat::Mp4, reuse_settings(dir.path())).unwrap();
        assert_eq!(stream.length(), Some(4));
    }

    #[test]
    fn seek_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let source = finished_output(dir.path(), b"0123456789");
        let mut stream = GrowingFileStream::open(&source, TargetFormat::Mp4, reuse_settings(dir.path())).unwrap();

        assert_eq!(stream.seek(SeekFrom::End(-3)).unwrap(), 7);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        assert_eq!(stream.seek(SeekFrom::Current(-5)).unwrap(), 5);
        assert_eq!(stream.seek(SeekFrom::End(0)).unwrap(), 10);

        let err = Error::from_io(stream.seek(SeekFrom::Start(11)).unwrap_err());
        assert!(matches!(err, Error::SeekOutOfRange { target: 11, length: 10 }));

        let err = Error::from_io(stream.seek(SeekFrom::Current(-20)).unwrap_err());
        assert!(matches!(err, Error::InvalidSeek(_)));
        assert_eq!(stream.position(), 10);
    }

    #[test]
    fn write_and_set_len_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let source = finished_output(dir.path(), b"data");
        let mut stream = GrowingFileStream::open(&source, TargetFormat::Mp4, reuse_settings(dir.path())).unwrap();

        let err = stream.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(matches!(stream.set_len(0), Err(Error::Unsupported("set_len"))));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = finished_output(dir.path(), b"data");
        let mut stream = GrowingFileStream::open(&source, TargetFormat::Mp4, reuse_settings(dir.path())).unwrap();

        stream.close().unwrap();
        stream.close().unwrap();
        assert!(stream.read(&mut [0u8; 4]).is_err());
        assert!(dir.path().join("clip.avi.mp4").exists());
    }

    #[test]
    fn missing_source_fails_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let err = GrowingFileStream::open(
            dir.path().join("missing.avi"),
            TargetFormat::Mp4,
            reuse_settings(dir.path()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
    }
}
