//! Cross-process coordination for one source.
//!
//! All processes touching the same source agree on a lock *name*: the hex
//! SHA-256 of a fixed namespace token followed by the absolute source path.
//! Three lock files live under that name in the lock directory:
//!
//! - `<name>.lock` orders state transitions (reuse check, encoder start,
//!   encoder stop, teardown). Held only for bounded work, never while a reader
//!   waits for data.
//! - `<name>.encoding` is held by the worker that owns the marker for as long
//!   as the marker may exist. The OS drops it when that process dies, which is
//!   how a crashed encode is told apart from a live one.
//! - `<name>.readers` is held *shared* by every open stream, so teardown can
//!   tell whether anyone else is still reading.
//!
//! Every acquisition opens a fresh handle, so locks exclude each other across
//! threads of one process as well as across processes. Lock files are never
//! deleted: another process may be blocked on the very file.

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use streamcoder_common::{OutputArtifact, SourceDescriptor};

use super::error::{Error, Result};

/// Namespace mixed into every lock name so unrelated tools hashing the same
/// path never collide with us.
const LOCK_NAMESPACE: &str = "streamcoder/transcode/9f1c2d7e # ";

/// Lock name for an absolute source path.
pub fn lock_name(source: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LOCK_NAMESPACE.as_bytes());
    hasher.update(source.as_os_str().as_encoded_bytes());
    hex::encode(hasher.finalize())
}

/// Try to take an exclusive lock; `Ok(false)` means someone else holds it.
fn try_exclusive(file: &File) -> io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(e) => Err(e),
    }
}

/// An OS file lock that is released when dropped.
#[derive(Debug)]
struct HeldLock {
    file: File,
    path: PathBuf,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Exclusive ownership of the transition lock; released on drop.
#[derive(Debug)]
pub struct TransitionGuard(HeldLock);

/// Proof that the holder is the one live encoder for the source.
#[derive(Debug)]
pub struct EncodeLease(HeldLock);

/// Registration of one open stream.
#[derive(Debug)]
pub struct ReaderLease(HeldLock);

/// Named cross-process locks for one source.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    name: String,
    dir: PathBuf,
}

impl LockCoordinator {
    /// Create the coordinator for `source`, creating `dir` if needed.
    pub fn new(dir: &Path, source: &SourceDescriptor) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::lock(dir, e))?;
        Ok(Self {
            name: lock_name(source.path()),
            dir: dir.to_path_buf(),
        })
    }

    /// Hex digest naming this source's locks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the transition lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.path_for("lock")
    }

    fn path_for(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, suffix))
    }

    fn open(&self, suffix: &str) -> Result<(File, PathBuf)> {
        let path = self.path_for(suffix);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::lock(&path, e))?;
        Ok((file, path))
    }

    /// Block until this caller exclusively owns the transition lock.
    pub fn acquire(&self) -> Result<TransitionGuard> {
        let (file, path) = self.open("lock")?;
        FileExt::lock_exclusive(&file).map_err(|e| Error::lock(&path, e))?;
        tracing::trace!("Acquired transition lock {}", &self.name[..12]);
        Ok(TransitionGuard(HeldLock { file, path }))
    }

    /// Take the transition lock if nobody holds it.
    pub fn try_acquire(&self) -> Result<Option<TransitionGuard>> {
        let (file, path) = self.open("lock")?;
        if !try_exclusive(&file).map_err(|e| Error::lock(&path, e))? {
            return Ok(None);
        }
        Ok(Some(TransitionGuard(HeldLock { file, path })))
    }

    /// Take the encoder lease, blocking until it is free.
    pub fn claim_encoder(&self) -> Result<EncodeLease> {
        let (file, path) = self.open("encoding")?;
        FileExt::lock_exclusive(&file).map_err(|e| Error::lock(&path, e))?;
        Ok(EncodeLease(HeldLock { file, path }))
    }

    /// Whether some live worker, in any process, holds the encoder lease.
    pub fn encoder_alive(&self) -> Result<bool> {
        let (file, path) = self.open("encoding")?;
        let free = try_exclusive(&file).map_err(|e| Error::lock(&path, e))?;
        if free {
            drop(HeldLock { file, path });
        }
        Ok(!free)
    }

    /// Whether the marker exists with no live worker behind it.
    ///
    /// The lease is held while the marker is checked, so a worker that is
    /// finishing (marker removed, then lease released) is never mistaken for a
    /// crashed one.
    pub fn marker_orphaned(&self, artifact: &OutputArtifact) -> Result<bool> {
        let (file, path) = self.open("encoding")?;
        if !try_exclusive(&file).map_err(|e| Error::lock(&path, e))? {
            return Ok(false);
        }
        let _lease = HeldLock { file, path };
        Ok(artifact.has_marker())
    }

    /// Register an open stream.
    pub fn join_readers(&self) -> Result<ReaderLease> {
        let (file, path) = self.open("readers")?;
        FileExt::lock_shared(&file).map_err(|e| Error::lock(&path, e))?;
        Ok(ReaderLease(HeldLock { file, path }))
    }

    /// Whether any stream, in any process, is registered as a reader.
    pub fn has_readers(&self) -> Result<bool> {
        let (file, path) = self.open("readers")?;
        let free = try_exclusive(&file).map_err(|e| Error::lock(&path, e))?;
        if free {
            drop(HeldLock { file, path });
        }
        Ok(!free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use streamcoder_common::TargetFormat;

    fn coordinator(dir: &Path, source: &str) -> (LockCoordinator, SourceDescriptor) {
        let source = SourceDescriptor::new(dir.join(source), TargetFormat::Mp4).unwrap();
        let coordinator = LockCoordinator::new(&dir.join("locks"), &source).unwrap();
        (coordinator, source)
    }

    #[test]
    fn lock_name_is_stable_and_distinct() {
        let a = lock_name(Path::new("/videos/a.avi"));
        assert_eq!(a, lock_name(Path::new("/videos/a.avi")));
        assert_ne!(a, lock_name(Path::new("/videos/b.avi")));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn acquire_excludes_other_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), "clip.avi");

        let guard = coordinator.acquire().unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let coordinator = coordinator.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _guard = coordinator.acquire().unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn different_sources_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = coordinator(dir.path(), "a.avi");
        let (b, _) = coordinator(dir.path(), "b.avi");

        let _a = a.acquire().unwrap();
        let _b = b.acquire().unwrap();
        assert_ne!(a.lock_path(), b.lock_path());
    }

    #[test]
    fn try_acquire_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), "clip.avi");

        let guard = coordinator.try_acquire().unwrap().expect("lock is free");
        assert!(coordinator.try_acquire().unwrap().is_none());
        drop(guard);
        assert!(coordinator.try_acquire().unwrap().is_some());
    }

    #[test]
    fn encoder_lease_reports_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), "clip.avi");

        assert!(!coordinator.encoder_alive().unwrap());
        let lease = coordinator.claim_encoder().unwrap();
        assert!(coordinator.encoder_alive().unwrap());
        drop(lease);
        assert!(!coordinator.encoder_alive().unwrap());
    }

    #[test]
    fn marker_orphaned_only_without_lease() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, source) = coordinator(dir.path(), "clip.avi");
        let artifact = OutputArtifact::for_source(&source);

        assert!(!coordinator.marker_orphaned(&artifact).unwrap());

        artifact.create_marker().unwrap();
        assert!(coordinator.marker_orphaned(&artifact).unwrap());

        let _lease = coordinator.claim_encoder().unwrap();
        assert!(!coordinator.marker_orphaned(&artifact).unwrap());
    }

    #[test]
    fn readers_are_counted_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), "clip.avi");

        assert!(!coordinator.has_readers().unwrap());
        let first = coordinator.join_readers().unwrap();
        let second = coordinator.join_readers().unwrap();
        assert!(coordinator.has_readers().unwrap());

        drop(first);
        assert!(coordinator.has_readers().unwrap());
        drop(second);
        assert!(!coordinator.has_readers().unwrap());
    }
}
