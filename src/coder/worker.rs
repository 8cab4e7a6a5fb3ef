//! Background worker that produces (or finds) the output for one stream.
//!
//! The worker thread takes the transition lock, decides how the output will be
//! obtained and reports back to the constructor through a channel:
//!
//! - **Reuse**: a finished output exists; nothing to run.
//! - **Attach**: a live encode (this process or another) owns the marker; wait
//!   for its output to appear.
//! - **Encode**: claim the encoder lease, create the marker, launch the
//!   encoder and wait for the output to appear. The thread then supervises the
//!   encoder until it exits and finalizes the artifacts under the lock. If
//!   every reader of the source goes away first, in any process, the encode is
//!   cancelled and its artifacts removed.
//!
//! A marker whose lease is free was left by a crashed encode and is handled
//! according to [`StaleMarkerPolicy`].

use parking_lot::{Condvar, Mutex};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use streamcoder_av::EncoderProcess;
use streamcoder_common::{OutputArtifact, SourceDescriptor};

use super::error::{Error, Result};
use super::lock::{EncodeLease, LockCoordinator, ReaderLease, TransitionGuard};
use super::settings::{CoderSettings, StaleMarkerPolicy};

/// Minimum spacing between two orphaned-marker checks while waiting.
pub(crate) const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the transition lock.
    NotStarted,
    /// Encoder launched, output not yet visible.
    Starting,
    /// Output is growing.
    Running,
    /// Output is final.
    Completed,
    /// The encode ended abnormally; artifacts were removed.
    Failed(String),
}

impl WorkerState {
    /// Whether the state can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Failed(_))
    }
}

/// How a stream obtained its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A finished output was already on disk.
    Reused,
    /// Another stream, possibly in another process, is encoding it.
    Attached,
    /// This stream's worker launched the encoder.
    Encoding,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Origin::Reused => "reused",
            Origin::Attached => "attached",
            Origin::Encoding => "encoding",
        };
        write!(f, "{}", s)
    }
}

/// What the constructor receives once the output is readable.
#[derive(Debug)]
pub(crate) struct Ready {
    pub(crate) origin: Origin,
    pub(crate) reader: ReaderLease,
}

enum Plan {
    Reuse,
    Attach,
    Stale,
    Encode,
}

/// Result of the locked phase, handed back to the thread body.
struct Established {
    origin: Origin,
    reader: ReaderLease,
    guard: Option<TransitionGuard>,
}

/// State shared between the worker thread, the stream and teardown.
#[derive(Debug)]
pub(super) struct Shared {
    pub(super) descriptor: SourceDescriptor,
    pub(super) artifact: OutputArtifact,
    pub(super) settings: Arc<CoderSettings>,
    pub(super) coordinator: LockCoordinator,
    pub(super) state: Mutex<WorkerState>,
    pub(super) changed: Condvar,
    pub(super) process: Mutex<Option<EncoderProcess>>,
    pub(super) lease: Mutex<Option<EncodeLease>>,
    pub(super) cancelled: AtomicBool,
}

impl Shared {
    pub(super) fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(
                "{}: {:?} -> {:?}",
                self.descriptor.path().display(),
                *state,
                next
            );
            *state = next;
        }
        self.changed.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn new(
        descriptor: SourceDescriptor,
        artifact: OutputArtifact,
        settings: Arc<CoderSettings>,
    ) -> Result<Arc<Self>> {
        let coordinator = LockCoordinator::new(&settings.lock_dir, &descriptor)?;
        Ok(Arc::new(Self {
            descriptor,
            artifact,
            settings,
            coordinator,
            state: Mutex::new(WorkerState::NotStarted),
            changed: Condvar::new(),
            process: Mutex::new(None),
            lease: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }))
    }

    /// Thread body.
    fn run(self: Arc<Self>, ready: SyncSender<Result<Ready>>) {
        match self.establish() {
            Ok(Established {
                origin,
                reader,
                guard,
            }) => {
                // The channel has room for exactly this one message. A failed
                // send drops the reader lease along with the message.
                let delivered = ready.send(Ok(Ready { origin, reader })).is_ok();
                if !delivered && origin == Origin::Encoding {
                    tracing::warn!(
                        "Nobody is waiting for the encode of {}; cancelling it",
                        self.descriptor.path().display()
                    );
                    self.abandon("cancelled");
                }
                drop(guard);
                if delivered && origin == Origin::Encoding {
                    self.supervise();
                }
            }
            Err(e) => {
                let settled = self.state.lock().is_terminal();
                if !settled {
                    self.set_state(WorkerState::Failed(e.to_string()));
                }
                let _ = ready.send(Err(e));
            }
        }
    }

    /// Poll for the transition lock so a cancelled construction can give up.
    fn acquire_lock(&self) -> Result<TransitionGuard> {
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(guard) = self.coordinator.try_acquire()? {
                return Ok(guard);
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn plan(&self) -> Result<Plan> {
        if self.artifact.has_marker() {
            if self.coordinator.marker_orphaned(&self.artifact)? {
                Ok(Plan::Stale)
            } else {
                Ok(Plan::Attach)
            }
        } else if self.artifact.has_output() {
            Ok(Plan::Reuse)
        } else {
            Ok(Plan::Encode)
        }
    }

    fn establish(&self) -> Result<Established> {
        loop {
            let guard = self.acquire_lock()?;

            match self.plan()? {
                Plan::Reuse => {
                    let reader = self.coordinator.join_readers()?;
                    tracing::info!("Reusing finished output {}", self.artifact.output().display());
                    self.set_state(WorkerState::Completed);
                    return Ok(Established {
                        origin: Origin::Reused,
                        reader,
                        guard: Some(guard),
                    });
                }
                Plan::Attach => {
                    let reader = self.coordinator.join_readers()?;
                    drop(guard);
                    tracing::info!(
                        "Attaching to running encode of {}",
                        self.descriptor.path().display()
                    );
                    if self.await_attached_output()? {
                        self.set_state(WorkerState::Running);
                        return Ok(Established {
                            origin: Origin::Attached,
                            reader,
                            guard: None,
                        });
                    }
                    // The encode we attached to crashed; decide again.
                    drop(reader);
                }
                Plan::Stale => {
                    tracing::warn!(
                        "Found stale marker {} with no live encoder",
                        self.artifact.marker().display()
                    );
                    self.artifact.discard()?;
                    match self.settings.stale_marker {
                        StaleMarkerPolicy::Restart => return self.begin(guard),
                        StaleMarkerPolicy::Fail => {
                            return Err(Error::transcode_failed(
                                self.descriptor.path(),
                                "a previous encode crashed; its artifacts were removed",
                            ));
                        }
                    }
                }
                Plan::Encode => return self.begin(guard),
            }
        }
    }

    /// Wait outside the lock for another encoder's output to appear.
    ///
    /// Returns `Ok(false)` when that encoder turned out to be dead.
    fn await_attached_output(&self) -> Result<bool> {
        let mut last_orphan_check = Instant::now();
        loop {
            if self.artifact.has_output() {
                return Ok(true);
            }
            if !self.artifact.has_marker() {
                return Err(Error::transcode_failed(
                    self.descriptor.path(),
                    "the running encode ended before producing output",
                ));
            }
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if last_orphan_check.elapsed() >= ORPHAN_CHECK_INTERVAL {
                last_orphan_check = Instant::now();
                if self.coordinator.marker_orphaned(&self.artifact)? {
                    return Ok(false);
                }
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn begin(&self, guard: TransitionGuard) -> Result<Established> {
        if !self.descriptor.exists() {
            return Err(Error::SourceNotFound {
                path: self.descriptor.path().to_path_buf(),
            });
        }

        let lease = self.coordinator.claim_encoder()?;
        *self.lease.lock() = Some(lease);

        match self.launch() {
            Ok(reader) => Ok(Established {
                origin: Origin::Encoding,
                reader,
                guard: Some(guard),
            }),
            Err(e) => {
                let reason = match &e {
                    Error::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                self.abandon(&reason);
                Err(e)
            }
        }
    }

    /// Create the marker, start the encoder and wait for its first bytes.
    fn launch(&self) -> Result<ReaderLease> {
        self.artifact.remove_output()?;
        self.artifact.create_marker()?;
        let reader = self.coordinator.join_readers()?;

        let process = self.settings.encoder.spawn(
            self.descriptor.path(),
            self.artifact.output(),
            self.descriptor.format(),
        )?;
        tracing::info!(
            "Encoding {} -> {} (pid {})",
            self.descriptor.path().display(),
            self.artifact.output().display(),
            process.id()
        );
        *self.process.lock() = Some(process);
        self.set_state(WorkerState::Starting);

        loop {
            if self.artifact.has_output() {
                break;
            }
            let exited = match self.process.lock().as_mut() {
                Some(process) => process.try_wait()?.is_some(),
                None => true,
            };
            if exited {
                tracing::debug!("Encoder exited before creating its output");
                break;
            }
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            thread::sleep(self.settings.poll_interval);
        }

        self.set_state(WorkerState::Running);
        Ok(reader)
    }

    /// Wait for the encoder to exit, then finalize.
    ///
    /// Stops early once no stream in any process reads the source any more.
    fn supervise(&self) {
        let status = loop {
            let polled = match self.process.lock().as_mut() {
                Some(process) => process.try_wait(),
                None => return,
            };
            match polled {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            match self.abandon_if_unread() {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to check for readers: {}", e),
            }
            thread::sleep(self.settings.poll_interval);
        };
        self.finish(status);
    }

    /// Cancel the encode if its last reader has gone.
    ///
    /// Readers register under the transition lock, so the check is repeated
    /// under it before anything is killed. Returns true once the encode is no
    /// longer this worker's to finish.
    fn abandon_if_unread(&self) -> Result<bool> {
        if self.coordinator.has_readers()? {
            return Ok(false);
        }
        let _guard = self.coordinator.acquire()?;
        if self.coordinator.has_readers()? {
            return Ok(false);
        }
        // A finished encode is finalized normally and stays reusable.
        let exited = match self.process.lock().as_mut() {
            Some(process) => process.try_wait()?.is_some(),
            None => true,
        };
        if exited {
            return Ok(false);
        }
        if self.abandon("cancelled") {
            tracing::info!(
                "Last reader of {} closed; cancelled its encode",
                self.descriptor.path().display()
            );
        }
        Ok(true)
    }

    /// Terminal transition, taken under the lock. Does nothing if teardown
    /// already finalized this encode.
    fn finish(&self, status: streamcoder_av::Result<ExitStatus>) {
        let (label, monitor) = match self.process.lock().as_mut() {
            Some(process) => (process.label().to_string(), process.take_monitor()),
            None => ("encoder".to_string(), None),
        };
        let diagnostic = monitor.and_then(|monitor| monitor.join());

        let guard = match self.coordinator.acquire() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::error!("Finalizing without the transition lock: {}", e);
                None
            }
        };

        let Some(lease) = self.lease.lock().take() else {
            return;
        };

        let outcome = match status {
            Ok(status) if status.success() && self.artifact.has_output() => self
                .artifact
                .remove_marker()
                .map(drop)
                .map_err(|e| format!("failed to remove marker: {}", e)),
            Ok(status) if status.success() => Err(format!("{} exited without producing output", label)),
            Ok(status) => Err(match diagnostic {
                Some(line) => format!("{} failed ({}): {}", label, status, line),
                None => format!("{} failed ({})", label, status),
            }),
            Err(e) => Err(format!("lost track of {}: {}", label, e)),
        };

        match outcome {
            Ok(()) => {
                tracing::info!("Finished encoding {}", self.artifact.output().display());
                self.set_state(WorkerState::Completed);
            }
            Err(reason) => {
                tracing::error!("Encode of {} failed: {}", self.descriptor.path().display(), reason);
                if let Err(e) = self.artifact.discard() {
                    tracing::warn!("Failed to remove artifacts: {}", e);
                }
                self.set_state(WorkerState::Failed(reason));
            }
        }

        drop(lease);
        drop(guard);
    }

    /// Kill the encoder, discard both artifacts and give up the lease.
    ///
    /// Returns false if the encode was already finalized by someone else.
    pub(super) fn abandon(&self, reason: &str) -> bool {
        let Some(lease) = self.lease.lock().take() else {
            return false;
        };
        if let Some(process) = self.process.lock().as_mut() {
            if let Err(e) = process.kill() {
                tracing::warn!("Failed to kill {}: {}", process.label(), e);
            }
        }
        if let Err(e) = self.artifact.discard() {
            tracing::warn!("Failed to remove artifacts: {}", e);
        }
        drop(lease);
        self.set_state(WorkerState::Failed(reason.to_string()));
        true
    }
}

/// Handle to the background worker of one stream.
#[derive(Debug)]
pub struct TranscodeWorker {
    pub(super) shared: Arc<Shared>,
    pub(super) handle: Option<JoinHandle<()>>,
}

impl TranscodeWorker {
    /// Start the worker and block until the output is readable.
    ///
    /// # Errors
    ///
    /// Returns whatever stopped the worker from producing a readable output:
    /// [`Error::SourceNotFound`], [`Error::Encoder`] when the encoder cannot be
    /// launched, [`Error::TranscodeFailed`] for a stale marker under
    /// [`StaleMarkerPolicy::Fail`], or [`Error::Timeout`] when the configured
    /// startup timeout runs out.
    pub(crate) fn spawn(
        descriptor: SourceDescriptor,
        artifact: OutputArtifact,
        settings: Arc<CoderSettings>,
    ) -> Result<(Self, Ready)> {
        let startup_timeout = settings.startup_timeout;
        let shared = Shared::new(descriptor, artifact, settings)?;

        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new().name("transcode-worker".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || shared.run(tx)
        })?;
        let mut worker = Self {
            shared,
            handle: Some(handle),
        };

        let received = match startup_timeout {
            None => rx.recv().ok(),
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(outcome) => Some(outcome),
                Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        "Output of {} did not appear within {:?}",
                        worker.shared.descriptor.path().display(),
                        limit
                    );
                    worker.shared.cancelled.store(true, Ordering::SeqCst);
                    // The worker answers within one poll interval once cancelled.
                    match rx.recv() {
                        Ok(Ok(ready)) => {
                            if let Err(e) = worker.shutdown(Some(ready.reader)) {
                                tracing::warn!("Teardown after startup timeout failed: {}", e);
                            }
                        }
                        _ => worker.join(),
                    }
                    return Err(Error::Timeout {
                        what: "encoder output",
                        waited: limit,
                    });
                }
            },
        };

        match received {
            Some(Ok(ready)) => Ok((worker, ready)),
            Some(Err(e)) => {
                worker.join();
                Err(e)
            }
            None => {
                worker.join();
                Err(Error::transcode_failed(
                    worker.shared.descriptor.path(),
                    "worker thread exited unexpectedly",
                ))
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.shared.state.lock().clone()
    }

    /// Lock coordinator for this worker's source.
    pub fn coordinator(&self) -> &LockCoordinator {
        &self.shared.coordinator
    }

    /// Sleep until the state changes or `timeout` elapses.
    pub(crate) fn wait_for_change(&self, timeout: Duration) {
        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            self.shared.changed.wait_for(&mut state, timeout);
            return;
        }
        drop(state);
        thread::sleep(timeout);
    }

    /// Record that a remote encode this worker attached to has completed.
    pub(crate) fn note_completed(&self) {
        if self.shared.process.lock().is_some() {
            return;
        }
        let running = *self.shared.state.lock() == WorkerState::Running;
        if running {
            self.shared.set_state(WorkerState::Completed);
        }
    }

    pub(super) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(
                    "Worker for {} panicked",
                    self.shared.descriptor.path().display()
                );
            }
        }
    }
}

impl Drop for TranscodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.shutdown(None) {
                tracing::warn!("Worker teardown failed: {}", e);
            }
        }
    }
}
