//! Coordinated shutdown of a stream's worker.
//!
//! The last reader of an in-flight encode kills it and removes the partial
//! artifacts. While other readers are registered for the same source, in this
//! process or another, the encode is left to run to completion.
//!
//! Only the stream that launched the encoder can kill it directly. When that
//! stream closes first its worker thread is detached and keeps supervising;
//! once the last attached reader is gone the worker cancels the encode itself.

use std::sync::atomic::Ordering;

use super::error::Result;
use super::lock::ReaderLease;
use super::worker::TranscodeWorker;

impl TranscodeWorker {
    /// Release `reader` and stop the encode if nobody else is reading.
    ///
    /// Idempotent: once the worker thread has been joined or detached, later
    /// calls only drop the lease they are given.
    pub(crate) fn shutdown(&mut self, reader: Option<ReaderLease>) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            drop(reader);
            return Ok(());
        };
        let shared = &self.shared;

        shared.cancelled.store(true, Ordering::SeqCst);
        drop(reader);

        let guard = shared.coordinator.acquire()?;

        let alive = match shared.process.lock().as_mut() {
            Some(process) => process.try_wait()?.is_none(),
            None => false,
        };

        let mut detach = false;
        if alive {
            if shared.coordinator.has_readers()? {
                tracing::info!(
                    "Leaving encode of {} running for other readers",
                    shared.descriptor.path().display()
                );
                detach = true;
            } else if shared.abandon("cancelled") {
                tracing::info!(
                    "Cancelled encode of {}; removed partial output",
                    shared.descriptor.path().display()
                );
            }
        }

        drop(guard);

        if detach {
            // The thread keeps supervising and stops the encode once the
            // remaining readers are gone.
            drop(handle);
        } else if handle.join().is_err() {
            tracing::error!("Worker for {} panicked", shared.descriptor.path().display());
        }
        Ok(())
    }
}
