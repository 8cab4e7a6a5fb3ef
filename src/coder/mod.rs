//! Streaming transcoder core.
//!
//! - [`lock`]: cross-process locks keyed by source path
//! - [`worker`]: reuse/attach/encode decision and encoder supervision
//! - [`stream`]: the blocking `Read` + `Seek` view of a growing output
//! - `teardown`: last-reader-deletes shutdown

pub mod error;
pub mod lock;
pub mod settings;
pub mod stream;
mod teardown;
pub mod worker;

pub use error::{Error, Result};
pub use lock::{lock_name, LockCoordinator};
pub use settings::{default_lock_dir, CoderSettings, StaleMarkerPolicy, DEFAULT_POLL_INTERVAL};
pub use stream::{CancelHandle, GrowingFileStream};
pub use worker::{Origin, TranscodeWorker, WorkerState};
