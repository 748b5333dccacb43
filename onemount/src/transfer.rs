//! Chunked, resumable content transfer in both directions.
//!
//! Download and upload managers share the session vocabulary here:
//! persisted session records so crashes resume instead of restarting,
//! per-id single-flight, bounded worker pools and watch channels for
//! `wait_for_*` callers.

use std::time::Duration;

mod download;
mod upload;

pub use download::{DownloadManager, DownloadSession};
pub use upload::{IdRewrite, UploadManager, UploadSession};

/// Per-chunk network operation timeout.
pub(crate) const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Transient failures retry with back-off up to this many attempts.
pub(crate) const MAX_RETRIES: u32 = 5;

pub(crate) const RETRY_BASE: Duration = Duration::from_millis(100);
pub(crate) const RETRY_CAP: Duration = Duration::from_secs(5);

/// Session state persisted every this many chunks.
pub(crate) const PERSIST_EVERY: u64 = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum TransferState {
    Queued,
    Active,
    Done,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }
}

/// Point-in-time view of a manager's load. `active` never exceeds the
/// worker count.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferSnapshot {
    pub active: usize,
    pub queue_depth: usize,
}
