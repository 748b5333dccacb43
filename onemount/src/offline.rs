//! Durable journal of mutations issued while disconnected.
//!
//! Every offline mutation appends a record keyed by its timestamp, so
//! replay after reconnection processes them in issue order. Records
//! are deleted individually as they succeed; a failing record is
//! logged and skipped so one bad entry cannot wedge the queue.

use crate::{
    store::{Bucket, Store},
    task::unix_nanos,
    ItemId, Result,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ItemId,
    pub kind: ChangeKind,
    /// Unix nanoseconds; the replay order.
    pub timestamp: u64,
    pub path: String,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

impl ChangeRecord {
    pub fn new(id: ItemId, kind: ChangeKind, path: impl Into<String>) -> Self {
        ChangeRecord {
            id,
            kind,
            timestamp: unix_nanos(),
            path: path.into(),
            old_path: None,
            new_path: None,
        }
    }

    pub fn rename(id: ItemId, old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        let new_path = new_path.into();
        ChangeRecord {
            id,
            kind: ChangeKind::Rename,
            timestamp: unix_nanos(),
            path: new_path.clone(),
            old_path: Some(old_path.into()),
            new_path: Some(new_path),
        }
    }
}

/// The filesystem-level operations replay needs; implemented by
/// [`Filesystem`](crate::Filesystem).
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Queue a low-priority upload of the item's current content.
    async fn replay_upload(&self, id: &ItemId) -> Result<()>;

    /// Delete the item on the remote.
    async fn replay_remote_delete(&self, id: &ItemId) -> Result<()>;

    /// Re-apply a rename by path, resolving both parents.
    async fn replay_move_path(&self, old_path: &str, new_path: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayStats {
    pub replayed: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct ChangeJournal {
    store: Arc<Store>,
    seq: AtomicU64,
}

impl ChangeJournal {
    pub fn new(store: Arc<Store>) -> Self {
        ChangeJournal {
            store,
            seq: AtomicU64::new(0),
        }
    }

    /// Big-endian timestamp keys keep the bucket iteration in replay
    /// order; the sequence tail breaks same-nanosecond ties.
    fn key(&self, record: &ChangeRecord) -> Vec<u8> {
        let mut key = record.timestamp.to_be_bytes().to_vec();
        key.extend_from_slice(&self.seq.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        key
    }

    pub fn record(&self, record: ChangeRecord) -> Result<()> {
        let key = self.key(&record);
        self.store.batch(|b| b.put(Bucket::OfflineChanges, &key, &record))
    }

    pub fn pending(&self) -> Result<Vec<(Vec<u8>, ChangeRecord)>> {
        let mut records = Vec::new();
        self.store
            .for_each(Bucket::OfflineChanges, |key, record: ChangeRecord| {
                records.push((key.to_vec(), record));
            })?;
        Ok(records)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.pending()?.is_empty())
    }

    /// Replay every record in timestamp order against `target`.
    pub async fn replay(
        &self,
        target: &dyn ReplayTarget,
        cancel: &CancellationToken,
    ) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        for (key, record) in self.pending()? {
            if cancel.is_cancelled() {
                return Err(crate::Error::Cancelled);
            }

            let outcome = match record.kind {
                ChangeKind::Create | ChangeKind::Modify => target.replay_upload(&record.id).await,
                ChangeKind::Delete => {
                    if record.id.is_local() {
                        // never reached the server; nothing to delete
                        stats.dropped += 1;
                        self.store.delete(Bucket::OfflineChanges, &key)?;
                        continue;
                    }
                    target.replay_remote_delete(&record.id).await
                }
                ChangeKind::Rename => match (&record.old_path, &record.new_path) {
                    (Some(old), Some(new)) => target.replay_move_path(old, new).await,
                    _ => {
                        warn!(id = %record.id, "rename record without paths, dropping");
                        stats.dropped += 1;
                        self.store.delete(Bucket::OfflineChanges, &key)?;
                        continue;
                    }
                },
            };

            match outcome {
                Ok(()) => {
                    stats.replayed += 1;
                    self.store.delete(Bucket::OfflineChanges, &key)?;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(id = %record.id, op = ?record.kind, err = %e, "replay failed, continuing");
                    stats.failed += 1;
                }
            }
        }

        info!(
            replayed = stats.replayed,
            dropped = stats.dropped,
            failed = stats.failed,
            "offline change replay finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        ops: Mutex<Vec<String>>,
        fail_deletes: bool,
    }

    #[async_trait]
    impl ReplayTarget for RecordingTarget {
        async fn replay_upload(&self, id: &ItemId) -> Result<()> {
            self.ops.lock().push(format!("upload:{}", id));
            Ok(())
        }

        async fn replay_remote_delete(&self, id: &ItemId) -> Result<()> {
            if self.fail_deletes {
                return Err(crate::Error::network("unreachable"));
            }
            self.ops.lock().push(format!("delete:{}", id));
            Ok(())
        }

        async fn replay_move_path(&self, old: &str, new: &str) -> Result<()> {
            self.ops.lock().push(format!("move:{}->{}", old, new));
            Ok(())
        }
    }

    fn journal() -> (tempfile::TempDir, ChangeJournal) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (dir, ChangeJournal::new(store))
    }

    #[tokio::test]
    async fn replays_in_timestamp_order_and_clears() {
        let (_dir, journal) = journal();
        journal
            .record(ChangeRecord::new("a".into(), ChangeKind::Create, "/a"))
            .unwrap();
        journal
            .record(ChangeRecord::new("b".into(), ChangeKind::Modify, "/b"))
            .unwrap();
        journal
            .record(ChangeRecord::rename("c".into(), "/c", "/c2"))
            .unwrap();

        let target = RecordingTarget::default();
        let stats = journal
            .replay(&target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.replayed, 3);
        assert_eq!(
            target.ops.lock().as_slice(),
            &[
                "upload:a".to_owned(),
                "upload:b".to_owned(),
                "move:/c->/c2".to_owned()
            ]
        );
        assert!(journal.is_empty().unwrap());
    }

    #[tokio::test]
    async fn local_only_deletes_are_dropped() {
        let (_dir, journal) = journal();
        journal
            .record(ChangeRecord::new(
                ItemId::fresh_local(),
                ChangeKind::Delete,
                "/gone",
            ))
            .unwrap();
        journal
            .record(ChangeRecord::new("remote-9".into(), ChangeKind::Delete, "/kept"))
            .unwrap();

        let target = RecordingTarget::default();
        let stats = journal
            .replay(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.replayed, 1);
        assert_eq!(target.ops.lock().as_slice(), &["delete:remote-9".to_owned()]);
    }

    #[tokio::test]
    async fn failures_leave_record_for_next_pass() {
        let (_dir, journal) = journal();
        journal
            .record(ChangeRecord::new("remote-1".into(), ChangeKind::Delete, "/x"))
            .unwrap();

        let target = RecordingTarget {
            fail_deletes: true,
            ..Default::default()
        };
        let stats = journal
            .replay(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(journal.pending().unwrap().len(), 1);
    }
}
