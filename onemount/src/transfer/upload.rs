//! Upload manager: replays local mutations to the remote.

use super::{TransferSnapshot, TransferState, MAX_RETRIES, OP_TIMEOUT, PERSIST_EVERY, RETRY_BASE, RETRY_CAP};
use crate::{
    cache::ContentCache,
    metadata::{ItemState, MetadataStore},
    remote::DriveItem,
    sched::Priority,
    status::{FileStatus, StatusPublisher},
    store::{Bucket, Store},
    task::backoff_sleep,
    Error, ItemId, Result, SMALL_UPLOAD_THRESHOLD, CHUNK_SIZE,
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// Invoked when a creation finished under a local id and the server
/// issued the permanent one; rewrites metadata, inode graph and the
/// cached blob.
pub type IdRewrite = Arc<dyn Fn(&ItemId, &DriveItem) -> Result<()> + Send + Sync>;

/// Invoked when the remote rejected the upload with a precondition
/// failure; materializes the conflict copy.
pub type ConflictHook = Arc<dyn Fn(&ItemId) + Send + Sync>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: ItemId,
    /// The local id this session was created under, once rewritten.
    pub old_id: Option<ItemId>,
    pub name: String,
    pub parent_id: ItemId,
    pub etag: Option<String>,
    pub size: u64,
    pub chunk_cursor: u64,
    pub state: TransferState,
    pub retries: u32,
    pub error: Option<String>,
    pub priority: Priority,
    /// Server-side session handle for chunked uploads.
    pub session_ref: Option<String>,
}

pub struct UploadManager {
    high_tx: flume::Sender<ItemId>,
    high_rx: flume::Receiver<ItemId>,
    low_tx: flume::Sender<ItemId>,
    low_rx: flume::Receiver<ItemId>,
    /// Pre-queue FIFO kept for callers that predate the priority
    /// split.
    legacy_tx: flume::Sender<ItemId>,
    legacy_rx: flume::Receiver<ItemId>,
    pending_high: scc::HashSet<ItemId>,
    pending_low: scc::HashSet<ItemId>,
    sessions: scc::HashMap<ItemId, UploadSession>,
    watchers: scc::HashMap<ItemId, watch::Sender<TransferState>>,
    active: AtomicUsize,
    workers: usize,
    remote: Arc<dyn crate::Remote>,
    cache: Arc<ContentCache>,
    meta: Arc<MetadataStore>,
    status: Arc<StatusPublisher>,
    store: Arc<Store>,
    cancel: CancellationToken,
    on_rewrite: RwLock<Option<IdRewrite>>,
    on_conflict: RwLock<Option<ConflictHook>>,
}

impl UploadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn crate::Remote>,
        cache: Arc<ContentCache>,
        meta: Arc<MetadataStore>,
        status: Arc<StatusPublisher>,
        store: Arc<Store>,
        workers: usize,
        queue_cap: usize,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (high_tx, high_rx) = flume::bounded(queue_cap);
        let (low_tx, low_rx) = flume::bounded(queue_cap);
        let (legacy_tx, legacy_rx) = flume::unbounded();
        let manager = Arc::new(UploadManager {
            high_tx,
            high_rx,
            low_tx,
            low_rx,
            legacy_tx,
            legacy_rx,
            pending_high: scc::HashSet::new(),
            pending_low: scc::HashSet::new(),
            sessions: scc::HashMap::new(),
            watchers: scc::HashMap::new(),
            active: AtomicUsize::new(0),
            workers,
            remote,
            cache,
            meta,
            status,
            store,
            cancel: cancel.clone(),
            on_rewrite: RwLock::new(None),
            on_conflict: RwLock::new(None),
        });

        for _ in 0..workers {
            let this = manager.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.worker(cancel).await });
        }

        manager
    }

    pub fn set_id_rewrite(&self, hook: IdRewrite) {
        *self.on_rewrite.write() = Some(hook);
    }

    pub fn set_conflict_hook(&self, hook: ConflictHook) {
        *self.on_conflict.write() = Some(hook);
    }

    /// Re-queue sessions persisted by a previous process; client
    /// crashes must not drop accepted mutations.
    pub fn resume_persisted(&self) -> Result<usize> {
        let mut resumed = 0;
        let mut stale = Vec::new();
        self.store
            .for_each(Bucket::Uploads, |_k, mut session: UploadSession| {
                if !self.meta.contains(&session.id) {
                    stale.push(session.id.clone());
                    return;
                }
                session.state = TransferState::Queued;
                let id = session.id.clone();
                let priority = session.priority;
                let _ = self.sessions.insert(id.clone(), session);
                let watcher = self.ensure_watcher(&id);
                let _ = watcher.send(TransferState::Queued);
                if self.enqueue(&id, priority).is_ok() {
                    resumed += 1;
                }
            })?;
        for id in stale {
            self.store.delete(Bucket::Uploads, id.as_str())?;
        }
        Ok(resumed)
    }

    fn ensure_watcher(&self, id: &ItemId) -> watch::Sender<TransferState> {
        if let Some(tx) = self.watchers.read(id, |_, tx| tx.clone()) {
            return tx;
        }
        let (tx, _rx) = watch::channel(TransferState::Queued);
        let _ = self.watchers.insert(id.clone(), tx.clone());
        tx
    }

    fn enqueue(&self, id: &ItemId, priority: Priority) -> Result<()> {
        let (set, queue) = match priority {
            Priority::High => (&self.pending_high, &self.high_tx),
            Priority::Low => (&self.pending_low, &self.low_tx),
        };
        let _ = set.insert(id.clone());
        if queue.try_send(id.clone()).is_err() {
            set.remove(id);
            return Err(Error::QueueFull);
        }
        Ok(())
    }

    fn make_session(&self, id: &ItemId, priority: Priority) -> Result<Option<UploadSession>> {
        if let Some(existing) = self.get_status(id) {
            if !existing.state.is_terminal() {
                if priority == Priority::High && self.pending_low.remove(id).is_some() {
                    let _ = self.pending_high.insert(id.clone());
                    let _ = self.high_tx.try_send(id.clone());
                    self.sessions.update(id, |_, s| s.priority = Priority::High);
                }
                return Ok(None);
            }
        }

        let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
        if entry.is_directory() {
            return Err(Error::validation("directory mutations upload synchronously"));
        }
        if entry.state != ItemState::DirtyLocal {
            return Err(Error::validation(format!(
                "{} is not dirty, nothing to upload",
                id
            )));
        }
        let parent = entry
            .parent_id
            .clone()
            .ok_or_else(|| Error::invalid("cannot upload the root"))?;

        let session = UploadSession {
            id: id.clone(),
            old_id: None,
            name: entry.name.clone(),
            parent_id: parent,
            etag: entry.etag.clone(),
            size: entry.size,
            chunk_cursor: 0,
            state: TransferState::Queued,
            retries: 0,
            error: None,
            priority,
            session_ref: None,
        };
        // accepted means durable: persist before the queues see it
        self.store.put(Bucket::Uploads, id.as_str(), &session)?;
        let _ = self.sessions.remove(id);
        let _ = self.sessions.insert(id.clone(), session.clone());
        let watcher = self.ensure_watcher(id);
        let _ = watcher.send(TransferState::Queued);
        Ok(Some(session))
    }

    /// Persist a session for the dirty entry and queue it. Duplicates
    /// join the existing session; a higher-priority duplicate promotes
    /// it.
    pub fn queue_upload(&self, id: &ItemId, priority: Priority) -> Result<UploadSession> {
        let session = match self.make_session(id, priority)? {
            Some(session) => session,
            // joined an in-flight session
            None => return Ok(self.get_status(id).ok_or_else(|| Error::not_found(id))?),
        };
        if let Err(e) = self.enqueue(id, priority) {
            self.sessions.remove(id);
            self.store.delete(Bucket::Uploads, id.as_str())?;
            return Err(e);
        }
        Ok(session)
    }

    /// Compatibility path: the unbounded legacy FIFO, used by callers
    /// that cannot surface `QueueFull`.
    pub fn queue_upload_fifo(&self, id: &ItemId) -> Result<UploadSession> {
        let session = match self.make_session(id, Priority::Low)? {
            Some(session) => session,
            None => return Ok(self.get_status(id).ok_or_else(|| Error::not_found(id))?),
        };
        let _ = self.pending_low.insert(id.clone());
        self.legacy_tx
            .send(id.clone())
            .map_err(|_| Error::Cancelled)?;
        Ok(session)
    }

    pub fn get_status(&self, id: &ItemId) -> Option<UploadSession> {
        self.sessions.read(id, |_, s| s.clone())
    }

    /// True while a session is queued (including not yet claimed by a
    /// worker) or actively uploading.
    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.pending_high.contains(id)
            || self.pending_low.contains(id)
            || self
                .get_status(id)
                .map(|s| !s.state.is_terminal())
                .unwrap_or(false)
    }

    pub async fn wait_for_upload(&self, id: &ItemId) -> Result<()> {
        let tx = match self.watchers.read(id, |_, tx| tx.clone()) {
            Some(tx) => tx,
            None => {
                let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
                return match entry.state {
                    ItemState::Hydrated | ItemState::Ghost => Ok(()),
                    other => Err(Error::validation(format!(
                        "no upload in flight for {} in {:?}",
                        id, other
                    ))),
                };
            }
        };

        let mut rx = tx.subscribe();
        loop {
            match *rx.borrow() {
                TransferState::Done => return Ok(()),
                TransferState::Failed => {
                    let reason = self
                        .get_status(id)
                        .and_then(|s| s.error)
                        .unwrap_or_else(|| "upload failed".to_owned());
                    return Err(Error::network(reason));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Drop any queued or persisted session for `id`; called when the
    /// item is deleted locally.
    pub fn cancel(&self, id: &ItemId) -> Result<()> {
        self.pending_high.remove(id);
        self.pending_low.remove(id);
        self.sessions.remove(id);
        self.store.delete(Bucket::Uploads, id.as_str())?;
        if let Some(tx) = self.watchers.read(id, |_, tx| tx.clone()) {
            let _ = tx.send(TransferState::Failed);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            active: self.active.load(Ordering::Relaxed).min(self.workers),
            queue_depth: self.high_tx.len() + self.low_tx.len() + self.legacy_tx.len(),
        }
    }

    async fn worker(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let id = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                id = self.high_rx.recv_async() => id,
                id = self.legacy_rx.recv_async() => id,
                id = self.low_rx.recv_async() => id,
            };
            let id = match id {
                Ok(id) => id,
                Err(_) => break,
            };

            // claiming clears the pending flags; a promoted duplicate
            // loses the race here and is skipped
            let claimed =
                self.pending_high.remove(&id).is_some() || self.pending_low.remove(&id).is_some();
            if !claimed {
                continue;
            }

            self.active.fetch_add(1, Ordering::Relaxed);
            let outcome = self.process(&id).await;
            self.active.fetch_sub(1, Ordering::Relaxed);

            if let Err(e) = outcome {
                self.handle_failure(&id, e).await;
            }
        }
    }

    fn set_state(&self, id: &ItemId, state: TransferState) {
        self.sessions.update(id, |_, s| s.state = state);
        if let Some(tx) = self.watchers.read(id, |_, tx| tx.clone()) {
            let _ = tx.send(state);
        }
    }

    /// Mirror chunk progress into the session map and the store, so
    /// both retries and crashes resume instead of restarting.
    fn persist(&self, session: &UploadSession) -> Result<()> {
        self.sessions.update(&session.id, |_, s| {
            s.chunk_cursor = session.chunk_cursor;
            s.session_ref = session.session_ref.clone();
        });
        self.store.put(Bucket::Uploads, session.id.as_str(), session)
    }

    async fn process(&self, id: &ItemId) -> Result<()> {
        let mut session = match self.get_status(id) {
            Some(s) if !s.state.is_terminal() => s,
            _ => return Ok(()),
        };
        let timer = crate::task::OpTimer::new("upload", id);
        self.set_state(id, TransferState::Active);
        session.state = TransferState::Active;
        self.status.publish(id, FileStatus::Syncing);

        // creations carry no precondition; overwrites guard on the
        // last seen etag
        let if_match = if id.is_local() {
            None
        } else {
            session.etag.clone()
        };

        let item = if session.size <= SMALL_UPLOAD_THRESHOLD {
            let data = self.cache.get(id)?;
            tokio::time::timeout(
                OP_TIMEOUT,
                self.remote
                    .put_small(id, &session.parent_id, &session.name, &data, if_match.as_deref()),
            )
            .await??
        } else {
            self.upload_chunked(id, &mut session, if_match.as_deref()).await?
        };

        self.finish(id, session, item)?;
        drop(timer);
        Ok(())
    }

    async fn upload_chunked(
        &self,
        id: &ItemId,
        session: &mut UploadSession,
        if_match: Option<&str>,
    ) -> Result<DriveItem> {
        let handle = self.cache.open_file(id)?;

        let session_ref = match session.session_ref.clone() {
            Some(r) => r,
            None => {
                let r = tokio::time::timeout(
                    OP_TIMEOUT,
                    self.remote
                        .begin_upload(id, &session.parent_id, &session.name, session.size, if_match),
                )
                .await??;
                session.session_ref = Some(r.clone());
                session.chunk_cursor = 0;
                self.persist(session)?;
                r
            }
        };

        let total_chunks = session.size.div_ceil(CHUNK_SIZE);
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        for chunk in session.chunk_cursor..total_chunks {
            if self.cancel.is_cancelled() {
                self.persist(session)?;
                return Err(Error::Cancelled);
            }
            let offset = chunk * CHUNK_SIZE;
            let len = CHUNK_SIZE.min(session.size - offset) as usize;
            let read = handle.read_at(&mut buf[..len], offset)?;
            if read != len {
                return Err(Error::validation(format!(
                    "short read from cache at {}: {} of {}",
                    offset, read, len
                )));
            }
            let result = tokio::time::timeout(
                OP_TIMEOUT,
                self.remote
                    .upload_chunk(&session_ref, offset, session.size, &buf[..len]),
            )
            .await??;

            session.chunk_cursor = chunk + 1;
            if chunk % PERSIST_EVERY == 0 {
                self.persist(session)?;
            }

            if let Some(item) = result {
                return Ok(item);
            }
        }
        Err(Error::validation("upload session ended without a final item"))
    }

    fn finish(&self, id: &ItemId, mut session: UploadSession, item: DriveItem) -> Result<()> {
        let final_id = item.id.clone();

        if *id != final_id {
            // the server issued a permanent id for a local creation
            session.old_id = Some(id.clone());
            let rewrite = self.on_rewrite.read().clone();
            match rewrite {
                Some(hook) => hook(id, &item)?,
                None => {
                    return Err(Error::validation(
                        "received new id but no rewrite hook is installed",
                    ))
                }
            }
        }

        self.meta.update(&final_id, |e| {
            e.etag = Some(item.etag.clone());
            e.size = item.size;
            e.mtime = item.mtime;
            e.content_hash = item.content_hash.clone();
        })?;
        self.meta
            .transition_state(&final_id, ItemState::Hydrated, true)?;

        self.store.delete(Bucket::Uploads, id.as_str())?;
        self.sessions.update(id, |_, s| {
            *s = session;
            s.state = TransferState::Done;
        });
        self.set_state(id, TransferState::Done);
        debug!(id = %id, new_id = %final_id, "upload complete");
        Ok(())
    }

    async fn handle_failure(&self, id: &ItemId, err: Error) {
        if err.is_cancelled() {
            // leave the persisted session; the next run resumes it
            return;
        }

        if let Error::Conflict { .. } = err {
            warn!(id = %id, op = "upload", "precondition failed, remote changed underneath");
            if let Ok(entry) = self.meta.transition_state(id, ItemState::Conflict, false) {
                debug_assert_eq!(entry.state, ItemState::Conflict);
            }
            let hook = self.on_conflict.read().clone();
            if let Some(hook) = hook {
                hook(id);
            }
            let _ = self.store.delete(Bucket::Uploads, id.as_str());
            self.sessions.update(id, |_, s| s.error = Some(err.to_string()));
            self.set_state(id, TransferState::Failed);
            return;
        }

        let (retries, session_ref, priority) = self
            .sessions
            .update(id, |_, s| {
                s.retries += 1;
                s.error = Some(err.to_string());
                (s.retries, s.session_ref.clone(), s.priority)
            })
            .unwrap_or((MAX_RETRIES, None, Priority::Low));

        if err.is_transient() && retries < MAX_RETRIES {
            debug!(id = %id, err = %err, retries, "transient upload failure, retrying");
            if backoff_sleep(retries, RETRY_BASE, RETRY_CAP, &self.cancel).await
                && self.enqueue(id, priority).is_ok()
            {
                return;
            }
            if self.cancel.is_cancelled() {
                // shutdown interrupted the retry; the persisted
                // session resumes next run
                return;
            }
        }

        warn!(id = %id, op = "upload", err = %err, "upload failed permanently");
        if let Some(session_ref) = session_ref {
            let _ = self.remote.cancel_upload(&session_ref).await;
        }
        // the entry stays dirty so the data survives for a later push
        self.status.publish(id, FileStatus::Error);
        let _ = self.store.delete(Bucket::Uploads, id.as_str());
        self.set_state(id, TransferState::Failed);
    }

    pub async fn stop(&self, grace: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        if self.active.load(Ordering::Relaxed) > 0 {
            warn!("upload workers still active at shutdown deadline");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        metadata::Entry,
        remote::test::{MockRemote, ROOT_ID},
    };

    struct Rig {
        _dir: tempfile::TempDir,
        remote: Arc<MockRemote>,
        cache: Arc<ContentCache>,
        meta: Arc<MetadataStore>,
        manager: Arc<UploadManager>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let cache = ContentCache::open(dir.path().join("content"), 0, 100).unwrap();
        let meta = MetadataStore::open(store.clone()).unwrap();
        let status = Arc::new(StatusPublisher::default());
        let remote = MockRemote::new();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let manager = UploadManager::new(
            remote.clone(),
            cache.clone(),
            meta.clone(),
            status,
            store,
            2,
            64,
            cancel.clone(),
            &tracker,
        );
        Rig {
            _dir: dir,
            remote,
            cache,
            meta,
            manager,
            cancel,
            tracker,
        }
    }

    impl Rig {
        /// A dirty local file as the write path would leave it.
        fn dirty_file(&self, id: &str, name: &str, content: &[u8]) {
            let mut entry = Entry::new_file(id.into(), ROOT_ID.into(), name);
            entry.state = ItemState::DirtyLocal;
            entry.size = content.len() as u64;
            self.meta.save(entry).unwrap();
            self.cache.insert(&id.into(), content).unwrap();
        }

        async fn shutdown(self) {
            self.cancel.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn small_upload_creates_remote_item_and_rewrites_id() {
        let rig = rig();
        let local = ItemId::fresh_local();
        rig.dirty_file(local.as_str(), "new.txt", b"fresh content");

        let meta = rig.meta.clone();
        let cache = rig.cache.clone();
        rig.manager.set_id_rewrite(Arc::new(move |old, item| {
            let mut entry = meta.get(old).unwrap();
            entry.id = item.id.clone();
            meta.save(entry)?;
            meta.delete(old)?;
            cache.move_id(old, &item.id)?;
            Ok(())
        }));

        rig.manager.queue_upload(&local, Priority::High).unwrap();
        rig.manager.wait_for_upload(&local).await.unwrap();

        let created = rig.remote.item_named(ROOT_ID, "new.txt").expect("item on server");
        assert!(!created.id.is_local());
        assert_eq!(rig.remote.content_of(created.id.as_str()).unwrap(), b"fresh content");
        let entry = rig.meta.get(&created.id).unwrap();
        assert_eq!(entry.state, ItemState::Hydrated);
        assert!(entry.pending_remote.is_none());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn precondition_failure_marks_conflict() {
        let rig = rig();
        let item = rig.remote.seed_file("f1", ROOT_ID, "f.txt", b"server v1");
        let mut entry = Entry::from_remote(&item);
        entry.state = ItemState::DirtyLocal;
        rig.meta.save(entry).unwrap();
        rig.cache.insert(&"f1".into(), b"local edit").unwrap();

        // server moves on; our etag is now stale
        rig.remote.seed_file("f1", ROOT_ID, "f.txt", b"server v2");

        let conflicted: Arc<parking_lot::Mutex<Vec<ItemId>>> = Arc::default();
        let sink = conflicted.clone();
        rig.manager
            .set_conflict_hook(Arc::new(move |id| sink.lock().push(id.clone())));

        rig.manager.queue_upload(&"f1".into(), Priority::High).unwrap();
        let err = rig.manager.wait_for_upload(&"f1".into()).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));

        assert_eq!(rig.meta.get(&"f1".into()).unwrap().state, ItemState::Conflict);
        assert_eq!(conflicted.lock().as_slice(), &[ItemId::from("f1")]);
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_sees_queued_but_unclaimed_sessions() {
        let rig = rig();
        rig.dirty_file("f1", "f.txt", b"payload");
        rig.remote.set_offline(true);

        rig.manager.queue_upload(&"f1".into(), Priority::Low).unwrap();
        assert!(rig.manager.is_pending(&"f1".into()));

        rig.remote.set_offline(false);
        rig.manager.wait_for_upload(&"f1".into()).await.unwrap();
        assert!(!rig.manager.is_pending(&"f1".into()));
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_drops_session() {
        let rig = rig();
        rig.dirty_file("f1", "f.txt", b"payload");
        rig.remote.set_offline(true);

        rig.manager.queue_upload(&"f1".into(), Priority::Low).unwrap();
        rig.manager.cancel(&"f1".into()).unwrap();
        assert!(rig.manager.get_status(&"f1".into()).is_none());
        rig.shutdown().await;
    }
}
