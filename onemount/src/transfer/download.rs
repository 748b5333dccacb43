//! Download manager: hydrates ghost files into the content cache.

use super::{TransferSnapshot, TransferState, MAX_RETRIES, OP_TIMEOUT, PERSIST_EVERY, RETRY_BASE, RETRY_CAP};
use crate::{
    cache::ContentCache,
    metadata::{ItemState, MetadataStore},
    status::{FileStatus, StatusPublisher},
    store::{Bucket, Store},
    task::backoff_sleep,
    Error, ItemId, QuickHasher, Result, CHUNK_SIZE,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// Sessions larger than this are persisted so a crash resumes rather
/// than restarts.
const PERSIST_THRESHOLD: u64 = CHUNK_SIZE;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: ItemId,
    pub size: u64,
    pub etag: Option<String>,
    pub bytes_downloaded: u64,
    pub last_successful_chunk: i64,
    pub total_chunks: u64,
    pub state: TransferState,
    pub can_resume: bool,
    pub error: Option<String>,
    pub retries: u32,
}

impl DownloadSession {
    fn new(id: ItemId, size: u64, etag: Option<String>) -> Self {
        DownloadSession {
            id,
            size,
            etag,
            bytes_downloaded: 0,
            last_successful_chunk: -1,
            total_chunks: size.div_ceil(CHUNK_SIZE).max(1),
            state: TransferState::Queued,
            can_resume: size > PERSIST_THRESHOLD,
            error: None,
            retries: 0,
        }
    }

    fn reset(&mut self, size: u64, etag: Option<String>) {
        self.size = size;
        self.etag = etag;
        self.bytes_downloaded = 0;
        self.last_successful_chunk = -1;
        self.total_chunks = size.div_ceil(CHUNK_SIZE).max(1);
    }
}

pub struct DownloadManager {
    queue_tx: flume::Sender<ItemId>,
    queue_rx: flume::Receiver<ItemId>,
    sessions: scc::HashMap<ItemId, DownloadSession>,
    watchers: scc::HashMap<ItemId, watch::Sender<TransferState>>,
    active: AtomicUsize,
    workers: usize,
    remote: Arc<dyn crate::Remote>,
    cache: Arc<ContentCache>,
    meta: Arc<MetadataStore>,
    status: Arc<StatusPublisher>,
    store: Arc<Store>,
    cancel: CancellationToken,
}

impl DownloadManager {
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
        let (queue_tx, queue_rx) = flume::bounded(queue_cap);
        let manager = Arc::new(DownloadManager {
            queue_tx,
            queue_rx,
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
        });

        for _ in 0..workers {
            let this = manager.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.worker(cancel).await });
        }

        manager
    }

    /// Re-queue sessions persisted by a previous process.
    pub fn resume_persisted(&self) -> Result<usize> {
        let mut resumed = 0;
        let mut stale = Vec::new();
        self.store
            .for_each(Bucket::Downloads, |_k, mut session: DownloadSession| {
                if !self.meta.contains(&session.id) {
                    stale.push(session.id.clone());
                    return;
                }
                session.state = TransferState::Queued;
                let id = session.id.clone();
                let _ = self.sessions.insert(id.clone(), session);
                self.ensure_watcher(&id);
                if self.queue_tx.try_send(id.clone()).is_ok() {
                    resumed += 1;
                } else {
                    warn!(id = %id, "download queue full during resume");
                }
            })?;
        for id in stale {
            self.store.delete(Bucket::Downloads, id.as_str())?;
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

    /// Enqueue hydration of `id`, deduplicating against any session
    /// already in flight.
    pub fn queue_download(&self, id: &ItemId) -> Result<DownloadSession> {
        if let Some(existing) = self.get_status(id) {
            if !existing.state.is_terminal() {
                return Ok(existing);
            }
        }

        let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
        if entry.is_directory() {
            return Err(Error::validation("directories have no content to download"));
        }
        match entry.state {
            ItemState::DirtyLocal | ItemState::Conflict => {
                return Err(Error::validation(format!(
                    "{} has local changes; refusing to overwrite",
                    id
                )));
            }
            ItemState::Hydrated => {
                let mut done = DownloadSession::new(id.clone(), entry.size, entry.etag);
                done.state = TransferState::Done;
                return Ok(done);
            }
            ItemState::Ghost => {
                self.meta.transition_state(id, ItemState::Hydrating, false)?;
            }
            ItemState::Hydrating => {}
        }

        let session = DownloadSession::new(id.clone(), entry.size, entry.etag);
        if session.can_resume {
            self.store.put(Bucket::Downloads, id.as_str(), &session)?;
        }
        let _ = self.sessions.remove(id);
        let _ = self.sessions.insert(id.clone(), session.clone());
        let watcher = self.ensure_watcher(id);
        let _ = watcher.send(TransferState::Queued);

        if self.queue_tx.try_send(id.clone()).is_err() {
            self.sessions.remove(id);
            self.store.delete(Bucket::Downloads, id.as_str())?;
            // roll hydration back so a later attempt can restart it
            let _ = self.meta.transition_state(id, ItemState::Ghost, false);
            return Err(Error::QueueFull);
        }
        self.status.publish(id, FileStatus::Downloading);
        Ok(session)
    }

    pub fn get_status(&self, id: &ItemId) -> Option<DownloadSession> {
        self.sessions.read(id, |_, s| s.clone())
    }

    /// Block until the session for `id` reaches a terminal state.
    pub async fn wait_for_download(&self, id: &ItemId) -> Result<()> {
        let tx = match self.watchers.read(id, |_, tx| tx.clone()) {
            Some(tx) => tx,
            None => {
                // nothing queued; already hydrated counts as success
                let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
                return if entry.state == ItemState::Hydrated {
                    Ok(())
                } else {
                    Err(Error::not_found(id))
                };
            }
        };

        let mut rx = tx.subscribe();
        loop {
            let state = *rx.borrow();
            match state {
                TransferState::Done => return Ok(()),
                TransferState::Failed => {
                    let reason = self
                        .get_status(id)
                        .and_then(|s| s.error)
                        .unwrap_or_else(|| "download failed".to_owned());
                    return Err(Error::network(reason));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            active: self.active.load(Ordering::Relaxed).min(self.workers),
            queue_depth: self.queue_tx.len(),
        }
    }

    async fn worker(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let id = tokio::select! {
                _ = cancel.cancelled() => break,
                id = self.queue_rx.recv_async() => match id {
                    Ok(id) => id,
                    Err(_) => break,
                },
            };

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

    /// Mirror progress into the session map (so retries resume) and,
    /// for resumable sessions, into the store (so crashes resume).
    fn persist(&self, session: &DownloadSession) -> Result<()> {
        self.sessions.update(&session.id, |_, s| {
            let (state, retries, error) = (s.state, s.retries, s.error.clone());
            *s = session.clone();
            s.state = state;
            s.retries = retries;
            if s.error.is_none() {
                s.error = error;
            }
        });
        if session.can_resume {
            self.store.put(Bucket::Downloads, session.id.as_str(), session)?;
        }
        Ok(())
    }

    async fn process(&self, id: &ItemId) -> Result<()> {
        let mut session = match self.get_status(id) {
            Some(s) if !s.state.is_terminal() => s,
            _ => return Ok(()),
        };
        let timer = crate::task::OpTimer::new("download", id);
        self.set_state(id, TransferState::Active);
        session.state = TransferState::Active;

        // revalidate against the server; a changed etag restarts the
        // transfer with the new content version
        let item = tokio::time::timeout(OP_TIMEOUT, self.remote.item(id)).await??;
        if session.etag.as_deref() != Some(item.etag.as_str()) {
            if session.last_successful_chunk >= 0 {
                debug!(id = %id, "etag changed mid-session, restarting");
            }
            session.reset(item.size, Some(item.etag.clone()));
        }

        let handle = self.cache.open_file(id)?;
        let start_chunk = if session.can_resume && session.last_successful_chunk >= 0 {
            session.last_successful_chunk as u64 + 1
        } else {
            0
        };

        for chunk in start_chunk..session.total_chunks {
            if self.cancel.is_cancelled() {
                self.persist(&session)?;
                return Err(Error::Cancelled);
            }
            let offset = chunk * CHUNK_SIZE;
            let len = CHUNK_SIZE.min(session.size.saturating_sub(offset));
            let data = tokio::time::timeout(OP_TIMEOUT, self.remote.download_range(id, offset, len))
                .await??;
            if data.len() as u64 != len {
                return Err(Error::validation(format!(
                    "short read at chunk {}: {} of {} bytes",
                    chunk,
                    data.len(),
                    len
                )));
            }
            handle.write_at(&data, offset)?;
            session.bytes_downloaded += data.len() as u64;
            session.last_successful_chunk = chunk as i64;
            if chunk % PERSIST_EVERY == 0 || chunk + 1 == session.total_chunks {
                self.persist(&session)?;
            }
        }

        handle.set_len(session.size)?;
        handle.sync()?;

        // integrity: verify against the server hash, or record ours
        // for later delta equality decisions
        let computed = self.hash_file(&handle, session.size)?;
        if let Some(ref server_hash) = item.content_hash {
            if *server_hash != computed {
                self.cache.delete(id)?;
                return Err(Error::validation(format!(
                    "content hash mismatch for {}",
                    id
                )));
            }
        }
        drop(handle);

        self.meta.update(id, |e| {
            e.size = session.size;
            e.etag = Some(item.etag.clone());
            e.mtime = item.mtime;
            e.content_hash = Some(computed.clone());
        })?;
        self.meta.transition_state(id, ItemState::Hydrated, false)?;

        self.store.delete(Bucket::Downloads, id.as_str())?;
        self.sessions.update(id, |_, s| {
            *s = session.clone();
            s.state = TransferState::Done;
        });
        self.set_state(id, TransferState::Done);
        drop(timer);
        Ok(())
    }

    fn hash_file(&self, handle: &crate::cache::CacheHandle, size: u64) -> Result<String> {
        let mut hasher = QuickHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        while offset < size {
            let n = handle.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(hasher.finish())
    }

    async fn handle_failure(&self, id: &ItemId, err: Error) {
        if err.is_cancelled() {
            return;
        }

        let retries = self
            .sessions
            .update(id, |_, s| {
                s.retries += 1;
                s.error = Some(err.to_string());
                s.retries
            })
            .unwrap_or(MAX_RETRIES);

        if err.is_transient() && retries < MAX_RETRIES {
            debug!(id = %id, err = %err, retries, "transient download failure, retrying");
            if backoff_sleep(retries, RETRY_BASE, RETRY_CAP, &self.cancel).await
                && self.queue_tx.send_async(id.clone()).await.is_ok()
            {
                return;
            }
            if self.cancel.is_cancelled() {
                // shutdown interrupted the retry; not a failure
                return;
            }
        }

        warn!(id = %id, op = "download", err = %err, "download failed");
        let _ = self.cache.delete(id);
        let _ = self.meta.transition_state(id, ItemState::Ghost, false);
        self.status.publish(id, FileStatus::Error);
        let _ = self.store.delete(Bucket::Downloads, id.as_str());
        self.set_state(id, TransferState::Failed);
    }

    /// Drain-stop: cancellation is signalled by the shared token; this
    /// waits for workers to observe it.
    pub async fn stop(&self, grace: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        if self.active.load(Ordering::Relaxed) > 0 {
            warn!("download workers still active at shutdown deadline");
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
        manager: Arc<DownloadManager>,
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
        let manager = DownloadManager::new(
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
        fn seed(&self, id: &str, content: &[u8]) {
            let item = self.remote.seed_file(id, ROOT_ID, &format!("{}.bin", id), content);
            let entry = Entry::from_remote(&item);
            self.meta.save(entry).unwrap();
        }

        async fn shutdown(self) {
            self.cancel.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hydrates_ghost_file() {
        let rig = rig();
        rig.seed("f1", b"hello world");

        rig.manager.queue_download(&"f1".into()).unwrap();
        rig.manager.wait_for_download(&"f1".into()).await.unwrap();

        assert_eq!(rig.cache.get(&"f1".into()).unwrap(), b"hello world");
        let entry = rig.meta.get(&"f1".into()).unwrap();
        assert_eq!(entry.state, ItemState::Hydrated);
        assert_eq!(entry.content_hash.as_deref(), Some(crate::quick_hash(b"hello world").as_str()));
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_queue_is_single_flight() {
        let rig = rig();
        rig.seed("f1", b"data");

        let first = rig.manager.queue_download(&"f1".into()).unwrap();
        let second = rig.manager.queue_download(&"f1".into()).unwrap();
        assert_eq!(first.id, second.id);
        rig.manager.wait_for_download(&"f1".into()).await.unwrap();

        let snapshot = rig.manager.snapshot();
        assert!(snapshot.active <= 2);
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refuses_overwrite_of_dirty_file() {
        let rig = rig();
        rig.seed("f1", b"server");
        rig.meta
            .update(&"f1".into(), |e| e.state = ItemState::DirtyLocal)
            .unwrap();

        let err = rig.manager.queue_download(&"f1".into()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn offline_failure_reports_error_after_retries() {
        let rig = rig();
        rig.seed("f1", b"data");
        rig.remote.set_offline(true);

        rig.manager.queue_download(&"f1".into()).unwrap();
        let err = rig.manager.wait_for_download(&"f1".into()).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));

        let entry = rig.meta.get(&"f1".into()).unwrap();
        assert_eq!(entry.state, ItemState::Ghost);
        rig.shutdown().await;
    }
}
