//! The filesystem facade.
//!
//! Owns every engine component, wires their callbacks together and
//! exposes the kernel-boundary operations over node ids. A thin
//! adapter translates these into the host's filesystem interface; all
//! engine semantics live here and below.

use crate::{
    cache::ContentCache,
    config::Config,
    conflict,
    delta::{DeltaDeps, DeltaHooks, DeltaLoop},
    inode::{InodeGraph, VirtualFile},
    metadata::{Entry, ItemKind, ItemState, MetadataStore, PendingRemote, Pin},
    offline::{ChangeJournal, ChangeKind, ChangeRecord, ReplayTarget},
    realtime::Notifier,
    remote::DriveItem,
    sched::{Fetched, MetadataScheduler, Priority, Request, SchedulerStats},
    status::{FileStatus, StatusPublisher},
    store::Store,
    task::unix_secs,
    transfer::{DownloadManager, TransferSnapshot, UploadManager},
    Error, ItemId, NodeId, Remote, Result, CHUNK_SIZE,
};
use async_trait::async_trait;
use libc::c_int;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Characters the remote store refuses in item names.
const RESTRICTED_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '/', '\\', '|'];
const RESTRICTED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

/// POSIX-facing attributes of a node.
#[derive(Clone, Copy, Debug)]
pub struct Attr {
    pub node: NodeId,
    pub size: u64,
    pub mtime: u64,
    pub kind: ItemKind,
    pub nlink: u32,
}

#[derive(Clone, Debug)]
pub struct DirEntryOut {
    pub name: String,
    pub node: NodeId,
    pub kind: ItemKind,
}

/// Aggregated engine statistics for logs and the IPC surface.
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    pub cache_bytes: u64,
    pub cache_files: usize,
    pub open_files: usize,
    pub metadata: SchedulerStats,
    pub downloads: TransferSnapshot,
    pub uploads: TransferSnapshot,
    pub offline: bool,
}

type KernelResult<T> = std::result::Result<T, c_int>;

pub struct Filesystem {
    config: Config,
    remote: Arc<dyn Remote>,
    store: Arc<Store>,
    cache: Arc<ContentCache>,
    thumbnails: Arc<ContentCache>,
    meta: Arc<MetadataStore>,
    sched: Arc<MetadataScheduler>,
    graph: Arc<InodeGraph>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    status: Arc<StatusPublisher>,
    journal: Arc<ChangeJournal>,
    delta: RwLock<Option<Arc<DeltaLoop>>>,
    offline: Arc<AtomicBool>,
    last_foreground: Arc<AtomicU64>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Filesystem {
    /// Build and wire the whole engine. Background loops are not
    /// running yet; call [`start`](Self::start) afterwards.
    pub async fn new(config: Config, remote: Arc<dyn Remote>) -> Result<Arc<Filesystem>> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_dir)?;

        let store = Arc::new(Store::open(&config.cache_dir)?);
        let meta = MetadataStore::open(store.clone())?;
        let cache = ContentCache::open(
            config.cache_dir.join("content"),
            config.max_cache_size_bytes,
            config.open_file_limit,
        )?;
        let thumbnails = ContentCache::open(config.cache_dir.join("thumbnails"), 0, 64)?;
        let status = Arc::new(StatusPublisher::default());
        let journal = Arc::new(ChangeJournal::new(store.clone()));

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let workers = &config.workers;
        let sched = MetadataScheduler::new(
            remote.clone(),
            workers.metadata_workers,
            workers.metadata_high_queue,
            workers.metadata_low_queue,
            config.timeouts.metadata_request_timeout,
            cancel.child_token(),
            &tracker,
        );
        let downloads = DownloadManager::new(
            remote.clone(),
            cache.clone(),
            meta.clone(),
            status.clone(),
            store.clone(),
            workers.download_workers,
            workers.download_queue,
            cancel.child_token(),
            &tracker,
        );
        let uploads = UploadManager::new(
            remote.clone(),
            cache.clone(),
            meta.clone(),
            status.clone(),
            store.clone(),
            workers.upload_workers,
            workers.download_queue,
            cancel.child_token(),
            &tracker,
        );
        let graph = InodeGraph::new(meta.clone(), sched.clone(), remote.clone(), cache.clone());

        let fs = Arc::new(Filesystem {
            config,
            remote,
            store,
            cache,
            thumbnails,
            meta,
            sched,
            graph,
            downloads,
            uploads,
            status,
            journal,
            delta: RwLock::new(None),
            offline: Arc::new(AtomicBool::new(false)),
            last_foreground: Arc::new(AtomicU64::new(0)),
            cancel,
            tracker,
            stopped: AtomicBool::new(false),
        });

        fs.wire();
        fs.install_root().await?;

        let deps = DeltaDeps {
            remote: fs.remote.clone(),
            meta: fs.meta.clone(),
            graph: fs.graph.clone(),
            cache: fs.cache.clone(),
            downloads: fs.downloads.clone(),
            status: fs.status.clone(),
            store: fs.store.clone(),
            journal: fs.journal.clone(),
            hooks: fs.clone(),
            replay: fs.clone(),
            realtime: fs.spawn_realtime(),
            offline: fs.offline.clone(),
            last_foreground: fs.last_foreground.clone(),
            config: fs.config.clone(),
            cancel: fs.cancel.child_token(),
        };
        *fs.delta.write() = Some(DeltaLoop::new(deps));

        Ok(fs)
    }

    /// Connect the callback seams between components.
    fn wire(self: &Arc<Self>) {
        let status = self.status.clone();
        self.meta.set_transition_hook(Arc::new(move |entry| {
            status.publish(&entry.id, FileStatus::from_entry(entry));
        }));

        let guard_meta = self.meta.clone();
        self.cache.set_eviction_guard(Arc::new(move |id| {
            match guard_meta.get(id) {
                // only clean hydrated, unpinned content may go
                Some(entry) => entry.state == ItemState::Hydrated && entry.pin != Pin::Always,
                None => true,
            }
        }));

        let evict_meta = self.meta.clone();
        self.cache.set_eviction_handler(Arc::new(move |id| {
            if let Err(e) = evict_meta.transition_state(id, ItemState::Ghost, false) {
                warn!(id = %id, err = %e, "eviction state flip failed");
            }
        }));

        let graph = Arc::downgrade(&self.graph);
        self.sched.set_apply(Arc::new(move |request, fetched| {
            let graph = match graph.upgrade() {
                Some(graph) => graph,
                None => return,
            };
            match (request, fetched) {
                (Request::Children(parent), Fetched::Children(items)) => {
                    if let Err(e) = graph.apply_children(parent, items) {
                        debug!(id = %parent, err = %e, "children apply skipped");
                    }
                }
                (_, Fetched::Item(item)) => {
                    if item.deleted {
                        return;
                    }
                    let _ = graph.insert_id(Entry::from_remote(item));
                }
                _ => {}
            }
        }));

        let uploads = self.uploads.clone();
        self.graph.set_delete_hook(Arc::new(move |id| {
            let _ = uploads.cancel(id);
        }));

        let graph = Arc::downgrade(&self.graph);
        self.uploads.set_id_rewrite(Arc::new(move |old, item| {
            match graph.upgrade() {
                Some(graph) => graph.move_id(old, item),
                None => Err(Error::Cancelled),
            }
        }));

        let fs = Arc::downgrade(self);
        self.uploads.set_conflict_hook(Arc::new(move |id| {
            let fs = match fs.upgrade() {
                Some(fs) => fs,
                None => return,
            };
            let id = id.clone();
            tokio::spawn(async move {
                match fs.remote.item(&id).await {
                    Ok(item) => {
                        if let Err(e) = fs.materialize_conflict(&id, &item).await {
                            warn!(id = %id, err = %e, "conflict copy failed");
                        }
                    }
                    Err(e) => warn!(id = %id, err = %e, "conflict copy fetch failed"),
                }
            });
        }));
    }

    async fn install_root(&self) -> Result<()> {
        if let Some(root) = self.meta.find_root() {
            self.graph.ensure_root(Some(root))?;
            return Ok(());
        }
        match self.remote.item_by_path("/").await {
            Ok(item) => {
                self.graph.ensure_root(Some(Entry::from_remote(&item)))?;
            }
            Err(e) if e.is_transient() => {
                // cold start without connectivity
                info!("remote unreachable at mount, starting offline with synthetic root");
                self.offline.store(true, Ordering::SeqCst);
                self.graph.ensure_root(None)?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn spawn_realtime(self: &Arc<Self>) -> Option<Notifier> {
        if !self.config.realtime.enabled {
            return None;
        }
        let source = self.remote.subscribe()?;
        Some(Notifier::spawn(
            source,
            self.config.delta_interval,
            self.cancel.child_token(),
            &self.tracker,
        ))
    }

    /// Start background work: resumed transfers, the delta loop and
    /// the cache janitor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let resumed_down = self.downloads.resume_persisted()?;
        let resumed_up = self.uploads.resume_persisted()?;
        if resumed_down + resumed_up > 0 {
            info!(
                downloads = resumed_down,
                uploads = resumed_up,
                "resumed persisted transfer sessions"
            );
        }

        if let Some(delta) = self.delta.read().clone() {
            delta.spawn(&self.tracker);
        }

        let cache = self.cache.clone();
        let thumbnails = self.thumbnails.clone();
        let expiration = self.config.cache_expiration_days;
        let interval =
            std::time::Duration::from_secs(self.config.cache_cleanup_interval_hours * 3600);
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match cache.cleanup(expiration) {
                    Ok(removed) if removed > 0 => debug!(removed, "cache cleanup pass"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "cache cleanup failed"),
                }
                let _ = thumbnails.cleanup(expiration.max(7));
            }
        });

        Ok(())
    }

    /// Serve the D-Bus status interface until shutdown.
    #[cfg(feature = "dbus")]
    pub fn serve_dbus(self: &Arc<Self>) {
        let events = self.status.subscribe();
        let this = self.clone();
        let lookup: crate::status::dbus::StatusLookup =
            Arc::new(move |path| this.status_of_path(path));
        let this = self.clone();
        let paths: crate::status::dbus::PathLookup = Arc::new(move |id| this.path_of(id).ok());
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move {
            if let Err(e) = crate::status::dbus::serve(events, lookup, paths, cancel).await {
                warn!(err = %e, "status D-Bus service exited");
            }
        });
    }

    /// Run one delta cycle immediately; test and CLI hook.
    pub async fn sync_now(&self) -> Result<()> {
        let delta = self.delta.read().clone();
        match delta {
            Some(delta) => delta.run_cycle().await,
            None => Err(Error::invalid("delta loop not configured")),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Stats {
        let cache = self.cache.clone();
        let stats = tokio::time::timeout(self.config.timeouts.content_stats_timeout, async move {
            (cache.size(), cache.file_count(), cache.open_file_count())
        })
        .await
        .unwrap_or((0, 0, 0));
        Stats {
            cache_bytes: stats.0,
            cache_files: stats.1,
            open_files: stats.2,
            metadata: self.sched.stats(),
            downloads: self.downloads.snapshot(),
            uploads: self.uploads.snapshot(),
            offline: self.is_offline(),
        }
    }

    /// Orderly shutdown: stop signal first, then bounded waits in
    /// dependency order (janitor and delta observe the token, then
    /// transfers drain, then the scheduler and status go down with the
    /// task tracker), finally the store closes.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("filesystem shutting down");
        self.cancel.cancel();

        self.downloads
            .stop(self.config.timeouts.download_worker_shutdown)
            .await;
        self.uploads
            .stop(self.config.timeouts.upload_graceful_shutdown)
            .await;

        self.tracker.close();
        if tokio::time::timeout(self.config.timeouts.filesystem_shutdown, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("tasks still running at shutdown deadline");
        }
        // the delta loop's hooks point back at this filesystem; drop
        // them so the store can actually unwind
        *self.delta.write() = None;

        self.graph.serialize_all()?;
        self.store.close()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // kernel boundary
    // ------------------------------------------------------------------

    fn touch_foreground(&self) {
        self.last_foreground.store(unix_secs(), Ordering::Relaxed);
    }

    fn errno<T>(result: Result<T>) -> KernelResult<T> {
        result.map_err(|e| e.errno())
    }

    fn node_inode(&self, node: NodeId) -> KernelResult<Arc<crate::inode::Inode>> {
        self.graph.get_node(node).ok_or(libc::ENOENT)
    }

    fn attr_of(inode: &crate::inode::Inode) -> Attr {
        let data = inode.lock();
        Attr {
            node: inode.node,
            size: data.entry.size,
            mtime: data.entry.mtime,
            kind: data.entry.kind,
            nlink: match data.entry.kind {
                ItemKind::Directory => 2 + data.subdir,
                ItemKind::File => 1,
            },
        }
    }

    fn validate_name(name: &str) -> KernelResult<()> {
        if name.is_empty()
            || name.len() > 255
            || name == "."
            || name == ".."
            || name.contains(RESTRICTED_CHARS)
            || name.ends_with(' ')
            || name.ends_with('.')
            || RESTRICTED_NAMES.contains(&name.to_ascii_uppercase().as_str())
        {
            return Err(libc::EINVAL);
        }
        Ok(())
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> KernelResult<Attr> {
        self.touch_foreground();
        let parent = self.node_inode(parent)?;
        let parent_id = parent.id();
        match Self::errno(self.graph.get_child(&parent_id, name))? {
            Some(child) => Ok(Self::attr_of(&child)),
            None => Err(libc::ENOENT),
        }
    }

    pub fn getattr(&self, node: NodeId) -> KernelResult<Attr> {
        let inode = self.node_inode(node)?;
        Ok(Self::attr_of(&inode))
    }

    pub async fn readdir(&self, node: NodeId) -> KernelResult<Vec<DirEntryOut>> {
        self.touch_foreground();
        let inode = self.node_inode(node)?;
        {
            let data = inode.lock();
            if !data.entry.is_directory() {
                return Err(libc::ENOTDIR);
            }
        }
        let id = inode.id();
        let children = Self::errno(self.graph.get_children(&id).await)?;
        Ok(children
            .iter()
            .map(|child| {
                let data = child.lock();
                DirEntryOut {
                    name: data.entry.name.clone(),
                    node: child.node,
                    kind: data.entry.kind,
                }
            })
            .collect())
    }

    /// Open a file, hydrating ghosts on demand. Offline reads of
    /// uncached content fail with `EIO` unless the blob is pinned and
    /// present.
    pub async fn open(&self, node: NodeId) -> KernelResult<()> {
        self.touch_foreground();
        let inode = self.node_inode(node)?;
        let (id, state, kind, size) = {
            let data = inode.lock();
            (
                data.entry.id.clone(),
                data.entry.state,
                data.entry.kind,
                data.entry.size,
            )
        };
        if kind == ItemKind::Directory {
            return Err(libc::EISDIR);
        }
        if self.graph.is_virtual(&id) {
            return Ok(());
        }

        match state {
            ItemState::Ghost if size > 0 => {
                if self.is_offline() {
                    if self.cache.has(&id) {
                        return Ok(());
                    }
                    return Err(libc::EIO);
                }
                Self::errno(self.downloads.queue_download(&id).map(|_| ()))?;
                Self::errno(self.downloads.wait_for_download(&id).await)?;
                Ok(())
            }
            ItemState::Hydrating => Self::errno(self.downloads.wait_for_download(&id).await),
            _ => Ok(()),
        }
    }

    pub async fn read(&self, node: NodeId, offset: u64, size: u32) -> KernelResult<Vec<u8>> {
        self.touch_foreground();
        let inode = self.node_inode(node)?;
        let id = inode.id();

        if let Some(content) = self.graph.virtual_content(&id) {
            let start = (offset as usize).min(content.len());
            let end = (offset as usize + size as usize).min(content.len());
            return Ok(content[start..end].to_vec());
        }

        // defensive hydration; open() normally did this already
        let state = inode.lock().entry.state;
        if state == ItemState::Ghost || state == ItemState::Hydrating {
            self.open(node).await?;
        }

        let handle = Self::errno(self.cache.open_file(&id))?;
        let mut buf = vec![0u8; size as usize];
        let n = Self::errno(handle.read_at(&mut buf, offset))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> KernelResult<u32> {
        self.touch_foreground();
        let inode = self.node_inode(node)?;
        let id = inode.id();
        if self.graph.is_virtual(&id) {
            return Err(libc::EPERM);
        }

        let state = inode.lock().entry.state;
        match state {
            ItemState::Ghost if inode.lock().entry.size > 0 => {
                if self.is_offline() {
                    return Err(libc::EIO);
                }
                self.open(node).await?;
            }
            ItemState::Hydrating => {
                Self::errno(self.downloads.wait_for_download(&id).await)?;
            }
            _ => {}
        }

        let handle = Self::errno(self.cache.open_file(&id))?;
        let written = Self::errno(handle.write_at(data, offset))?;
        let new_len = Self::errno(handle.len())?;
        drop(handle);

        {
            let mut data = inode.lock();
            data.entry.size = new_len;
            data.entry.mtime = unix_secs();
        }
        Self::errno(self.meta.update(&id, |e| {
            e.size = new_len;
            e.mtime = unix_secs();
        }))?;

        let state = inode.lock().entry.state;
        if state != ItemState::DirtyLocal {
            Self::errno(self.meta.transition_state(&id, ItemState::DirtyLocal, false))?;
            inode.lock().entry.state = ItemState::DirtyLocal;
        }
        Ok(written as u32)
    }

    /// Push dirty content: journal it while offline, otherwise queue a
    /// foreground upload, overflowing to the legacy FIFO.
    pub fn flush(&self, node: NodeId) -> KernelResult<()> {
        self.flush_with_priority(node, Priority::High)
    }

    pub fn release(&self, node: NodeId) -> KernelResult<()> {
        self.flush_with_priority(node, Priority::Low)
    }

    fn flush_with_priority(&self, node: NodeId, priority: Priority) -> KernelResult<()> {
        let inode = self.node_inode(node)?;
        let (id, state) = {
            let data = inode.lock();
            (data.entry.id.clone(), data.entry.state)
        };
        if state != ItemState::DirtyLocal || self.graph.is_virtual(&id) {
            return Ok(());
        }

        if self.is_offline() {
            let path = Self::errno(self.path_of(&id))?;
            Self::errno(
                self.journal
                    .record(ChangeRecord::new(id, ChangeKind::Modify, path)),
            )?;
            return Ok(());
        }

        match self.uploads.queue_upload(&id, priority) {
            Ok(_) => Ok(()),
            Err(Error::QueueFull) => {
                Self::errno(self.uploads.queue_upload_fifo(&id).map(|_| ()))
            }
            Err(e) => Err(e.errno()),
        }
    }

    pub fn fsync(&self, node: NodeId) -> KernelResult<()> {
        let inode = self.node_inode(node)?;
        let id = inode.id();
        if self.graph.is_virtual(&id) || !self.cache.has(&id) {
            return Ok(());
        }
        let handle = Self::errno(self.cache.open_file(&id))?;
        Self::errno(handle.sync())
    }

    /// Create an empty file. The new item lives under a local id until
    /// its creation upload succeeds.
    pub fn mknod(&self, parent: NodeId, name: &str) -> KernelResult<Attr> {
        self.touch_foreground();
        Self::validate_name(name)?;
        let parent_inode = self.node_inode(parent)?;
        let parent_id = parent_inode.id();
        if !parent_inode.lock().entry.is_directory() {
            return Err(libc::ENOTDIR);
        }
        if Self::errno(self.graph.get_child(&parent_id, name))?.is_some() {
            return Err(libc::EEXIST);
        }

        let id = ItemId::fresh_local();
        let mut entry = Entry::new_file(id.clone(), parent_id, name);
        entry.state = ItemState::DirtyLocal;
        entry.pending_remote = Some(PendingRemote::new());
        let inode = Self::errno(self.graph.insert_id(entry))?;
        Self::errno(self.cache.insert(&id, b""))?;

        if self.is_offline() {
            let path = Self::errno(self.path_of(&id))?;
            Self::errno(
                self.journal
                    .record(ChangeRecord::new(id.clone(), ChangeKind::Create, path)),
            )?;
        }
        self.status.publish(&id, FileStatus::OutOfSync);
        Ok(Self::attr_of(&inode))
    }

    pub async fn mkdir(&self, parent: NodeId, name: &str) -> KernelResult<Attr> {
        self.touch_foreground();
        Self::validate_name(name)?;
        let parent_inode = self.node_inode(parent)?;
        let parent_id = parent_inode.id();
        if !parent_inode.lock().entry.is_directory() {
            return Err(libc::ENOTDIR);
        }
        if Self::errno(self.graph.get_child(&parent_id, name))?.is_some() {
            return Err(libc::EEXIST);
        }

        if !self.is_offline() {
            match self.remote.mkdir(&parent_id, name).await {
                Ok(item) => {
                    let inode = Self::errno(self.graph.insert_id(Entry::from_remote(&item)))?;
                    return Ok(Self::attr_of(&inode));
                }
                Err(e) if e.is_transient() => {
                    debug!(err = %e, "mkdir falling back to offline path");
                }
                Err(e) => return Err(e.errno()),
            }
        }

        let id = ItemId::fresh_local();
        let mut entry = Entry::new_directory(id.clone(), Some(parent_id), name);
        entry.pending_remote = Some(PendingRemote::new());
        let inode = Self::errno(self.graph.insert_id(entry))?;
        let path = Self::errno(self.path_of(&id))?;
        Self::errno(
            self.journal
                .record(ChangeRecord::new(id, ChangeKind::Create, path)),
        )?;
        Ok(Self::attr_of(&inode))
    }

    pub async fn unlink(&self, parent: NodeId, name: &str) -> KernelResult<()> {
        self.remove_common(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: NodeId, name: &str) -> KernelResult<()> {
        self.remove_common(parent, name, true).await
    }

    async fn remove_common(&self, parent: NodeId, name: &str, want_dir: bool) -> KernelResult<()> {
        self.touch_foreground();
        let parent_inode = self.node_inode(parent)?;
        let parent_id = parent_inode.id();
        let child = Self::errno(self.graph.get_child(&parent_id, name))?.ok_or(libc::ENOENT)?;
        let (id, is_dir, children) = {
            let data = child.lock();
            (
                data.entry.id.clone(),
                data.entry.is_directory(),
                data.entry.children.len(),
            )
        };
        if want_dir != is_dir {
            return Err(if want_dir { libc::ENOTDIR } else { libc::EISDIR });
        }
        if is_dir && children > 0 {
            return Err(libc::ENOTEMPTY);
        }
        if self.graph.is_virtual(&id) {
            return Err(libc::EPERM);
        }

        let mut deferred_remote = false;
        if !id.is_local() {
            if self.is_offline() {
                deferred_remote = true;
            } else {
                match self.remote.remove(&id, None).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => deferred_remote = true,
                    Err(e) => return Err(e.errno()),
                }
            }
        }
        if deferred_remote {
            let path = Self::errno(self.path_of(&id))?;
            Self::errno(
                self.journal
                    .record(ChangeRecord::new(id.clone(), ChangeKind::Delete, path)),
            )?;
        }

        Self::errno(self.graph.delete_id(&id))?;
        self.status.forget(&id);
        Ok(())
    }

    /// Rename and/or move. Entries under local ids (either endpoint)
    /// move locally and are reconciled when their creations upload.
    pub async fn rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> KernelResult<()> {
        self.touch_foreground();
        Self::validate_name(new_name)?;
        let parent_inode = self.node_inode(parent)?;
        let parent_id = parent_inode.id();
        let new_parent_inode = self.node_inode(new_parent)?;
        let new_parent_id = new_parent_inode.id();
        if !new_parent_inode.lock().entry.is_directory() {
            return Err(libc::ENOTDIR);
        }

        let child = Self::errno(self.graph.get_child(&parent_id, name))?.ok_or(libc::ENOENT)?;
        let id = child.id();
        if self.graph.is_virtual(&id) {
            return Err(libc::EPERM);
        }
        if Self::errno(self.graph.get_child(&new_parent_id, new_name))?.is_some() {
            return Err(libc::EEXIST);
        }
        let old_path = Self::errno(self.path_of(&id))?;

        let local_only = id.is_local() || new_parent_id.is_local();
        // a remote item moved under a not-yet-synced parent is
        // re-issued once the parent exists remotely
        let mut deferred_remote = local_only && !id.is_local();
        if !local_only {
            if self.is_offline() {
                deferred_remote = true;
            } else {
                match self
                    .remote
                    .rename(&id, &new_parent_id, new_name, None)
                    .await
                {
                    Ok(item) => {
                        Self::errno(self.meta.update(&id, |e| e.etag = Some(item.etag.clone())))?;
                    }
                    Err(e) if e.is_transient() => deferred_remote = true,
                    Err(e) => return Err(e.errno()),
                }
            }
        }

        // local application
        if parent_id != new_parent_id {
            Self::errno(self.graph.reparent(&id, &new_parent_id))?;
        }
        {
            let mut data = child.lock();
            data.entry.name = new_name.to_owned();
            data.entry.mtime = unix_secs();
        }
        Self::errno(self.meta.update(&id, |e| {
            e.name = new_name.to_owned();
            e.mtime = unix_secs();
        }))?;

        if deferred_remote {
            let new_path = Self::errno(self.path_of(&id))?;
            Self::errno(
                self.journal
                    .record(ChangeRecord::rename(id, old_path, new_path)),
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // status surface
    // ------------------------------------------------------------------

    /// Value of the `user.onemount.status` extended attribute.
    pub fn status_xattr(&self, node: NodeId) -> KernelResult<String> {
        let inode = self.node_inode(node)?;
        let id = inode.id();
        let status = self.status.get_or_derive(&id, || {
            let entry = inode.entry();
            if self.uploads.is_pending(&id) {
                FileStatus::Syncing
            } else {
                FileStatus::from_entry(&entry)
            }
        });
        Ok(status.as_str().to_owned())
    }

    pub fn status_of_path(&self, path: &str) -> Option<FileStatus> {
        let id = self.resolve_path(path).ok()?;
        let entry = self.meta.get(&id)?;
        Some(self.status.get_or_derive(&id, || {
            if self.uploads.is_pending(&id) {
                FileStatus::Syncing
            } else {
                FileStatus::from_entry(&entry)
            }
        }))
    }

    /// Repository-relative path of an item, built by walking parents.
    pub fn path_of(&self, id: &ItemId) -> Result<String> {
        let mut segments = Vec::new();
        let mut cursor = id.clone();
        loop {
            let entry = self.meta.get(&cursor).ok_or_else(|| Error::not_found(&cursor))?;
            match entry.parent_id {
                Some(parent) => {
                    segments.push(entry.name.clone());
                    cursor = parent;
                }
                None => break,
            }
            if segments.len() > 256 {
                return Err(Error::corruption("parent chain loop"));
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub fn resolve_path(&self, path: &str) -> Result<ItemId> {
        let root = self
            .graph
            .root_id()
            .ok_or_else(|| Error::invalid("no root installed"))?;
        let mut cursor = root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match self.graph.get_child(&cursor, segment)? {
                Some(inode) => cursor = inode.id(),
                None => return Err(Error::not_found(path)),
            }
        }
        Ok(cursor)
    }

    /// Overlay a synthetic file (volume-info markers and the like)
    /// onto the root listing.
    pub fn add_virtual_file(&self, file: VirtualFile) -> Result<NodeId> {
        self.graph.add_virtual_file(file).map(|inode| inode.node)
    }

    /// Read a cached thumbnail blob.
    pub fn thumbnail(&self, id: &ItemId) -> Result<Vec<u8>> {
        self.thumbnails.get(id)
    }

    pub fn put_thumbnail(&self, id: &ItemId, data: &[u8]) -> Result<()> {
        self.thumbnails.insert(id, data)
    }

    // ------------------------------------------------------------------
    // conflict materialization
    // ------------------------------------------------------------------

    /// Preserve local bytes under the original name and write a copy
    /// of the remote content next to it.
    async fn materialize_conflict(&self, id: &ItemId, remote_item: &DriveItem) -> Result<()> {
        let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
        let parent_id = entry
            .parent_id
            .clone()
            .ok_or_else(|| Error::invalid("conflict on root"))?;

        let siblings: Vec<String> = self
            .meta
            .get(&parent_id)
            .map(|p| {
                p.children
                    .iter()
                    .filter_map(|c| self.meta.get(c).map(|e| e.name))
                    .collect()
            })
            .unwrap_or_default();
        let copy_name = conflict::conflict_name(&entry.name, unix_secs(), |candidate| {
            siblings.iter().any(|s| s == candidate)
        });

        // pull the remote version in full
        let mut content = Vec::with_capacity(remote_item.size as usize);
        let mut offset = 0u64;
        while offset < remote_item.size {
            let len = CHUNK_SIZE.min(remote_item.size - offset);
            let chunk = self.remote.download_range(id, offset, len).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            content.extend_from_slice(&chunk);
        }

        let copy_id = ItemId::fresh_local();
        let mut copy = Entry::new_file(copy_id.clone(), parent_id, copy_name.clone());
        copy.size = content.len() as u64;
        copy.state = ItemState::Hydrating;
        self.graph.insert_id(copy)?;
        self.cache.insert(&copy_id, &content)?;
        self.meta
            .transition_state(&copy_id, ItemState::Hydrated, false)?;

        self.status.publish(id, FileStatus::Conflict);
        info!(id = %id, copy = %copy_name, "materialized conflict copy");
        Ok(())
    }
}

#[async_trait]
impl DeltaHooks for Filesystem {
    async fn materialize_conflict(&self, id: &ItemId, remote: &DriveItem) -> Result<()> {
        Filesystem::materialize_conflict(self, id, remote).await
    }
}

#[async_trait]
impl ReplayTarget for Filesystem {
    async fn replay_upload(&self, id: &ItemId) -> Result<()> {
        let entry = self.meta.get(id).ok_or_else(|| Error::not_found(id))?;
        if entry.is_directory() {
            // directory creations replay synchronously
            let parent = entry
                .parent_id
                .clone()
                .ok_or_else(|| Error::invalid("root replay"))?;
            if !id.is_local() {
                return Ok(());
            }
            let item = self.remote.mkdir(&parent, &entry.name).await?;
            self.graph.move_id(id, &item)?;
            return Ok(());
        }
        if entry.state != ItemState::DirtyLocal {
            return Ok(());
        }
        self.uploads.queue_upload(id, Priority::Low).map(|_| ())
    }

    async fn replay_remote_delete(&self, id: &ItemId) -> Result<()> {
        match self.remote.remove(id, None).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn replay_move_path(&self, old_path: &str, new_path: &str) -> Result<()> {
        // the local tree already reflects the rename; find the item at
        // its new location and re-issue the move remotely
        let id = self.resolve_path(new_path).or_else(|_| self.resolve_path(old_path))?;
        if id.is_local() {
            return Ok(());
        }
        let (new_parent, new_name) = match new_path.rsplit_once('/') {
            Some((dir, name)) if !name.is_empty() => (self.resolve_path(dir)?, name),
            _ => return Err(Error::invalid(format!("bad rename path {}", new_path))),
        };
        let item = self.remote.rename(&id, &new_parent, new_name, None).await?;
        self.meta.update(&id, |e| e.etag = Some(item.etag.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        remote::test::{MockRemote, ROOT_ID},
        store::Bucket,
    };
    use std::time::Duration;

    async fn mounted() -> (tempfile::TempDir, Arc<MockRemote>, Arc<Filesystem>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        let config = Config::with_cache_dir(dir.path());
        let fs = Filesystem::new(config, remote.clone()).await.unwrap();
        (dir, remote, fs)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn node_of(fs: &Filesystem, name: &str) -> NodeId {
        fs.lookup(NodeId::ROOT, name).unwrap().node
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_mount_directory_listing() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f-a", ROOT_ID, "A.txt", &[7u8; 100]);
        remote.seed_dir("d-b", ROOT_ID, "B");

        let entries = fs.readdir(NodeId::ROOT).await.unwrap();
        let mut names: Vec<(String, ItemKind)> =
            entries.iter().map(|e| (e.name.clone(), e.kind)).collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                ("A.txt".to_owned(), ItemKind::File),
                ("B".to_owned(), ItemKind::Directory)
            ]
        );

        assert_eq!(fs.meta.get(&"f-a".into()).unwrap().state, ItemState::Ghost);
        assert_eq!(fs.meta.get(&"d-b".into()).unwrap().state, ItemState::Hydrated);

        fs.sync_now().await.unwrap();
        let cursor: Option<String> = fs.store.get(Bucket::DeltaCursor, "cursor").unwrap();
        assert!(cursor.is_some(), "delta cursor persisted after first cycle");
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn offline_create_and_replay() {
        let (_dir, remote, fs) = mounted().await;
        remote.set_offline(true);
        assert!(fs.sync_now().await.is_err());
        assert!(fs.is_offline());

        let attr = fs.mknod(NodeId::ROOT, "new.txt").unwrap();
        let id = fs.graph.get_node(attr.node).unwrap().id();
        assert!(id.is_local());
        assert_eq!(fs.meta.get(&id).unwrap().state, ItemState::DirtyLocal);
        assert!(!fs.journal.is_empty().unwrap());

        // reconnect; the next cycle drains the offline log
        remote.set_offline(false);
        fs.sync_now().await.unwrap();
        assert!(!fs.is_offline());

        let remote_probe = remote.clone();
        wait_until(
            || remote_probe.item_named(ROOT_ID, "new.txt").is_some(),
            "creation to reach the server",
        )
        .await;
        let created = remote.item_named(ROOT_ID, "new.txt").unwrap();
        assert!(!created.id.is_local());

        let fs_probe = fs.clone();
        let created_id = created.id.clone();
        wait_until(
            || {
                fs_probe
                    .meta
                    .get(&created_id)
                    .map(|e| e.state == ItemState::Hydrated)
                    .unwrap_or(false)
            },
            "local entry to adopt the remote id",
        )
        .await;
        assert!(fs.graph.get_id(&id).is_none(), "local id tombstoned");
        // node id survives the rewrite
        assert_eq!(fs.graph.node_for_id(&created.id), Some(attr.node));
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn etag_conflict_materializes_copy() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "f.txt", b"v1");
        let _ = fs.readdir(NodeId::ROOT).await.unwrap();

        let node = node_of(&fs, "f.txt");
        fs.open(node).await.unwrap();
        assert_eq!(fs.meta.get(&"f1".into()).unwrap().state, ItemState::Hydrated);

        fs.write(node, 0, b"local edit").await.unwrap();
        assert_eq!(fs.meta.get(&"f1".into()).unwrap().state, ItemState::DirtyLocal);

        // the server moves on underneath us
        remote.seed_file("f1", ROOT_ID, "f.txt", b"server v2");

        fs.flush(node).unwrap();
        let fs_probe = fs.clone();
        wait_until(
            || {
                fs_probe
                    .meta
                    .get(&"f1".into())
                    .map(|e| e.state == ItemState::Conflict)
                    .unwrap_or(false)
            },
            "conflict state",
        )
        .await;

        // local bytes stay under the original name
        assert_eq!(fs.cache.get(&"f1".into()).unwrap(), b"local edit");

        let fs_probe = fs.clone();
        wait_until(
            || {
                fs_probe
                    .meta
                    .get(&ItemId::from(ROOT_ID))
                    .map(|root| {
                        root.children.iter().any(|c| {
                            fs_probe
                                .meta
                                .get(c)
                                .map(|e| e.name.starts_with("f.txt-conflict-"))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            },
            "conflict copy to appear",
        )
        .await;

        let root = fs.meta.get(&ItemId::from(ROOT_ID)).unwrap();
        let copy_id = root
            .children
            .iter()
            .find(|c| {
                fs.meta
                    .get(c)
                    .map(|e| e.name.starts_with("f.txt-conflict-"))
                    .unwrap_or(false)
            })
            .cloned()
            .unwrap();
        assert_eq!(fs.cache.get(&copy_id).unwrap(), b"server v2");
        assert_eq!(
            fs.status_xattr(node).unwrap(),
            FileStatus::Conflict.as_str()
        );
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rename_across_directories_with_mixed_ids() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "doc.txt", b"content");
        remote.seed_dir("d1", ROOT_ID, "remote-dir");
        fs.sync_now().await.unwrap();

        // a remote file into a locally-created (unsynced) directory
        remote.set_offline(true);
        assert!(fs.sync_now().await.is_err());
        let local_dir = fs.mkdir(NodeId::ROOT, "local-dir").await.unwrap();

        fs.rename(NodeId::ROOT, "doc.txt", local_dir.node, "moved.txt")
            .await
            .unwrap();
        let moved = fs.lookup(local_dir.node, "moved.txt").unwrap();
        assert_eq!(moved.kind, ItemKind::File);
        assert!(fs.lookup(NodeId::ROOT, "doc.txt").is_err());

        // and a remote-to-remote rename while online
        remote.set_offline(false);
        fs.sync_now().await.unwrap();
        fs.rename(NodeId::ROOT, "remote-dir", NodeId::ROOT, "renamed-dir")
            .await
            .unwrap();
        assert_eq!(
            remote.item_named(ROOT_ID, "renamed-dir").map(|i| i.id),
            Some(ItemId::from("d1"))
        );
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_xattr_tracks_lifecycle() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "f.txt", b"content");
        let _ = fs.readdir(NodeId::ROOT).await.unwrap();

        let node = node_of(&fs, "f.txt");
        assert_eq!(fs.status_xattr(node).unwrap(), "OutOfSync");

        fs.open(node).await.unwrap();
        let fs_probe = fs.clone();
        wait_until(
            || fs_probe.status_xattr(node).ok().as_deref() == Some("Local"),
            "status to settle",
        )
        .await;
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_names_are_rejected() {
        let (_dir, _remote, fs) = mounted().await;
        for bad in ["bad:name", "trailing.", "trailing ", "CON", "a/b", ""] {
            assert_eq!(fs.mknod(NodeId::ROOT, bad).unwrap_err(), libc::EINVAL, "{:?}", bad);
        }
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn offline_read_of_ghost_fails_with_eio() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "f.txt", b"content");
        let _ = fs.readdir(NodeId::ROOT).await.unwrap();
        let node = node_of(&fs, "f.txt");

        remote.set_offline(true);
        assert!(fs.sync_now().await.is_err());
        assert_eq!(fs.open(node).await.unwrap_err(), libc::EIO);
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remote_content_change_ghosts_hydrated_file() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "f.txt", b"v1");
        let _ = fs.readdir(NodeId::ROOT).await.unwrap();
        let node = node_of(&fs, "f.txt");
        fs.open(node).await.unwrap();
        fs.sync_now().await.unwrap();
        assert_eq!(fs.meta.get(&"f1".into()).unwrap().state, ItemState::Hydrated);

        remote.seed_file("f1", ROOT_ID, "f.txt", b"completely different");
        fs.sync_now().await.unwrap();

        let entry = fs.meta.get(&"f1".into()).unwrap();
        assert_eq!(entry.state, ItemState::Ghost);
        assert!(!fs.cache.has(&"f1".into()));
        assert_eq!(entry.etag, remote.etag_of("f1"));
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pinned_item_rehydrates_after_invalidation() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_file("f1", ROOT_ID, "f.txt", b"v1");
        let _ = fs.readdir(NodeId::ROOT).await.unwrap();
        let node = node_of(&fs, "f.txt");
        fs.open(node).await.unwrap();
        fs.meta
            .update(&"f1".into(), |e| e.pin = Pin::Always)
            .unwrap();

        remote.seed_file("f1", ROOT_ID, "f.txt", b"pinned v2");
        fs.sync_now().await.unwrap();

        let fs_probe = fs.clone();
        wait_until(
            || {
                fs_probe
                    .cache
                    .get(&"f1".into())
                    .map(|c| c == b"pinned v2")
                    .unwrap_or(false)
            },
            "pinned content to rehydrate",
        )
        .await;
        assert_eq!(fs.meta.get(&"f1".into()).unwrap().state, ItemState::Hydrated);
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn nonempty_directory_delete_defers_to_second_pass() {
        let (_dir, remote, fs) = mounted().await;
        remote.seed_dir("d1", ROOT_ID, "docs");
        remote.seed_file("f1", "d1", "inner.txt", b"x");
        fs.sync_now().await.unwrap();
        assert!(fs.meta.contains(&"d1".into()));
        assert!(fs.meta.contains(&"f1".into()));

        // the feed reports the directory delete before its child's
        remote.delete_remote("d1");
        remote.delete_remote("f1");
        fs.sync_now().await.unwrap();

        assert!(fs.meta.get(&"d1".into()).is_none());
        assert!(fs.meta.get(&"f1".into()).is_none());
        assert!(fs.graph.get_id(&"d1".into()).is_none());
        fs.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn graceful_shutdown_under_load() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        for i in 0..16 {
            remote.seed_file(&format!("f{}", i), ROOT_ID, &format!("f{}.bin", i), &[1u8; 512]);
        }
        let config = Config::with_cache_dir(dir.path());
        let fs = Filesystem::new(config, remote.clone()).await.unwrap();
        fs.start().unwrap();

        let _ = fs.readdir(NodeId::ROOT).await.unwrap();
        for i in 0..16 {
            let _ = fs.downloads.queue_download(&format!("f{}", i).as_str().into());
        }

        let started = std::time::Instant::now();
        fs.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fs.downloads.snapshot().active, 0);
        assert_eq!(fs.uploads.snapshot().active, 0);
        assert_eq!(fs.cache.open_file_count(), 0);

        // a clean close leaves no stale lock to remediate
        drop(fs);
        let store = Store::open(dir.path()).unwrap();
        store.close().unwrap();
    }
}
