//! Delta reconciliation loop.
//!
//! One long-running task pages the server change feed, squashes each
//! cycle to the last delta per id, applies the result to the metadata
//! mirror and content cache, and persists the new cursor. Network
//! failures flip the engine into offline mode with a short recovery
//! tick; the first successful cycle afterwards replays the offline
//! change journal.

use crate::{
    cache::ContentCache,
    config::Config,
    conflict,
    metadata::{Entry, ItemState, MetadataStore, OverlayPolicy, Pin},
    offline::{ChangeJournal, ReplayTarget},
    realtime::{Health, Notifier},
    remote::{DriveItem, Remote, INITIAL_DELTA_CURSOR},
    status::StatusPublisher,
    store::{Bucket, Store},
    transfer::DownloadManager,
    Error, ItemId, Result,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

const CURSOR_KEY: &str = "cursor";

const PAGE_TIMEOUT: Duration = Duration::from_secs(30);
const CYCLE_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_TIMEOUT: Duration = Duration::from_secs(60);
const REPLAY_TIMEOUT: Duration = Duration::from_secs(600);

/// Tick while offline, until the feed answers again.
const RECOVERY_TICK: Duration = Duration::from_secs(2);
/// Tick while the realtime channel is failed outright.
const REALTIME_FAILED_TICK: Duration = Duration::from_secs(10);

/// Conflict-copy materialization, implemented by the filesystem which
/// owns the graph and cache.
#[async_trait]
pub trait DeltaHooks: Send + Sync {
    async fn materialize_conflict(&self, id: &ItemId, remote: &DriveItem) -> Result<()>;
}

pub struct DeltaDeps {
    pub remote: Arc<dyn Remote>,
    pub meta: Arc<MetadataStore>,
    pub graph: Arc<crate::inode::InodeGraph>,
    pub cache: Arc<ContentCache>,
    pub downloads: Arc<DownloadManager>,
    pub status: Arc<StatusPublisher>,
    pub store: Arc<Store>,
    pub journal: Arc<ChangeJournal>,
    pub hooks: Arc<dyn DeltaHooks>,
    pub replay: Arc<dyn ReplayTarget>,
    pub realtime: Option<Notifier>,
    pub offline: Arc<AtomicBool>,
    /// Unix seconds of the last foreground operation.
    pub last_foreground: Arc<AtomicU64>,
    pub config: Config,
    pub cancel: CancellationToken,
}

pub struct DeltaLoop {
    deps: DeltaDeps,
}

impl DeltaLoop {
    pub fn new(deps: DeltaDeps) -> Arc<Self> {
        Arc::new(DeltaLoop { deps })
    }

    /// Desired tick, recomputed every cycle from realtime health and
    /// foreground activity.
    pub fn desired_interval(&self) -> Duration {
        let d = &self.deps;
        if d.offline.load(Ordering::Relaxed) {
            return RECOVERY_TICK;
        }
        if let Some(ref notifier) = d.realtime {
            return match notifier.health().status {
                Health::Healthy => d.config.effective_fallback_interval(),
                Health::Degraded => d.config.delta_interval,
                Health::Failed => REALTIME_FAILED_TICK,
            };
        }
        let last = d.last_foreground.load(Ordering::Relaxed);
        let now = crate::task::unix_secs();
        if now.saturating_sub(last) <= d.config.active_delta_window.as_secs() {
            d.config.active_delta_interval
        } else {
            d.config.delta_interval
        }
    }

    pub fn spawn(self: Arc<Self>, tracker: &TaskTracker) {
        let this = self.clone();
        tracker.spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        let cancel = self.deps.cancel.clone();
        let pulses = self.deps.realtime.as_ref().map(|n| n.pulses());
        loop {
            let tick = self.desired_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
                _ = async {
                    match pulses {
                        Some(ref rx) => { let _ = rx.recv_async().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    debug!("realtime pulse, running delta cycle early");
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                if e.is_cancelled() {
                    break;
                }
            }
        }
        debug!("delta loop stopped");
    }

    /// One full cycle: page, squash, apply, persist cursor; flips the
    /// offline flag on network failure and schedules replay on
    /// recovery.
    pub async fn run_cycle(&self) -> Result<()> {
        let was_offline = self.deps.offline.load(Ordering::SeqCst);

        let outcome = tokio::time::timeout(CYCLE_TIMEOUT, self.cycle_inner()).await;
        let outcome = match outcome {
            Ok(r) => r,
            Err(elapsed) => Err(elapsed.into()),
        };

        match outcome {
            Ok(applied) => {
                if was_offline {
                    info!("delta feed recovered, leaving offline mode");
                    self.deps.offline.store(false, Ordering::SeqCst);
                    self.spawn_replay();
                }
                if applied > 0 {
                    debug!(applied, "delta cycle applied changes");
                }
                self.deps.graph.serialize_all()?;
                Ok(())
            }
            Err(e) if matches!(e, Error::Network { .. }) => {
                if !was_offline {
                    warn!(err = %e, "delta feed unreachable, entering offline mode");
                }
                self.deps.offline.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => {
                warn!(err = %e, "delta cycle failed");
                Err(e)
            }
        }
    }

    fn spawn_replay(&self) {
        let journal = self.deps.journal.clone();
        let replay = self.deps.replay.clone();
        let cancel = self.deps.cancel.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(REPLAY_TIMEOUT, journal.replay(&*replay, &cancel)).await {
                Ok(Ok(stats)) => {
                    debug!(replayed = stats.replayed, failed = stats.failed, "replay done")
                }
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(err = %e, "offline replay failed"),
                Err(_) => warn!("offline replay hit its time cap"),
            }
        });
    }

    async fn cycle_inner(&self) -> Result<usize> {
        let d = &self.deps;
        let mut cursor: String = d
            .store
            .get(Bucket::DeltaCursor, CURSOR_KEY)?
            .unwrap_or_else(|| INITIAL_DELTA_CURSOR.to_owned());

        // squash to the last delta per id; the feed guarantees the
        // last one wins
        let mut order: Vec<DriveItem> = Vec::new();
        let mut index: HashMap<ItemId, usize> = HashMap::new();
        let new_cursor = loop {
            if d.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let page = tokio::time::timeout(PAGE_TIMEOUT, d.remote.delta(&cursor)).await??;
            for item in page.items {
                match index.get(&item.id) {
                    Some(&i) => order[i] = item,
                    None => {
                        index.insert(item.id.clone(), order.len());
                        order.push(item);
                    }
                }
            }
            match page.next_link {
                Some(next) => cursor = next,
                None => break page.delta_link.unwrap_or(cursor),
            }
        };

        let applied = order.len();
        tokio::time::timeout(APPLY_TIMEOUT, self.apply_all(order)).await??;

        d.store.batch(|b| b.put(Bucket::DeltaCursor, CURSOR_KEY, &new_cursor))?;
        Ok(applied)
    }

    async fn apply_all(&self, items: Vec<DriveItem>) -> Result<()> {
        let mut deferred: Vec<DriveItem> = Vec::new();
        for item in items {
            if self.deps.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.apply_one(&item, true).await {
                Ok(ApplyOutcome::Deferred) => deferred.push(item),
                Ok(_) => {}
                // a bad record must not wedge the feed
                Err(e) => warn!(id = %item.id, err = %e, "skipping unappliable delta"),
            }
        }

        // second pass picks up directories whose children were deleted
        // by this same cycle
        for item in deferred {
            match self.apply_one(&item, false).await {
                Ok(ApplyOutcome::Deferred) => {
                    let children = self
                        .deps
                        .meta
                        .get(&item.id)
                        .map(|e| e.children.len())
                        .unwrap_or(0);
                    warn!(
                        id = %item.id,
                        children,
                        "dropping delete of still non-empty directory"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(id = %item.id, err = %e, "skipping unappliable delta"),
            }
        }
        Ok(())
    }

    async fn apply_one(&self, item: &DriveItem, _first_pass: bool) -> Result<ApplyOutcome> {
        let d = &self.deps;

        if item.deleted {
            return self.apply_delete(item);
        }

        // the root carries no parent; refresh its mirror and move on
        let parent_id = match item.parent_id {
            Some(ref p) => p.clone(),
            None => {
                d.meta.update(&item.id, |e| {
                    e.etag = Some(item.etag.clone());
                    e.mtime = item.mtime;
                })?;
                return Ok(ApplyOutcome::Applied);
            }
        };

        // an uncached subtree stays uncached
        if !d.meta.contains(&parent_id) {
            return Ok(ApplyOutcome::Skipped);
        }

        let known = d.meta.get(&item.id);
        let entry = match known {
            Some(entry) => entry,
            None => {
                // a same-named local-id sibling is our own offline
                // creation coming back from the server
                if let Some(local) = self.local_sibling(&parent_id, &item.name) {
                    debug!(local = %local, remote = %item.id, "adopting server id for local creation");
                    d.graph.move_id(&local, item)?;
                    match d.meta.get(&item.id) {
                        Some(entry) => entry,
                        None => return Ok(ApplyOutcome::Applied),
                    }
                } else {
                    let mut entry = Entry::from_remote(item);
                    entry.parent_id = Some(parent_id);
                    d.graph.insert_id(entry)?;
                    return Ok(ApplyOutcome::Applied);
                }
            }
        };

        // first delta observation closes the pending-remote window
        if entry.pending_remote.is_some() {
            d.meta.update(&item.id, |e| e.pending_remote = None)?;
        }

        if entry.parent_id.as_ref() != Some(&parent_id) && entry.overlay == OverlayPolicy::RemoteWins
        {
            d.graph.reparent(&item.id, &parent_id)?;
        }

        if entry.etag.as_deref() == Some(item.etag.as_str()) {
            self.update_mirror(&item.id, |e| {
                e.mtime = item.mtime;
                if e.state != ItemState::DirtyLocal {
                    e.size = item.size;
                }
            })?;
            return Ok(ApplyOutcome::Applied);
        }

        let hashes_match = match (&entry.content_hash, &item.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };

        if entry.is_directory() || hashes_match {
            // metadata-only change
            self.update_mirror(&item.id, |e| {
                e.etag = Some(item.etag.clone());
                e.mtime = item.mtime;
                e.size = item.size;
                if e.overlay == OverlayPolicy::RemoteWins {
                    e.name = item.name.clone();
                }
            })?;
            return Ok(ApplyOutcome::Applied);
        }

        // content diverged
        if conflict::is_conflicting(&entry, item) {
            warn!(id = %item.id, "remote changed under local edits, conflict");
            d.meta.transition_state(&item.id, ItemState::Conflict, true)?;
            self.sync_mirror(&item.id)?;
            d.hooks.materialize_conflict(&item.id, item).await?;
            return Ok(ApplyOutcome::Applied);
        }

        d.cache.delete(&item.id)?;
        if entry.state == ItemState::Hydrated {
            d.meta.transition_state(&item.id, ItemState::Ghost, true)?;
        }
        self.update_mirror(&item.id, |e| {
            e.etag = Some(item.etag.clone());
            e.mtime = item.mtime;
            e.size = item.size;
            e.content_hash = item.content_hash.clone();
            if e.overlay == OverlayPolicy::RemoteWins {
                e.name = item.name.clone();
            }
        })?;

        if entry.pin == Pin::Always {
            debug!(id = %item.id, "pinned item invalidated, re-queueing download");
            match d.downloads.queue_download(&item.id) {
                Ok(_) => {}
                Err(Error::QueueFull) => warn!(id = %item.id, "download queue full for pinned item"),
                Err(e) => return Err(e),
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    fn apply_delete(&self, item: &DriveItem) -> Result<ApplyOutcome> {
        let d = &self.deps;
        let entry = match d.meta.get(&item.id) {
            Some(entry) => entry,
            None => return Ok(ApplyOutcome::Skipped),
        };
        if entry.is_directory() && !entry.children.is_empty() {
            return Ok(ApplyOutcome::Deferred);
        }
        d.graph.delete_id(&item.id)?;
        d.status.forget(&item.id);
        Ok(ApplyOutcome::Applied)
    }

    fn local_sibling(&self, parent: &ItemId, name: &str) -> Option<ItemId> {
        let entry = self.deps.meta.get(parent)?;
        entry
            .children
            .iter()
            .find(|c| {
                c.is_local()
                    && self
                        .deps
                        .meta
                        .get(c)
                        .map(|e| e.name.eq_ignore_ascii_case(name))
                        .unwrap_or(false)
            })
            .cloned()
    }

    /// Persist a field update and mirror it into the cached inode.
    fn update_mirror(&self, id: &ItemId, f: impl Fn(&mut Entry)) -> Result<()> {
        self.deps.meta.update(id, &f)?;
        if let Some(inode) = self.deps.graph.get_id(id) {
            f(&mut inode.lock().entry);
        }
        Ok(())
    }

    /// Pull the persisted entry back into the inode mirror.
    fn sync_mirror(&self, id: &ItemId) -> Result<()> {
        if let (Some(entry), Some(inode)) = (self.deps.meta.get(id), self.deps.graph.get_id(id)) {
            inode.lock().entry = entry;
        }
        Ok(())
    }
}

enum ApplyOutcome {
    Applied,
    Skipped,
    Deferred,
}
