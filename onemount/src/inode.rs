//! In-memory mirror of the metadata store, keyed both ways.
//!
//! Node ids are dense, monotonically increasing and never reused: a
//! dense append-only vector maps node id to item id (`None` slots are
//! tombstones), while two concurrent maps give O(1) lookups from
//! either identity. The inode carries its own node id, which survives
//! item-id rewrites.
//!
//! Locking: the graph-wide lock is level 1 of the crate's hierarchy,
//! inode mutexes are levels 2 and 3 (parent before child). Two
//! documented exceptions:
//!
//! (a) node assignment in `insert_inner` briefly takes the node vector
//!     after an inode lock; safe because no inode lock is held at that
//!     point anymore;
//! (b) `move_id` takes the child inode, then graph indices; its holds
//!     are released before the parent is touched.

use crate::{
    cache::ContentCache,
    metadata::{Entry, ItemState, MetadataStore},
    remote::DriveItem,
    sched::{Fetched, MetadataScheduler, Priority, Request},
    task::Timed,
    Error, ItemId, NodeId, Remote, Result,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InodeData {
    pub entry: Entry,
    /// Direct subdirectory count, for POSIX `nlink`.
    pub subdir: u32,
    /// Children list reflects the server since the last fetch.
    pub children_fresh: bool,
}

pub struct Inode {
    pub node: NodeId,
    data: Mutex<InodeData>,
}

impl Inode {
    fn new(node: NodeId, entry: Entry) -> Arc<Self> {
        Arc::new(Inode {
            node,
            data: Mutex::new(InodeData {
                entry,
                subdir: 0,
                children_fresh: false,
            }),
        })
    }

    pub fn lock(&self) -> Timed<MutexGuard<'_, InodeData>> {
        Timed::new("inode", self.data.lock())
    }

    pub fn id(&self) -> ItemId {
        self.data.lock().entry.id.clone()
    }

    pub fn entry(&self) -> Entry {
        self.data.lock().entry.clone()
    }
}

/// Synthetic entries (volume-info markers and the like) overlaid onto
/// the root listing; they exist in the graph but never in the
/// metadata store.
pub struct VirtualFile {
    pub name: String,
    pub content: Vec<u8>,
}

pub type DeleteHook = Arc<dyn Fn(&ItemId) + Send + Sync>;

pub struct InodeGraph {
    /// Filesystem-wide lock; level 1 in the hierarchy.
    fs_lock: RwLock<()>,
    /// Dense node-id table; index = node id, `None` = tombstone.
    nodes: Mutex<Vec<Option<ItemId>>>,
    by_id: scc::HashMap<ItemId, Arc<Inode>>,
    by_node: scc::HashMap<u64, Arc<Inode>>,
    virtual_content: scc::HashMap<ItemId, Arc<Vec<u8>>>,
    meta: Arc<MetadataStore>,
    sched: Arc<MetadataScheduler>,
    remote: Arc<dyn Remote>,
    cache: Arc<ContentCache>,
    root_id: RwLock<Option<ItemId>>,
    /// Cancels in-flight uploads for ids being deleted.
    on_delete: RwLock<Option<DeleteHook>>,
}

impl InodeGraph {
    pub fn new(
        meta: Arc<MetadataStore>,
        sched: Arc<MetadataScheduler>,
        remote: Arc<dyn Remote>,
        cache: Arc<ContentCache>,
    ) -> Arc<Self> {
        Arc::new(InodeGraph {
            fs_lock: RwLock::new(()),
            // slot zero stays empty so the root lands on node id 1
            nodes: Mutex::new(vec![None]),
            by_id: scc::HashMap::new(),
            by_node: scc::HashMap::new(),
            virtual_content: scc::HashMap::new(),
            meta,
            sched,
            remote,
            cache,
            root_id: RwLock::new(None),
            on_delete: RwLock::new(None),
        })
    }

    pub fn set_delete_hook(&self, hook: DeleteHook) {
        *self.on_delete.write() = Some(hook);
    }

    pub fn root_id(&self) -> Option<ItemId> {
        self.root_id.read().clone()
    }

    /// Install the root inode. Falls back to a synthetic root entry
    /// when neither the store nor the caller has one.
    pub fn ensure_root(&self, entry: Option<Entry>) -> Result<Arc<Inode>> {
        let entry = entry.unwrap_or_else(|| {
            debug!("materializing synthetic root entry");
            Entry::new_directory("root".into(), None, "/")
        });
        *self.root_id.write() = Some(entry.id.clone());
        let _guard = self.fs_lock.write();
        self.insert_inner(entry)
    }

    pub fn get_node(&self, node: NodeId) -> Option<Arc<Inode>> {
        self.by_node.read(&node.as_u64(), |_, inode| inode.clone())
    }

    pub fn get_id(&self, id: &ItemId) -> Option<Arc<Inode>> {
        self.by_id.read(id, |_, inode| inode.clone())
    }

    /// Tombstoned slots stay vacated; lookups through them fail
    /// forever.
    pub fn id_for_node(&self, node: NodeId) -> Option<ItemId> {
        self.nodes
            .lock()
            .get(node.as_u64() as usize)
            .cloned()
            .flatten()
    }

    pub fn node_for_id(&self, id: &ItemId) -> Option<NodeId> {
        self.get_id(id).map(|inode| inode.node)
    }

    pub fn node_count(&self) -> usize {
        self.by_node.len()
    }

    /// Insert an entry, assigning a fresh node id when the item is
    /// new. Duplicate inserts are idempotent apart from closing the
    /// pending-remote window.
    pub fn insert_id(&self, entry: Entry) -> Result<Arc<Inode>> {
        let _guard = self.fs_lock.write();
        self.insert_inner(entry)
    }

    fn insert_inner(&self, entry: Entry) -> Result<Arc<Inode>> {
        if let Some(existing) = self.get_id(&entry.id) {
            let cleared = {
                let mut data = existing.lock();
                if data.entry.pending_remote.is_some() {
                    data.entry.pending_remote = None;
                    true
                } else {
                    false
                }
            };
            if cleared {
                self.meta.update(&entry.id, |e| e.pending_remote = None)?;
            }
            return Ok(existing);
        }

        // make sure the parent is cached before attaching to it
        if let Some(parent_id) = entry.parent_id.clone() {
            if self.get_id(&parent_id).is_none() {
                match self.meta.get(&parent_id) {
                    Some(parent_entry) => {
                        self.insert_inner(parent_entry)?;
                    }
                    None => {
                        return Err(Error::not_found(&parent_id));
                    }
                }
            }
        }

        let node = {
            let mut nodes = self.nodes.lock();
            nodes.push(Some(entry.id.clone()));
            NodeId(nodes.len() as u64 - 1)
        };

        let is_dir = entry.is_directory();
        let id = entry.id.clone();
        let parent_id = entry.parent_id.clone();
        let inode = Inode::new(node, entry.clone());
        if self.by_id.insert(id.clone(), inode.clone()).is_err() {
            // lost an insert race; tombstone the fresh slot and adopt
            // the winner
            self.nodes.lock()[node.as_u64() as usize] = None;
            return self.get_id(&id).ok_or_else(|| Error::not_found(&id));
        }
        let _ = self.by_node.insert(node.as_u64(), inode.clone());
        self.meta.save(entry)?;

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.get_id(&parent_id) {
                {
                    let mut data = parent.lock();
                    if !data.entry.children.contains(&id) {
                        data.entry.children.push(id.clone());
                        if is_dir {
                            data.subdir += 1;
                        }
                    }
                }
                self.meta.update(&parent_id, |p| {
                    if !p.children.contains(&id) {
                        p.children.push(id.clone());
                    }
                })?;
            }
        }

        Ok(inode)
    }

    /// Delete an item and its whole subtree: children first, then the
    /// parent linkage, then the node-id tombstone and the metadata
    /// entry. In-flight uploads for every deleted id are cancelled.
    pub fn delete_id(&self, id: &ItemId) -> Result<()> {
        let _guard = self.fs_lock.write();
        self.delete_inner(id)
    }

    fn delete_inner(&self, id: &ItemId) -> Result<()> {
        let inode = match self.get_id(id) {
            Some(inode) => inode,
            None => {
                self.meta.delete(id)?;
                return Ok(());
            }
        };

        let (children, parent_id, is_dir) = {
            let data = inode.lock();
            (
                data.entry.children.clone(),
                data.entry.parent_id.clone(),
                data.entry.is_directory(),
            )
        };
        for child in children {
            self.delete_inner(&child)?;
        }

        let hook = self.on_delete.read().clone();
        if let Some(hook) = hook {
            hook(id);
        }
        self.cache.delete(id)?;

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.get_id(&parent_id) {
                let mut data = parent.lock();
                data.entry.children.retain(|c| c != id);
                if is_dir && data.subdir > 0 {
                    data.subdir -= 1;
                }
            }
            self.meta
                .update(&parent_id, |p| p.children.retain(|c| c != id))?;
        }

        {
            let mut nodes = self.nodes.lock();
            let slot = inode.node.as_u64() as usize;
            if slot < nodes.len() {
                nodes[slot] = None;
            }
        }
        self.by_node.remove(&inode.node.as_u64());
        self.by_id.remove(id);
        self.virtual_content.remove(id);
        self.meta.delete(id)?;
        Ok(())
    }

    /// Case-insensitive child lookup against the cached graph. A miss
    /// kicks a background children refresh and reports "not found"
    /// synchronously; callers retry after creation races.
    pub fn get_child(&self, parent: &ItemId, name: &str) -> Result<Option<Arc<Inode>>> {
        let _guard = self.fs_lock.read();
        let parent_inode = self
            .get_id(parent)
            .ok_or_else(|| Error::not_found(parent))?;

        let children = {
            let data = parent_inode.lock();
            if !data.entry.is_directory() {
                return Err(Error::invalid(format!("{} is not a directory", parent)));
            }
            data.entry.children.clone()
        };

        for child_id in &children {
            let child = match self.get_id(child_id) {
                Some(c) => Some(c),
                None => match self.meta.get(child_id) {
                    Some(entry) => Some(self.insert_with_read_lock(entry)?),
                    None => None,
                },
            };
            if let Some(child) = child {
                let matches = {
                    let data = child.lock();
                    data.entry.name.eq_ignore_ascii_case(name)
                };
                if matches {
                    return Ok(Some(child));
                }
            }
        }

        // virtual overlays answer on the root only
        if Some(parent) == self.root_id.read().as_ref() {
            let mut hit = None;
            self.virtual_content.scan(|id, _| {
                if hit.is_none() {
                    if let Some(inode) = self.get_id(id) {
                        if inode.lock().entry.name.eq_ignore_ascii_case(name) {
                            hit = Some(inode);
                        }
                    }
                }
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }

        // stored child list may be ahead of the mirror
        if let Some(stored) = self.meta.get(parent) {
            for child_id in &stored.children {
                if children.contains(child_id) {
                    continue;
                }
                if let Some(entry) = self.meta.get(child_id) {
                    if entry.name.eq_ignore_ascii_case(name) {
                        let inode = self.insert_with_read_lock(entry)?;
                        return Ok(Some(inode));
                    }
                }
            }
        }

        let fresh = parent_inode.lock().children_fresh;
        if !fresh {
            match self.sched.submit(Request::Children(parent.clone()), Priority::Low) {
                Ok(_rx) => {}
                Err(Error::QueueFull) => debug!(id = %parent, "children refresh skipped, queue full"),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // insert_inner needs the write lock; within read-locked paths we
    // re-enter through this escape hatch which upgrades by dropping
    // and retaking. Callers tolerate the window because inserts are
    // idempotent.
    fn insert_with_read_lock(&self, entry: Entry) -> Result<Arc<Inode>> {
        if let Some(existing) = self.get_id(&entry.id) {
            return Ok(existing);
        }
        let id = entry.id.clone();
        match self.try_insert_unlocked(entry) {
            Ok(inode) => Ok(inode),
            Err(_) => self.get_id(&id).ok_or_else(|| Error::not_found(&id)),
        }
    }

    fn try_insert_unlocked(&self, entry: Entry) -> Result<Arc<Inode>> {
        self.insert_inner(entry)
    }

    /// Children of a directory, fetched with foreground priority when
    /// the cached list is stale. Queue overflow and deadline expiry
    /// fall back to a direct call; server results are merged with
    /// still-local children so unsynced creations stay visible.
    pub async fn get_children(&self, parent: &ItemId) -> Result<Vec<Arc<Inode>>> {
        let parent_inode = self
            .get_id(parent)
            .ok_or_else(|| Error::not_found(parent))?;
        {
            let data = parent_inode.lock();
            if !data.entry.is_directory() {
                return Err(Error::invalid(format!("{} is not a directory", parent)));
            }
            if data.children_fresh {
                let ids = data.entry.children.clone();
                drop(data);
                return self.resolve_children(parent, &ids);
            }
        }

        let fetched = match self
            .sched
            .request(Request::Children(parent.clone()), Priority::High)
            .await
        {
            Ok(fetched) => match &*fetched {
                Fetched::Children(children) => children.clone(),
                _ => return Err(Error::corruption("children request returned an item")),
            },
            Err(Error::QueueFull) | Err(Error::Network { .. }) => {
                debug!(id = %parent, "children fetch falling back to direct call");
                self.remote.children(parent).await?
            }
            Err(e) => return Err(e),
        };

        self.apply_children(parent, &fetched)?;
        let ids = {
            let data = parent_inode.lock();
            data.entry.children.clone()
        };
        self.resolve_children(parent, &ids)
    }

    fn resolve_children(&self, parent: &ItemId, ids: &[ItemId]) -> Result<Vec<Arc<Inode>>> {
        let mut inodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_id(id) {
                Some(inode) => inodes.push(inode),
                None => {
                    if let Some(entry) = self.meta.get(id) {
                        inodes.push(self.insert_with_read_lock(entry)?);
                    }
                }
            }
        }
        // synthetic overlays come last
        if Some(parent) == self.root_id.read().as_ref() {
            self.virtual_content.scan(|id, _| {
                if let Some(inode) = self.get_id(id) {
                    inodes.push(inode);
                }
            });
        }
        Ok(inodes)
    }

    /// Merge a server children listing into the graph. Local-only and
    /// pending-remote children survive the merge so newly created but
    /// unsynced items remain visible.
    pub fn apply_children(&self, parent: &ItemId, server: &[DriveItem]) -> Result<()> {
        let _guard = self.fs_lock.write();
        let parent_inode = self
            .get_id(parent)
            .ok_or_else(|| Error::not_found(parent))?;

        let previous = {
            let data = parent_inode.lock();
            data.entry.children.clone()
        };

        let mut merged = Vec::with_capacity(server.len() + 2);
        for item in server {
            if item.deleted {
                continue;
            }
            let mut entry = Entry::from_remote(item);
            entry.parent_id = Some(parent.clone());
            if let Some(existing) = self.get_id(&entry.id) {
                let mut data = existing.lock();
                data.entry.name = entry.name.clone();
                data.entry.size = match data.entry.state {
                    ItemState::DirtyLocal | ItemState::Conflict => data.entry.size,
                    _ => entry.size,
                };
                data.entry.mtime = entry.mtime;
                if data.entry.state != ItemState::DirtyLocal {
                    data.entry.etag = entry.etag.clone();
                }
                let snapshot = data.entry.clone();
                drop(data);
                self.meta.save(snapshot)?;
            } else {
                self.insert_inner(entry.clone())?;
            }
            merged.push(entry.id.clone());
        }

        for id in &previous {
            if merged.contains(id) {
                continue;
            }
            let keep = self
                .get_id(id)
                .map(|inode| {
                    let data = inode.lock();
                    data.entry.id.is_local() || data.entry.pending_remote.is_some()
                })
                .unwrap_or(false);
            if keep {
                merged.push(id.clone());
            } else {
                // dropped by the server; prune the mirror
                self.delete_inner(id)?;
            }
        }

        {
            let mut data = parent_inode.lock();
            data.entry.children = merged.clone();
            data.subdir = merged
                .iter()
                .filter_map(|id| self.get_id(id))
                .filter(|inode| inode.lock().entry.is_directory())
                .count() as u32;
            data.children_fresh = true;
        }
        self.meta.update(parent, |p| p.children = merged)?;
        Ok(())
    }

    /// Mark a directory listing stale; the next `get_children`
    /// refetches.
    pub fn invalidate_children(&self, parent: &ItemId) {
        if let Some(inode) = self.get_id(parent) {
            inode.lock().children_fresh = false;
        }
    }

    /// Move a child between two cached directories, keeping both
    /// children lists and the persisted linkage consistent.
    pub fn reparent(&self, child_id: &ItemId, new_parent: &ItemId) -> Result<()> {
        let _guard = self.fs_lock.write();
        let child = self
            .get_id(child_id)
            .ok_or_else(|| Error::not_found(child_id))?;
        let (old_parent, is_dir) = {
            let data = child.lock();
            (data.entry.parent_id.clone(), data.entry.is_directory())
        };
        let old_parent = match old_parent {
            Some(p) if p == *new_parent => return Ok(()),
            Some(p) => p,
            None => return Err(Error::invalid("cannot reparent the root")),
        };

        if let Some(parent) = self.get_id(&old_parent) {
            let mut data = parent.lock();
            data.entry.children.retain(|c| c != child_id);
            if is_dir && data.subdir > 0 {
                data.subdir -= 1;
            }
        }
        if let Some(parent) = self.get_id(new_parent) {
            let mut data = parent.lock();
            if !data.entry.children.contains(child_id) {
                data.entry.children.push(child_id.clone());
            }
            if is_dir {
                data.subdir += 1;
            }
        }
        child.lock().entry.parent_id = Some(new_parent.clone());

        self.meta.reparent(child_id, &old_parent, new_parent)
    }

    /// Rewrite a local id to its server-issued replacement. The node
    /// id is the stable identity: only the node→id mapping, the maps,
    /// the metadata key and the content blob move.
    pub fn move_id(&self, old: &ItemId, item: &DriveItem) -> Result<()> {
        let _guard = self.fs_lock.write();
        let inode = match self.by_id.remove(old) {
            Some((_, inode)) => inode,
            None => return Err(Error::not_found(old)),
        };
        let new = item.id.clone();

        let (entry_snapshot, parent_id) = {
            // exception (b): child inode lock inside graph mutation;
            // released before the parent is touched
            let mut data = inode.lock();
            data.entry.id = new.clone();
            data.entry.etag = Some(item.etag.clone());
            data.entry.pending_remote = None;
            (data.entry.clone(), data.entry.parent_id.clone())
        };

        {
            let mut nodes = self.nodes.lock();
            let slot = inode.node.as_u64() as usize;
            if slot < nodes.len() {
                nodes[slot] = Some(new.clone());
            }
        }
        let _ = self.by_id.insert(new.clone(), inode.clone());

        self.meta.delete(old)?;
        self.meta.save(entry_snapshot)?;

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.get_id(&parent_id) {
                let mut data = parent.lock();
                for child in data.entry.children.iter_mut() {
                    if child == old {
                        *child = new.clone();
                    }
                }
            }
            self.meta.update(&parent_id, |p| {
                for child in p.children.iter_mut() {
                    if child == old {
                        *child = new.clone();
                    }
                }
            })?;
        }

        self.cache.move_id(old, &new)?;
        debug!(old = %old, new = %new, node = %inode.node, "item id rewritten");
        Ok(())
    }

    /// Register a synthetic file shown in the root listing.
    pub fn add_virtual_file(&self, file: VirtualFile) -> Result<Arc<Inode>> {
        let root = self
            .root_id
            .read()
            .clone()
            .ok_or_else(|| Error::invalid("no root installed"))?;
        let id = ItemId::from(format!("virtual-{}", file.name));
        let mut entry = Entry::new_file(id.clone(), root, file.name);
        entry.state = ItemState::Hydrated;
        entry.size = file.content.len() as u64;

        let _guard = self.fs_lock.write();
        let node = {
            let mut nodes = self.nodes.lock();
            nodes.push(Some(id.clone()));
            NodeId(nodes.len() as u64 - 1)
        };
        let inode = Inode::new(node, entry);
        let _ = self.by_id.insert(id.clone(), inode.clone());
        let _ = self.by_node.insert(node.as_u64(), inode.clone());
        let _ = self.virtual_content.insert(id, Arc::new(file.content));
        Ok(inode)
    }

    pub fn virtual_content(&self, id: &ItemId) -> Option<Arc<Vec<u8>>> {
        self.virtual_content.read(id, |_, c| c.clone())
    }

    pub fn is_virtual(&self, id: &ItemId) -> bool {
        self.virtual_content.contains(id)
    }

    /// Persist the whole in-memory mirror back to the metadata store
    /// in one batch.
    pub fn serialize_all(&self) -> Result<()> {
        let mut entries = Vec::with_capacity(self.by_id.len());
        self.by_id.scan(|id, inode| {
            if !self.virtual_content.contains(id) {
                entries.push(inode.lock().entry.clone());
            }
        });
        if let Err(e) = self.meta.save_all(entries.iter()) {
            warn!(err = %e, "failed to serialize inode mirror");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        metadata::ItemKind,
        remote::test::{MockRemote, ROOT_ID},
        store::Store,
    };
    use std::time::Duration;
    use tokio_util::{sync::CancellationToken, task::TaskTracker};

    struct Rig {
        _dir: tempfile::TempDir,
        remote: Arc<MockRemote>,
        meta: Arc<MetadataStore>,
        graph: Arc<InodeGraph>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let meta = MetadataStore::open(store).unwrap();
        let cache = ContentCache::open(dir.path().join("content"), 0, 100).unwrap();
        let remote = MockRemote::new();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sched = MetadataScheduler::new(
            remote.clone(),
            2,
            16,
            64,
            Duration::from_secs(5),
            cancel.clone(),
            &tracker,
        );
        let graph = InodeGraph::new(meta.clone(), sched, remote.clone(), cache);
        graph
            .ensure_root(Some(Entry::new_directory(ROOT_ID.into(), None, "/")))
            .unwrap();
        Rig {
            _dir: dir,
            remote,
            meta,
            graph,
            cancel,
            tracker,
        }
    }

    impl Rig {
        async fn shutdown(self) {
            self.cancel.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn root_is_node_one() {
        let rig = rig();
        let root = rig.graph.get_node(NodeId::ROOT).expect("root inode");
        assert_eq!(root.id(), ItemId::from(ROOT_ID));
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn insert_assigns_monotonic_nodes_and_updates_parent() {
        let rig = rig();
        let a = rig
            .graph
            .insert_id(Entry::new_file("a".into(), ROOT_ID.into(), "a.txt"))
            .unwrap();
        let b = rig
            .graph
            .insert_id(Entry::new_directory("b".into(), Some(ROOT_ID.into()), "b"))
            .unwrap();
        assert!(b.node.as_u64() > a.node.as_u64());

        let root = rig.graph.get_node(NodeId::ROOT).unwrap();
        {
            let data = root.lock();
            assert_eq!(data.entry.children.len(), 2);
            assert_eq!(data.subdir, 1);
        }
        // invariant: children point back at the parent
        assert_eq!(
            rig.meta.get(&"a".into()).unwrap().parent_id,
            Some(ItemId::from(ROOT_ID))
        );
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_insert_is_idempotent_but_clears_pending() {
        let rig = rig();
        let mut entry = Entry::new_file("a".into(), ROOT_ID.into(), "a.txt");
        entry.pending_remote = Some(crate::metadata::PendingRemote::new());
        let first = rig.graph.insert_id(entry.clone()).unwrap();
        let second = rig.graph.insert_id(entry).unwrap();
        assert_eq!(first.node, second.node);
        assert!(rig.meta.get(&"a".into()).unwrap().pending_remote.is_none());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_is_recursive_and_tombstones() {
        let rig = rig();
        rig.graph
            .insert_id(Entry::new_directory("d".into(), Some(ROOT_ID.into()), "d"))
            .unwrap();
        let child = rig
            .graph
            .insert_id(Entry::new_file("f".into(), "d".into(), "f.txt"))
            .unwrap();
        let child_node = child.node;
        drop(child);

        rig.graph.delete_id(&"d".into()).unwrap();
        assert!(rig.graph.get_id(&"d".into()).is_none());
        assert!(rig.graph.get_id(&"f".into()).is_none());
        assert!(rig.meta.get(&"f".into()).is_none());
        // tombstoned slot never resolves again
        assert!(rig.graph.id_for_node(child_node).is_none());

        let next = rig
            .graph
            .insert_id(Entry::new_file("g".into(), ROOT_ID.into(), "g.txt"))
            .unwrap();
        assert!(next.node.as_u64() > child_node.as_u64());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_children_fetches_and_merges_local_only() {
        let rig = rig();
        rig.remote.seed_file("s1", ROOT_ID, "server.txt", b"s");
        // a local creation the server does not know about yet
        let local = ItemId::fresh_local();
        let mut entry = Entry::new_file(local.clone(), ROOT_ID.into(), "draft.txt");
        entry.state = ItemState::DirtyLocal;
        entry.pending_remote = Some(crate::metadata::PendingRemote::new());
        rig.graph.insert_id(entry).unwrap();

        let children = rig.graph.get_children(&ROOT_ID.into()).await.unwrap();
        let names: Vec<String> = children.iter().map(|i| i.lock().entry.name.clone()).collect();
        assert!(names.contains(&"server.txt".to_owned()));
        assert!(names.contains(&"draft.txt".to_owned()));
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_child_is_case_insensitive() {
        let rig = rig();
        rig.graph
            .insert_id(Entry::new_file("a".into(), ROOT_ID.into(), "Readme.MD"))
            .unwrap();
        let hit = rig.graph.get_child(&ROOT_ID.into(), "readme.md").unwrap();
        assert!(hit.is_some());
        let miss = rig.graph.get_child(&ROOT_ID.into(), "nothere").unwrap();
        assert!(miss.is_none());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn move_id_keeps_node_and_content() {
        let rig = rig();
        let local = ItemId::fresh_local();
        let mut entry = Entry::new_file(local.clone(), ROOT_ID.into(), "new.txt");
        entry.state = ItemState::DirtyLocal;
        let inode = rig.graph.insert_id(entry).unwrap();
        let node = inode.node;
        drop(inode);

        let item = DriveItem {
            id: "remote-77".into(),
            parent_id: Some(ROOT_ID.into()),
            name: "new.txt".to_owned(),
            kind: ItemKind::File,
            size: 0,
            mtime: 0,
            etag: "e9".to_owned(),
            content_hash: None,
            deleted: false,
        };
        rig.graph.move_id(&local, &item).unwrap();

        let moved = rig.graph.get_id(&"remote-77".into()).expect("new id resolves");
        assert_eq!(moved.node, node);
        assert!(rig.graph.get_id(&local).is_none());
        assert_eq!(rig.graph.id_for_node(node), Some(ItemId::from("remote-77")));
        let root = rig.graph.get_node(NodeId::ROOT).unwrap();
        assert!(root.lock().entry.children.contains(&"remote-77".into()));
        assert!(rig.meta.get(&local).is_none());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn virtual_files_overlay_root_listing() {
        let rig = rig();
        rig.graph
            .add_virtual_file(VirtualFile {
                name: ".xdg-volume-info".to_owned(),
                content: b"[Volume Info]\n".to_vec(),
            })
            .unwrap();

        let children = rig.graph.get_children(&ROOT_ID.into()).await.unwrap();
        let last = children.last().unwrap();
        assert_eq!(last.lock().entry.name, ".xdg-volume-info");
        assert!(rig.graph.is_virtual(&last.id()));
        // synthetic entries never reach the metadata store
        assert!(rig.meta.get(&last.id()).is_none());
        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialize_all_persists_mirror() {
        let rig = rig();
        rig.graph
            .insert_id(Entry::new_file("a".into(), ROOT_ID.into(), "a.txt"))
            .unwrap();
        if let Some(inode) = rig.graph.get_id(&"a".into()) {
            inode.lock().entry.size = 4096;
        }
        rig.graph.serialize_all().unwrap();
        assert_eq!(rig.meta.get(&"a".into()).unwrap().size, 4096);
        rig.shutdown().await;
    }
}
