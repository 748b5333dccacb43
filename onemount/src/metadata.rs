//! Authoritative mapping from item id to metadata entry.
//!
//! The in-memory map is the working copy; every mutation is persisted
//! through the durable store so a restart reproduces the entry set.
//! State transitions are validated against the lifecycle diagram and
//! republished to the status layer through the transition hook.

mod entry;

pub use entry::{Entry, ItemKind, ItemState, OverlayPolicy, PendingRemote, Pin};

use crate::{
    store::{Bucket, Store},
    Error, ItemId, Result,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

pub type TransitionHook = Arc<dyn Fn(&Entry) + Send + Sync>;

pub struct MetadataStore {
    entries: scc::HashMap<ItemId, Entry>,
    store: Arc<Store>,
    on_transition: RwLock<Option<TransitionHook>>,
}

impl MetadataStore {
    /// Load all persisted entries; corrupt records are skipped with a
    /// warning and the system continues.
    pub fn open(store: Arc<Store>) -> Result<Arc<Self>> {
        let entries = scc::HashMap::new();
        store.for_each(Bucket::Metadata, |key, entry: Entry| {
            if entry.id.as_str().as_bytes() != key {
                warn!(id = %entry.id, "entry stored under mismatched key, skipping");
                return;
            }
            let _ = entries.insert(entry.id.clone(), entry);
        })?;

        Ok(Arc::new(MetadataStore {
            entries,
            store,
            on_transition: RwLock::new(None),
        }))
    }

    pub fn set_transition_hook(&self, hook: TransitionHook) {
        *self.on_transition.write() = Some(hook);
    }

    fn republish(&self, entry: &Entry) {
        let hook = self.on_transition.read().clone();
        if let Some(h) = hook {
            h(entry);
        }
    }

    pub fn get(&self, id: &ItemId) -> Option<Entry> {
        self.entries.read(id, |_, e| e.clone())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry and persist it.
    pub fn save(&self, entry: Entry) -> Result<()> {
        self.store
            .put(Bucket::Metadata, entry.id.as_str(), &entry)?;
        match self.entries.entry(entry.id.clone()) {
            scc::hash_map::Entry::Occupied(mut o) => {
                *o.get_mut() = entry;
            }
            scc::hash_map::Entry::Vacant(v) => {
                v.insert_entry(entry);
            }
        }
        Ok(())
    }

    /// Apply a mutation to an existing entry and persist the result.
    /// Returns the updated entry, or `None` when the id is unknown.
    pub fn update(&self, id: &ItemId, f: impl FnOnce(&mut Entry)) -> Result<Option<Entry>> {
        let updated = self.entries.update(id, |_, e| {
            f(e);
            e.clone()
        });
        match updated {
            Some(entry) => {
                self.store.put(Bucket::Metadata, id.as_str(), &entry)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &ItemId) -> Result<()> {
        self.entries.remove(id);
        self.store.delete(Bucket::Metadata, id.as_str())
    }

    pub fn for_each(&self, mut f: impl FnMut(&Entry)) {
        self.entries.scan(|_, e| f(e));
    }

    /// The root is the single entry without a parent.
    pub fn find_root(&self) -> Option<Entry> {
        let mut root = None;
        self.entries.scan(|_, e| {
            if e.parent_id.is_none() && root.is_none() {
                root = Some(e.clone());
            }
        });
        root
    }

    /// Validated state transition. Invalid edges are rejected with a
    /// `Validation` error; directories only ever hold `Hydrated`.
    pub fn transition_state(
        &self,
        id: &ItemId,
        to: ItemState,
        clear_pending_remote: bool,
    ) -> Result<Entry> {
        let result = self.entries.update(id, |_, e| {
            if e.is_directory() && to != ItemState::Hydrated {
                return Err(Error::validation(format!(
                    "directory {} cannot enter {:?}",
                    e.id, to
                )));
            }
            if e.state != to && !e.state.can_transition(to) {
                return Err(Error::validation(format!(
                    "invalid transition {:?} -> {:?} on {}",
                    e.state, to, e.id
                )));
            }
            e.state = to;
            if clear_pending_remote {
                e.pending_remote = None;
            }
            if to == ItemState::Hydrated && !e.is_directory() {
                e.last_hydrated = Some(crate::task::unix_secs());
            }
            Ok(e.clone())
        });

        let entry = match result {
            Some(r) => r?,
            None => return Err(Error::not_found(id)),
        };

        self.store.put(Bucket::Metadata, id.as_str(), &entry)?;
        self.republish(&entry);
        Ok(entry)
    }

    /// Move `child` from one parent's children list to another's, and
    /// rewrite its `parent_id`, all observed in a single batch.
    pub fn reparent(&self, child_id: &ItemId, from: &ItemId, to: &ItemId) -> Result<()> {
        let from_entry = self.entries.update(from, |_, e| {
            e.children.retain(|c| c != child_id);
            e.clone()
        });
        let to_entry = self.entries.update(to, |_, e| {
            if !e.children.contains(child_id) {
                e.children.push(child_id.clone());
            }
            e.clone()
        });
        let child = self.entries.update(child_id, |_, e| {
            e.parent_id = Some(to.clone());
            e.clone()
        });

        self.store.batch(|b| {
            if let Some(ref e) = from_entry {
                b.put(Bucket::Metadata, e.id.as_str(), e)?;
            }
            if let Some(ref e) = to_entry {
                b.put(Bucket::Metadata, e.id.as_str(), e)?;
            }
            if let Some(ref e) = child {
                b.put(Bucket::Metadata, e.id.as_str(), e)?;
            }
            Ok(())
        })
    }

    /// Persist the given entries in one serialized batch.
    pub fn save_all<'a>(&self, entries: impl Iterator<Item = &'a Entry>) -> Result<()> {
        self.store.batch(|b| {
            for entry in entries {
                b.put(Bucket::Metadata, entry.id.as_str(), entry)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Store;

    fn open_store() -> (tempfile::TempDir, Arc<MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let meta = MetadataStore::open(store).unwrap();
        (dir, meta)
    }

    #[test]
    fn save_update_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(Store::open(dir.path()).unwrap());
            let meta = MetadataStore::open(store).unwrap();
            let entry = Entry::new_file("f1".into(), "root".into(), "a.txt");
            meta.save(entry).unwrap();
            meta.update(&"f1".into(), |e| e.size = 100).unwrap();
        }
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let meta = MetadataStore::open(store).unwrap();
        let entry = meta.get(&"f1".into()).unwrap();
        assert_eq!(entry.size, 100);
        assert_eq!(entry.name, "a.txt");
    }

    #[test]
    fn rejects_invalid_transition() {
        let (_dir, meta) = open_store();
        let entry = Entry::new_file("f1".into(), "root".into(), "a.txt");
        meta.save(entry).unwrap();

        // Ghost -> Hydrated skips hydration
        assert!(meta
            .transition_state(&"f1".into(), ItemState::Hydrated, false)
            .is_err());

        meta.transition_state(&"f1".into(), ItemState::Hydrating, false)
            .unwrap();
        let entry = meta
            .transition_state(&"f1".into(), ItemState::Hydrated, false)
            .unwrap();
        assert_eq!(entry.state, ItemState::Hydrated);
        assert!(entry.last_hydrated.is_some());
    }

    #[test]
    fn transition_clears_pending_remote() {
        let (_dir, meta) = open_store();
        let mut entry = Entry::new_file("f1".into(), "root".into(), "new.txt");
        entry.state = ItemState::DirtyLocal;
        entry.pending_remote = Some(PendingRemote::new());
        meta.save(entry).unwrap();

        let entry = meta
            .transition_state(&"f1".into(), ItemState::Hydrated, true)
            .unwrap();
        assert!(entry.pending_remote.is_none());
    }

    #[test]
    fn transition_hook_fires() {
        let (_dir, meta) = open_store();
        let seen: Arc<parking_lot::Mutex<Vec<ItemState>>> = Arc::default();
        let sink = seen.clone();
        meta.set_transition_hook(Arc::new(move |e| sink.lock().push(e.state)));

        meta.save(Entry::new_file("f1".into(), "root".into(), "a")).unwrap();
        meta.transition_state(&"f1".into(), ItemState::Hydrating, false)
            .unwrap();
        assert_eq!(seen.lock().as_slice(), &[ItemState::Hydrating]);
    }

    #[test]
    fn reparent_moves_child_between_lists() {
        let (_dir, meta) = open_store();
        let mut a = Entry::new_directory("a".into(), None, "a");
        a.children.push("c".into());
        meta.save(a).unwrap();
        meta.save(Entry::new_directory("b".into(), None, "b")).unwrap();
        meta.save(Entry::new_file("c".into(), "a".into(), "c.txt")).unwrap();

        meta.reparent(&"c".into(), &"a".into(), &"b".into()).unwrap();

        assert!(meta.get(&"a".into()).unwrap().children.is_empty());
        assert_eq!(meta.get(&"b".into()).unwrap().children, vec![ItemId::from("c")]);
        assert_eq!(
            meta.get(&"c".into()).unwrap().parent_id,
            Some(ItemId::from("b"))
        );
    }
}
