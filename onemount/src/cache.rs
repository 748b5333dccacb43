//! On-disk content cache.
//!
//! One regular file per item id in a flat directory, with an in-memory
//! LRU index reconciled from the directory on open. Inserts beyond the
//! byte cap evict least-recently-used blobs, skipping ids that are
//! currently open or rejected by the eviction guard; every evicted id
//! is reported to the eviction handler so the metadata store can flip
//! the item back to ghost.

use crate::{ItemId, Error, Result};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{
    fs,
    io::Read,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

pub type EvictionGuard = Arc<dyn Fn(&ItemId) -> bool + Send + Sync>;
pub type EvictionHandler = Arc<dyn Fn(&ItemId) + Send + Sync>;

struct FileAccess {
    size: u64,
}

pub struct ContentCache {
    dir: PathBuf,
    // access-ordered index; eviction walks from the LRU end
    index: Mutex<LruCache<ItemId, FileAccess>>,
    current: AtomicU64,
    max_size: AtomicU64,
    open_handles: scc::HashMap<ItemId, usize>,
    /// Handles opened before an id rewrite release through the alias.
    rekeys: scc::HashMap<ItemId, ItemId>,
    open_count: AtomicUsize,
    open_file_limit: usize,
    guard: RwLock<Option<EvictionGuard>>,
    handler: RwLock<Option<EvictionHandler>>,
}

impl ContentCache {
    /// Open (or create) a cache directory and rebuild the LRU index.
    ///
    /// Files are inserted in access-time order so the least recently
    /// used blob is the first eviction candidate. Many filesystems
    /// ignore atime; modification time is the fallback and this is a
    /// best-effort ordering between processes.
    pub fn open(dir: impl AsRef<Path>, max_size: u64, open_file_limit: usize) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            let atime = meta.accessed().or_else(|_| meta.modified())?;
            files.push((ItemId::from(name.into_owned()), meta.len(), atime));
        }
        files.sort_by(|a, b| a.2.cmp(&b.2));

        let mut index = LruCache::unbounded();
        let mut current = 0u64;
        for (id, size, _) in files {
            current += size;
            index.put(id, FileAccess { size });
        }

        Ok(Arc::new(ContentCache {
            dir,
            index: Mutex::new(index),
            current: AtomicU64::new(current),
            max_size: AtomicU64::new(max_size),
            open_handles: scc::HashMap::new(),
            rekeys: scc::HashMap::new(),
            open_count: AtomicUsize::new(0),
            open_file_limit,
            guard: RwLock::new(None),
            handler: RwLock::new(None),
        }))
    }

    pub fn set_max_size(&self, bytes: u64) {
        self.max_size.store(bytes, Ordering::Relaxed);
    }

    pub fn set_eviction_guard(&self, guard: EvictionGuard) {
        *self.guard.write() = Some(guard);
    }

    pub fn set_eviction_handler(&self, handler: EvictionHandler) {
        *self.handler.write() = Some(handler);
    }

    fn path_of(&self, id: &ItemId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    pub fn has(&self, id: &ItemId) -> bool {
        self.index.lock().contains(id)
    }

    /// Total bytes currently accounted to the cache.
    pub fn size(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn file_count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn open_file_count(&self) -> usize {
        self.open_count.load(Ordering::Relaxed)
    }

    fn is_open(&self, id: &ItemId) -> bool {
        self.open_handles.contains(id)
    }

    /// Evict until `required` additional bytes fit under the cap.
    ///
    /// Walks the index from the least recently used end, skipping ids
    /// with open handles and ids the guard refuses. Errors with
    /// `CacheFull` when no candidate can be freed.
    fn make_space(&self, required: u64) -> Result<()> {
        let cap = self.max_size.load(Ordering::Relaxed);
        if cap == 0 {
            return Ok(());
        }

        loop {
            let current = self.current.load(Ordering::Relaxed);
            if current.saturating_add(required) <= cap {
                return Ok(());
            }

            let victim = {
                let index = self.index.lock();
                let guard = self.guard.read();
                let mut found = None;
                for (id, access) in index.iter().rev() {
                    if self.is_open(id) {
                        continue;
                    }
                    if let Some(g) = guard.as_ref() {
                        if !g(id) {
                            continue;
                        }
                    }
                    found = Some((id.clone(), access.size));
                    break;
                }
                found
            };

            let (id, size) = match victim {
                Some(v) => v,
                None => return Err(Error::CacheFull),
            };

            self.index.lock().pop(&id);
            if let Err(e) = fs::remove_file(self.path_of(&id)) {
                warn!(id = %id, err = %e, "failed to remove evicted blob");
            }
            self.current.fetch_sub(size, Ordering::Relaxed);
            debug!(id = %id, size, "evicted from content cache");

            let handler = self.handler.read().clone();
            if let Some(h) = handler {
                h(&id);
            }
        }
    }

    pub fn insert(&self, id: &ItemId, data: &[u8]) -> Result<()> {
        let old = self.index.lock().get(id).map(|a| a.size).unwrap_or(0);
        let delta = (data.len() as u64).saturating_sub(old);
        self.make_space(delta)?;

        fs::write(self.path_of(id), data)?;

        let mut index = self.index.lock();
        if let Some(prev) = index.put(id.clone(), FileAccess { size: data.len() as u64 }) {
            self.current.fetch_sub(prev.size, Ordering::Relaxed);
        }
        self.current.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stream `reader` into the blob for `id`, returning bytes written.
    ///
    /// The size is unknown up front, so the cap is enforced after the
    /// write; the fresh blob is most recently used and therefore the
    /// last eviction candidate.
    pub fn insert_stream(&self, id: &ItemId, reader: &mut dyn Read) -> Result<u64> {
        let path = self.path_of(id);
        let mut file = fs::File::create(&path)?;
        let written = std::io::copy(reader, &mut file)?;
        file.sync_all()?;
        drop(file);

        let mut index = self.index.lock();
        if let Some(prev) = index.put(id.clone(), FileAccess { size: written }) {
            self.current.fetch_sub(prev.size, Ordering::Relaxed);
        }
        self.current.fetch_add(written, Ordering::Relaxed);
        drop(index);

        self.make_space(0)?;
        Ok(written)
    }

    pub fn get(&self, id: &ItemId) -> Result<Vec<u8>> {
        if !self.index.lock().contains(id) {
            return Err(Error::not_found(id));
        }
        self.index.lock().promote(id);
        Ok(fs::read(self.path_of(id))?)
    }

    /// Open (creating if needed) the backing file for reads and
    /// writes. Handles pin the blob against eviction until dropped.
    pub fn open_file(self: &Arc<Self>, id: &ItemId) -> Result<CacheHandle> {
        if self.open_count.load(Ordering::Relaxed) >= self.open_file_limit {
            return Err(Error::Io {
                source: std::io::Error::from_raw_os_error(libc::EMFILE),
            });
        }

        let path = self.path_of(id);
        let fresh = !path.exists();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if fresh {
            self.index.lock().put(id.clone(), FileAccess { size: 0 });
        } else {
            self.index.lock().promote(id);
        }

        self.open_handles
            .entry(id.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
        self.open_count.fetch_add(1, Ordering::Relaxed);

        Ok(CacheHandle {
            cache: Arc::clone(self),
            id: id.clone(),
            file,
        })
    }

    fn release(&self, id: &ItemId) {
        let mut key = id.clone();
        if !self.open_handles.contains(&key) {
            if let Some(target) = self.rekeys.read(&key, |_, v| v.clone()) {
                key = target;
            }
        }
        let fully_released = self
            .open_handles
            .remove_if(&key, |count| {
                if *count > 1 {
                    *count -= 1;
                    false
                } else {
                    true
                }
            })
            .is_some();
        if fully_released {
            self.rekeys.retain(|_, v| *v != key);
        }
        self.open_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Called by handles after writes so the index accounting follows
    /// the file size.
    fn update_size(&self, id: &ItemId, size: u64) {
        let mut index = self.index.lock();
        let old = match index.get_mut(id) {
            Some(access) => std::mem::replace(&mut access.size, size),
            None => {
                index.put(id.clone(), FileAccess { size });
                0
            }
        };
        drop(index);
        if size >= old {
            self.current.fetch_add(size - old, Ordering::Relaxed);
        } else {
            self.current.fetch_sub(old - size, Ordering::Relaxed);
        }
    }

    pub fn delete(&self, id: &ItemId) -> Result<()> {
        if let Some(access) = self.index.lock().pop(id) {
            self.current.fetch_sub(access.size, Ordering::Relaxed);
        }
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename the blob when an item id is rewritten. Recency and size
    /// accounting carry over.
    pub fn move_id(&self, old: &ItemId, new: &ItemId) -> Result<()> {
        let mut index = self.index.lock();
        let access = match index.pop(old) {
            Some(a) => a,
            None => return Ok(()),
        };
        fs::rename(self.path_of(old), self.path_of(new))?;
        index.put(new.clone(), access);
        drop(index);

        if let Some((_, count)) = self.open_handles.remove(old) {
            let _ = self.open_handles.insert(new.clone(), count);
            let _ = self.rekeys.insert(old.clone(), new.clone());
        }
        Ok(())
    }

    /// Remove blobs untouched for `older_than_days`, then enforce the
    /// size cap. Returns the number of removed files.
    pub fn cleanup(&self, older_than_days: i64) -> Result<usize> {
        let mut removed = 0;
        if older_than_days > 0 {
            let horizon = SystemTime::now() - Duration::from_secs(older_than_days as u64 * 86_400);
            let stale: Vec<ItemId> = {
                let index = self.index.lock();
                let guard = self.guard.read();
                index
                    .iter()
                    .filter(|(id, _)| !self.is_open(id))
                    .filter(|(id, _)| guard.as_ref().map(|g| g(id)).unwrap_or(true))
                    .filter(|(id, _)| {
                        fs::metadata(self.path_of(id))
                            .and_then(|m| m.accessed().or_else(|_| m.modified()))
                            .map(|t| t < horizon)
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in stale {
                self.delete(&id)?;
                removed += 1;
                let handler = self.handler.read().clone();
                if let Some(h) = handler {
                    h(&id);
                }
            }
        }
        self.make_space(0)?;
        Ok(removed)
    }
}

/// An open read/write handle on a cached blob. While any handle for an
/// id is alive the blob cannot be evicted.
pub struct CacheHandle {
    cache: Arc<ContentCache>,
    id: ItemId,
    file: fs::File,
}

impl CacheHandle {
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let written = self.file.write_at(data, offset)?;
        let len = self.file.metadata()?.len();
        self.cache.update_size(&self.id, len);
        Ok(written)
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.cache.update_size(&self.id, len);
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.release(&self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache_with_cap(cap: u64) -> (tempfile::TempDir, Arc<ContentCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), cap, 100).unwrap();
        (dir, cache)
    }

    #[test]
    fn insert_get_roundtrip() {
        let (_dir, cache) = cache_with_cap(0);
        let id = ItemId::from("blob1");
        cache.insert(&id, b"hello").unwrap();
        assert!(cache.has(&id));
        assert_eq!(cache.get(&id).unwrap(), b"hello");
        assert_eq!(cache.size(), 5);
    }

    #[test]
    fn lru_eviction_under_cap() {
        let (_dir, cache) = cache_with_cap(10);
        let evicted: Arc<Mutex<Vec<ItemId>>> = Arc::default();
        let seen = evicted.clone();
        cache.set_eviction_handler(Arc::new(move |id| seen.lock().push(id.clone())));

        for i in 0..12 {
            let id = ItemId::from(format!("blob{}", i));
            cache.insert(&id, &[0u8; 1]).unwrap();
        }

        assert!(cache.size() <= 11);
        let evicted = evicted.lock();
        assert!(evicted.len() >= 2);
        // the two oldest untouched blobs go first
        assert_eq!(evicted[0], ItemId::from("blob0"));
        assert_eq!(evicted[1], ItemId::from("blob1"));
    }

    #[test]
    fn open_handles_are_never_evicted() {
        let (_dir, cache) = cache_with_cap(2);
        let pinned = ItemId::from("pinned");
        cache.insert(&pinned, b"a").unwrap();
        let _handle = cache.open_file(&pinned).unwrap();

        let other = ItemId::from("other");
        cache.insert(&other, b"b").unwrap();
        // a third insert must evict `other`, not the open blob
        cache.insert(&ItemId::from("third"), b"c").unwrap();
        assert!(cache.has(&pinned));
    }

    #[test]
    fn guard_refusing_everything_fails_with_cache_full() {
        let (_dir, cache) = cache_with_cap(2);
        cache.set_eviction_guard(Arc::new(|_| false));
        cache.insert(&ItemId::from("a"), b"xy").unwrap();
        match cache.insert(&ItemId::from("b"), b"zw") {
            Err(Error::CacheFull) => {}
            other => panic!("expected CacheFull, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn index_rebuild_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ContentCache::open(dir.path(), 0, 100).unwrap();
            cache.insert(&ItemId::from("persisted"), b"data").unwrap();
        }
        let cache = ContentCache::open(dir.path(), 0, 100).unwrap();
        assert!(cache.has(&ItemId::from("persisted")));
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn move_id_carries_content() {
        let (_dir, cache) = cache_with_cap(0);
        let old = ItemId::from("local-1");
        let new = ItemId::from("remote-1");
        cache.insert(&old, b"payload").unwrap();
        cache.move_id(&old, &new).unwrap();
        assert!(!cache.has(&old));
        assert_eq!(cache.get(&new).unwrap(), b"payload");
    }

    #[test]
    fn handle_write_updates_accounting() {
        let (_dir, cache) = cache_with_cap(0);
        let id = ItemId::from("file");
        let handle = cache.open_file(&id).unwrap();
        handle.write_at(b"0123456789", 0).unwrap();
        drop(handle);
        assert_eq!(cache.size(), 10);
        assert_eq!(cache.open_file_count(), 0);
    }
}
