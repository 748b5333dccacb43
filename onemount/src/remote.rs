//! Abstract remote object store.
//!
//! The engine treats the cloud drive as a collaborator returning typed
//! items and delta pages; the wire format and HTTP plumbing live
//! outside this crate. Etag preconditions surface as `Conflict`, lost
//! connectivity as `Network`.

use crate::{metadata::ItemKind, Error, ItemId, Result};
use async_trait::async_trait;

/// Sentinel cursor meaning "from the beginning". Stored verbatim like
/// any server-issued cursor.
pub const INITIAL_DELTA_CURSOR: &str = "";

/// A typed item as the server describes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: u64,
    pub etag: String,
    /// Server-side quick hash when the service provides one.
    pub content_hash: Option<String>,
    pub deleted: bool,
}

/// One page of the server change feed.
#[derive(Clone, Debug)]
pub struct DeltaPage {
    pub items: Vec<DriveItem>,
    /// More pages follow within the same cycle.
    pub next_link: Option<String>,
    /// Cursor for the next cycle; present on the final page only.
    pub delta_link: Option<String>,
}

/// Handle for a server-side chunked upload session.
pub type UploadSessionRef = String;

#[async_trait]
pub trait Remote: Send + Sync {
    async fn item(&self, id: &ItemId) -> Result<DriveItem>;

    async fn item_by_path(&self, path: &str) -> Result<DriveItem>;

    async fn children(&self, id: &ItemId) -> Result<Vec<DriveItem>>;

    async fn delta(&self, cursor: &str) -> Result<DeltaPage>;

    async fn download_range(&self, id: &ItemId, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Single-shot upload for small items. `if_match` carries the
    /// cached etag; a mismatch fails with `Conflict`.
    async fn put_small(
        &self,
        id: &ItemId,
        parent: &ItemId,
        name: &str,
        data: &[u8],
        if_match: Option<&str>,
    ) -> Result<DriveItem>;

    async fn begin_upload(
        &self,
        id: &ItemId,
        parent: &ItemId,
        name: &str,
        size: u64,
        if_match: Option<&str>,
    ) -> Result<UploadSessionRef>;

    /// Returns the finished item on the final chunk.
    async fn upload_chunk(
        &self,
        session: &UploadSessionRef,
        offset: u64,
        total: u64,
        data: &[u8],
    ) -> Result<Option<DriveItem>>;

    async fn cancel_upload(&self, session: &UploadSessionRef) -> Result<()>;

    async fn mkdir(&self, parent: &ItemId, name: &str) -> Result<DriveItem>;

    async fn remove(&self, id: &ItemId, if_match: Option<&str>) -> Result<()>;

    async fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
        if_match: Option<&str>,
    ) -> Result<DriveItem>;

    /// Realtime change pulses, when the provider supports a
    /// subscription channel.
    fn subscribe(&self) -> Option<flume::Receiver<()>> {
        None
    }
}

#[cfg(any(test, feature = "_test"))]
pub mod test {
    use super::*;
    use crate::quick_hash;
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
    };

    pub const ROOT_ID: &str = "root";
    const PAGE_SIZE: usize = 2;

    struct PendingUpload {
        id: ItemId,
        parent: ItemId,
        name: String,
        size: u64,
        buf: Vec<u8>,
    }

    #[derive(Default)]
    struct Inner {
        items: HashMap<ItemId, DriveItem>,
        contents: HashMap<ItemId, Vec<u8>>,
        /// Every mutation appends its resulting item snapshot here;
        /// cursors index into this journal.
        changes: Vec<DriveItem>,
        sessions: HashMap<String, PendingUpload>,
    }

    /// In-memory remote with fault injection and a scripted change
    /// feed, for exercising the engine end to end.
    pub struct MockRemote {
        inner: Mutex<Inner>,
        offline: AtomicBool,
        etag_seq: AtomicU64,
        session_seq: AtomicU64,
        remote_seq: AtomicU64,
        pub children_calls: AtomicUsize,
        pub delta_calls: AtomicUsize,
        pulses: Mutex<Option<(flume::Sender<()>, flume::Receiver<()>)>>,
    }

    impl MockRemote {
        pub fn new() -> Arc<Self> {
            let remote = MockRemote {
                inner: Mutex::default(),
                offline: AtomicBool::new(false),
                etag_seq: AtomicU64::new(1),
                session_seq: AtomicU64::new(1),
                remote_seq: AtomicU64::new(1),
                children_calls: AtomicUsize::new(0),
                delta_calls: AtomicUsize::new(0),
                pulses: Mutex::new(None),
            };
            let root = DriveItem {
                id: ROOT_ID.into(),
                parent_id: None,
                name: "/".to_owned(),
                kind: ItemKind::Directory,
                size: 0,
                mtime: 1,
                etag: "root-1".to_owned(),
                content_hash: None,
                deleted: false,
            };
            remote.inner.lock().items.insert(root.id.clone(), root);
            Arc::new(remote)
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                Err(Error::network("remote unreachable"))
            } else {
                Ok(())
            }
        }

        fn next_etag(&self) -> String {
            format!("e{}", self.etag_seq.fetch_add(1, Ordering::SeqCst))
        }

        fn next_remote_id(&self) -> ItemId {
            format!("remote-{}", self.remote_seq.fetch_add(1, Ordering::SeqCst)).into()
        }

        /// Seed or update an item directly, recording a change feed
        /// entry.
        pub fn seed_file(&self, id: &str, parent: &str, name: &str, content: &[u8]) -> DriveItem {
            let item = DriveItem {
                id: id.into(),
                parent_id: Some(parent.into()),
                name: name.to_owned(),
                kind: ItemKind::File,
                size: content.len() as u64,
                mtime: crate::task::unix_secs(),
                etag: self.next_etag(),
                content_hash: Some(quick_hash(content)),
                deleted: false,
            };
            let mut inner = self.inner.lock();
            inner.contents.insert(item.id.clone(), content.to_vec());
            inner.items.insert(item.id.clone(), item.clone());
            inner.changes.push(item.clone());
            item
        }

        pub fn seed_dir(&self, id: &str, parent: &str, name: &str) -> DriveItem {
            let item = DriveItem {
                id: id.into(),
                parent_id: Some(parent.into()),
                name: name.to_owned(),
                kind: ItemKind::Directory,
                size: 0,
                mtime: crate::task::unix_secs(),
                etag: self.next_etag(),
                content_hash: None,
                deleted: false,
            };
            let mut inner = self.inner.lock();
            inner.items.insert(item.id.clone(), item.clone());
            inner.changes.push(item.clone());
            item
        }

        pub fn delete_remote(&self, id: &str) {
            let mut inner = self.inner.lock();
            if let Some(mut item) = inner.items.remove(&ItemId::from(id)) {
                inner.contents.remove(&item.id);
                item.deleted = true;
                inner.changes.push(item);
            }
        }

        pub fn etag_of(&self, id: &str) -> Option<String> {
            self.inner.lock().items.get(&ItemId::from(id)).map(|i| i.etag.clone())
        }

        pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
            self.inner.lock().contents.get(&ItemId::from(id)).cloned()
        }

        pub fn item_named(&self, parent: &str, name: &str) -> Option<DriveItem> {
            let parent = ItemId::from(parent);
            self.inner
                .lock()
                .items
                .values()
                .find(|i| i.parent_id.as_ref() == Some(&parent) && i.name == name)
                .cloned()
        }

        pub fn enable_pulses(&self) -> flume::Sender<()> {
            let (tx, rx) = flume::unbounded();
            *self.pulses.lock() = Some((tx.clone(), rx));
            tx
        }

        fn complete_upload(
            &self,
            inner: &mut Inner,
            id: &ItemId,
            parent: &ItemId,
            name: &str,
            data: Vec<u8>,
            if_match: Option<&str>,
        ) -> Result<DriveItem> {
            if let Some(expected) = if_match {
                match inner.items.get(id) {
                    Some(existing) if existing.etag != expected => {
                        return Err(Error::Conflict { id: id.to_string() });
                    }
                    _ => {}
                }
            }

            // creations under a local id get a permanent server id
            let final_id = if id.is_local() || !inner.items.contains_key(id) {
                match inner
                    .items
                    .values()
                    .find(|i| i.parent_id.as_ref() == Some(parent) && i.name == name)
                {
                    Some(existing) => existing.id.clone(),
                    None => self.next_remote_id(),
                }
            } else {
                id.clone()
            };

            let item = DriveItem {
                id: final_id.clone(),
                parent_id: Some(parent.clone()),
                name: name.to_owned(),
                kind: ItemKind::File,
                size: data.len() as u64,
                mtime: crate::task::unix_secs(),
                etag: self.next_etag(),
                content_hash: Some(quick_hash(&data)),
                deleted: false,
            };
            inner.contents.insert(final_id.clone(), data);
            inner.items.insert(final_id, item.clone());
            inner.changes.push(item.clone());
            Ok(item)
        }
    }

    #[async_trait]
    impl Remote for MockRemote {
        async fn item(&self, id: &ItemId) -> Result<DriveItem> {
            self.check_online()?;
            self.inner
                .lock()
                .items
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(id))
        }

        async fn item_by_path(&self, path: &str) -> Result<DriveItem> {
            self.check_online()?;
            let inner = self.inner.lock();
            let mut current = inner
                .items
                .get(&ItemId::from(ROOT_ID))
                .cloned()
                .ok_or_else(|| Error::not_found(path))?;
            for part in path.split('/').filter(|p| !p.is_empty()) {
                current = inner
                    .items
                    .values()
                    .find(|i| i.parent_id.as_ref() == Some(&current.id) && i.name == part)
                    .cloned()
                    .ok_or_else(|| Error::not_found(path))?;
            }
            Ok(current)
        }

        async fn children(&self, id: &ItemId) -> Result<Vec<DriveItem>> {
            self.check_online()?;
            self.children_calls.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.lock();
            if !inner.items.contains_key(id) {
                return Err(Error::not_found(id));
            }
            let mut children: Vec<DriveItem> = inner
                .items
                .values()
                .filter(|i| i.parent_id.as_ref() == Some(id))
                .cloned()
                .collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(children)
        }

        async fn delta(&self, cursor: &str) -> Result<DeltaPage> {
            self.check_online()?;
            self.delta_calls.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.lock();

            // snapshot phase: `s:<offset>`; journal phase: `c:<index>`
            let (snapshot, offset) = match cursor {
                INITIAL_DELTA_CURSOR => (true, 0usize),
                c if c.starts_with("s:") => (true, c[2..].parse().map_err(|_| Error::corruption(c))?),
                c if c.starts_with("c:") => (false, c[2..].parse().map_err(|_| Error::corruption(c))?),
                c => return Err(Error::corruption(format!("bad cursor {}", c))),
            };

            if snapshot {
                let mut all: Vec<DriveItem> = inner.items.values().cloned().collect();
                // parents before children so application never skips
                let depth_of = |item: &DriveItem| {
                    let mut depth = 0usize;
                    let mut cursor = item.parent_id.clone();
                    while let Some(pid) = cursor {
                        depth += 1;
                        cursor = inner.items.get(&pid).and_then(|p| p.parent_id.clone());
                    }
                    depth
                };
                all.sort_by_key(|i| (depth_of(i), i.id.clone()));
                let page: Vec<DriveItem> = all.iter().skip(offset).take(PAGE_SIZE).cloned().collect();
                let consumed = offset + page.len();
                if consumed < all.len() {
                    Ok(DeltaPage {
                        items: page,
                        next_link: Some(format!("s:{}", consumed)),
                        delta_link: None,
                    })
                } else {
                    Ok(DeltaPage {
                        items: page,
                        next_link: None,
                        delta_link: Some(format!("c:{}", inner.changes.len())),
                    })
                }
            } else {
                let page: Vec<DriveItem> =
                    inner.changes.iter().skip(offset).take(PAGE_SIZE).cloned().collect();
                let consumed = offset + page.len();
                if consumed < inner.changes.len() {
                    Ok(DeltaPage {
                        items: page,
                        next_link: Some(format!("c:{}", consumed)),
                        delta_link: None,
                    })
                } else {
                    Ok(DeltaPage {
                        items: page,
                        next_link: None,
                        delta_link: Some(format!("c:{}", consumed)),
                    })
                }
            }
        }

        async fn download_range(&self, id: &ItemId, offset: u64, len: u64) -> Result<Vec<u8>> {
            self.check_online()?;
            let inner = self.inner.lock();
            let content = inner.contents.get(id).ok_or_else(|| Error::not_found(id))?;
            let start = (offset as usize).min(content.len());
            let end = ((offset + len) as usize).min(content.len());
            Ok(content[start..end].to_vec())
        }

        async fn put_small(
            &self,
            id: &ItemId,
            parent: &ItemId,
            name: &str,
            data: &[u8],
            if_match: Option<&str>,
        ) -> Result<DriveItem> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            self.complete_upload(&mut inner, id, parent, name, data.to_vec(), if_match)
        }

        async fn begin_upload(
            &self,
            id: &ItemId,
            parent: &ItemId,
            name: &str,
            size: u64,
            if_match: Option<&str>,
        ) -> Result<UploadSessionRef> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            if let Some(expected) = if_match {
                match inner.items.get(id) {
                    Some(existing) if existing.etag != expected => {
                        return Err(Error::Conflict { id: id.to_string() });
                    }
                    _ => {}
                }
            }
            let session = format!("session-{}", self.session_seq.fetch_add(1, Ordering::SeqCst));
            inner.sessions.insert(
                session.clone(),
                PendingUpload {
                    id: id.clone(),
                    parent: parent.clone(),
                    name: name.to_owned(),
                    size,
                    buf: Vec::with_capacity(size as usize),
                },
            );
            Ok(session)
        }

        async fn upload_chunk(
            &self,
            session: &UploadSessionRef,
            offset: u64,
            total: u64,
            data: &[u8],
        ) -> Result<Option<DriveItem>> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            let pending = inner
                .sessions
                .get_mut(session)
                .ok_or_else(|| Error::not_found(session))?;
            if pending.buf.len() as u64 != offset || pending.size != total {
                return Err(Error::validation("chunk out of order"));
            }
            pending.buf.extend_from_slice(data);
            if (pending.buf.len() as u64) < total {
                return Ok(None);
            }

            let done = inner.sessions.remove(session).unwrap();
            self.complete_upload(&mut inner, &done.id, &done.parent, &done.name, done.buf, None)
                .map(Some)
        }

        async fn cancel_upload(&self, session: &UploadSessionRef) -> Result<()> {
            self.inner.lock().sessions.remove(session);
            Ok(())
        }

        async fn mkdir(&self, parent: &ItemId, name: &str) -> Result<DriveItem> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            if inner
                .items
                .values()
                .any(|i| i.parent_id.as_ref() == Some(parent) && i.name == name)
            {
                return Err(Error::AlreadyExists { name: name.to_owned() });
            }
            let item = DriveItem {
                id: self.next_remote_id(),
                parent_id: Some(parent.clone()),
                name: name.to_owned(),
                kind: ItemKind::Directory,
                size: 0,
                mtime: crate::task::unix_secs(),
                etag: self.next_etag(),
                content_hash: None,
                deleted: false,
            };
            inner.items.insert(item.id.clone(), item.clone());
            inner.changes.push(item.clone());
            Ok(item)
        }

        async fn remove(&self, id: &ItemId, if_match: Option<&str>) -> Result<()> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            match inner.items.get(id) {
                None => return Err(Error::not_found(id)),
                Some(existing) => {
                    if let Some(expected) = if_match {
                        if existing.etag != expected {
                            return Err(Error::Conflict { id: id.to_string() });
                        }
                    }
                }
            }
            let mut item = inner.items.remove(id).unwrap();
            inner.contents.remove(id);
            item.deleted = true;
            inner.changes.push(item);
            Ok(())
        }

        async fn rename(
            &self,
            id: &ItemId,
            new_parent: &ItemId,
            new_name: &str,
            if_match: Option<&str>,
        ) -> Result<DriveItem> {
            self.check_online()?;
            let mut inner = self.inner.lock();
            match inner.items.get(id) {
                None => return Err(Error::not_found(id)),
                Some(existing) => {
                    if let Some(expected) = if_match {
                        if existing.etag != expected {
                            return Err(Error::Conflict { id: id.to_string() });
                        }
                    }
                }
            }
            let etag = self.next_etag();
            let item = inner.items.get_mut(id).unwrap();
            item.parent_id = Some(new_parent.clone());
            item.name = new_name.to_owned();
            item.etag = etag;
            let snapshot = item.clone();
            inner.changes.push(snapshot.clone());
            Ok(snapshot)
        }

        fn subscribe(&self) -> Option<flume::Receiver<()>> {
            self.pulses.lock().as_ref().map(|(_, rx)| rx.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test::MockRemote, *};

    #[tokio::test]
    async fn mock_delta_pages_until_delta_link() {
        let remote = MockRemote::new();
        remote.seed_dir("d1", test::ROOT_ID, "docs");
        remote.seed_file("f1", "d1", "a.txt", b"aaa");
        remote.seed_file("f2", "d1", "b.txt", b"bbb");

        let mut cursor = INITIAL_DELTA_CURSOR.to_owned();
        let mut seen = vec![];
        let final_cursor = loop {
            let page = remote.delta(&cursor).await.unwrap();
            seen.extend(page.items.iter().map(|i| i.id.clone()));
            match page.next_link {
                Some(next) => cursor = next,
                None => break page.delta_link.unwrap(),
            }
        };
        assert_eq!(seen.len(), 4); // root + three seeded
        assert!(final_cursor.starts_with("c:"));

        // nothing new: empty page, same cursor class
        let page = remote.delta(&final_cursor).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_link.is_none());
    }

    #[tokio::test]
    async fn mock_precondition_fails_as_conflict() {
        let remote = MockRemote::new();
        remote.seed_file("f1", test::ROOT_ID, "a.txt", b"v1");
        let err = remote
            .put_small(&"f1".into(), &test::ROOT_ID.into(), "a.txt", b"v2", Some("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn mock_chunked_upload_assembles() {
        let remote = MockRemote::new();
        let session = remote
            .begin_upload(&ItemId::fresh_local(), &test::ROOT_ID.into(), "big.bin", 6, None)
            .await
            .unwrap();
        assert!(remote.upload_chunk(&session, 0, 6, b"abc").await.unwrap().is_none());
        let item = remote
            .upload_chunk(&session, 3, 6, b"def")
            .await
            .unwrap()
            .expect("final chunk yields item");
        assert_eq!(item.size, 6);
        assert!(!item.id.is_local());
        assert_eq!(remote.content_of(item.id.as_str()).unwrap(), b"abcdef");
    }
}
