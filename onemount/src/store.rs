//! Durable key/value store backing all persisted engine state.
//!
//! Typed buckets map onto sled trees. Values are MessagePack; keys are
//! item ids or fixed well-known strings. Writes that must be observed
//! together go through [`Store::batch`], which is serialized and
//! flushed before returning, so cross-worker ordering is exactly the
//! batch order.

use crate::{deserialize_from_slice, serialize_to_vec, Error, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

/// On-disk schema version gated by the `version` bucket.
const SCHEMA_VERSION: u32 = 1;
const SCHEMA_KEY: &str = "schema";

/// A lock file older than this is considered stale and removed.
const STALE_LOCK_AGE: Duration = Duration::from_secs(5 * 60);

const OPEN_RETRIES: u32 = 10;
const OPEN_BACKOFF_BASE: Duration = Duration::from_millis(200);
const OPEN_BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Bucket {
    Metadata,
    DeltaCursor,
    Uploads,
    Downloads,
    OfflineChanges,
    Version,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Metadata,
        Bucket::DeltaCursor,
        Bucket::Uploads,
        Bucket::Downloads,
        Bucket::OfflineChanges,
        Bucket::Version,
    ];

    fn name(self) -> &'static str {
        match self {
            Bucket::Metadata => "metadata",
            Bucket::DeltaCursor => "delta_cursor",
            Bucket::Uploads => "uploads",
            Bucket::Downloads => "downloads",
            Bucket::OfflineChanges => "offline_changes",
            Bucket::Version => "version",
        }
    }
}

/// Accumulates writes for a serialized, flushed application.
#[derive(Default)]
pub struct Batch {
    ops: Vec<(Bucket, Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch {
    pub fn put<T: Serialize>(&mut self, bucket: Bucket, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
        self.ops
            .push((bucket, key.as_ref().to_vec(), Some(serialize_to_vec(value)?)));
        Ok(())
    }

    pub fn delete(&mut self, bucket: Bucket, key: impl AsRef<[u8]>) {
        self.ops.push((bucket, key.as_ref().to_vec(), None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct Store {
    db: sled::Db,
    lock_path: PathBuf,
    // batches are serialized; concurrent callers queue here
    batch_lock: Mutex<()>,
}

impl Store {
    /// Open the store under `dir`, taking the exclusive `db.lock`
    /// marker. A stale lock older than five minutes is removed; a
    /// fresh one makes the open retry with exponential back-off.
    pub fn open(dir: impl AsRef<Path>) -> Result<Store> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let lock_path = dir.join("db.lock");
        Self::acquire_lock(&lock_path)?;

        let db = match sled::Config::new().path(dir.join("db")).open() {
            Ok(db) => db,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };

        let store = Store {
            db,
            lock_path,
            batch_lock: Mutex::new(()),
        };
        store.migrate()?;
        Ok(store)
    }

    fn acquire_lock(lock_path: &Path) -> Result<()> {
        for attempt in 0..OPEN_RETRIES {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = fs::metadata(lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok());
                    if age.map(|a| a > STALE_LOCK_AGE).unwrap_or(true) {
                        warn!(lock = %lock_path.display(), "removing stale db lock");
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                    thread::sleep(crate::task::backoff(
                        attempt,
                        OPEN_BACKOFF_BASE,
                        OPEN_BACKOFF_CAP,
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::invalid(format!(
            "database is locked by another process: {}",
            lock_path.display()
        )))
    }

    fn migrate(&self) -> Result<()> {
        let version: Option<u32> = self.get(Bucket::Version, SCHEMA_KEY)?;
        match version {
            None => self.put(Bucket::Version, SCHEMA_KEY, &SCHEMA_VERSION),
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) if v < SCHEMA_VERSION => {
                // per-version migration steps slot in here as the
                // schema evolves; v1 is the first released layout
                debug!(from = v, to = SCHEMA_VERSION, "migrating store schema");
                self.put(Bucket::Version, SCHEMA_KEY, &SCHEMA_VERSION)
            }
            Some(v) => Err(Error::corruption(format!(
                "store schema {} is newer than supported {}",
                v, SCHEMA_VERSION
            ))),
        }
    }

    fn tree(&self, bucket: Bucket) -> Result<sled::Tree> {
        Ok(self.db.open_tree(bucket.name())?)
    }

    pub fn get<T: DeserializeOwned>(&self, bucket: Bucket, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.tree(bucket)?.get(key.as_ref())? {
            Some(raw) => Ok(Some(deserialize_from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, bucket: Bucket, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
        self.tree(bucket)?
            .insert(key.as_ref(), serialize_to_vec(value)?)?;
        Ok(())
    }

    pub fn delete(&self, bucket: Bucket, key: impl AsRef<[u8]>) -> Result<()> {
        self.tree(bucket)?.remove(key.as_ref())?;
        Ok(())
    }

    /// Visit every record in a bucket in key order. Records that fail
    /// to decode are logged and skipped; the system continues.
    pub fn for_each<T, F>(&self, bucket: Bucket, mut f: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(&[u8], T),
    {
        for pair in self.tree(bucket)?.iter() {
            let (key, raw) = pair?;
            match deserialize_from_slice(&raw) {
                Ok(value) => f(&key, value),
                Err(e) => warn!(
                    bucket = bucket.name(),
                    key = %String::from_utf8_lossy(&key),
                    err = %e,
                    "skipping corrupt record"
                ),
            }
        }
        Ok(())
    }

    /// Apply a batch of writes, serialized against other batches, and
    /// flush before returning.
    pub fn batch(&self, f: impl FnOnce(&mut Batch) -> Result<()>) -> Result<()> {
        let mut batch = Batch::default();
        f(&mut batch)?;
        if batch.is_empty() {
            return Ok(());
        }

        let _serial = self.batch_lock.lock();
        for bucket in Bucket::ALL {
            let mut tree_batch = sled::Batch::default();
            let mut touched = false;
            for (b, key, value) in &batch.ops {
                if *b != bucket {
                    continue;
                }
                touched = true;
                match value {
                    Some(v) => tree_batch.insert(key.as_slice(), v.as_slice()),
                    None => tree_batch.remove(key.as_slice()),
                }
            }
            if touched {
                self.tree(bucket)?.apply_batch(tree_batch)?;
            }
        }
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Flush and release the exclusive lock marker.
    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        let _ = fs::remove_file(&self.lock_path);
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.db.flush();
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_and_for_each() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store.put(Bucket::Metadata, "a", &"alpha".to_owned()).unwrap();
        store.put(Bucket::Metadata, "b", &"beta".to_owned()).unwrap();

        let got: Option<String> = store.get(Bucket::Metadata, "a").unwrap();
        assert_eq!(got.as_deref(), Some("alpha"));

        let mut seen = vec![];
        store
            .for_each(Bucket::Metadata, |_k, v: String| seen.push(v))
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["alpha".to_owned(), "beta".to_owned()]);
    }

    #[test]
    fn batch_applies_atomically_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .batch(|b| {
                b.put(Bucket::Metadata, "x", &1u32)?;
                b.put(Bucket::Uploads, "y", &2u32)?;
                b.delete(Bucket::Metadata, "missing");
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get::<u32>(Bucket::Metadata, "x").unwrap(), Some(1));
        assert_eq!(store.get::<u32>(Bucket::Uploads, "y").unwrap(), Some(2));
    }

    #[test]
    fn reopen_after_close_succeeds_without_remediation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.put(Bucket::Metadata, "k", &42u64).unwrap();
            store.close().unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get::<u64>(Bucket::Metadata, "k").unwrap(), Some(42));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("db.lock");
        fs::write(&lock, b"").unwrap();
        // backdate the marker beyond the stale threshold
        let old = filetime_set(&lock);
        assert!(old.is_ok());

        let store = Store::open(dir.path()).unwrap();
        store.put(Bucket::Metadata, "k", &1u8).unwrap();
    }

    fn filetime_set(path: &Path) -> std::io::Result<()> {
        // utime via libc keeps the dev-dependency surface small
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        let times = libc::utimbuf {
            actime: 0,
            modtime: 0,
        };
        let rc = unsafe { libc::utime(c_path.as_ptr(), &times) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}
