//! Per-item sync status surfaced to external subscribers.
//!
//! The publisher keeps a short-TTL cache of derived statuses so xattr
//! storms from file managers don't recompute state, and fans out
//! change events to any number of subscriber channels. The metadata
//! store republishes through [`StatusPublisher::publish`] on every
//! state transition.

use crate::{
    metadata::{Entry, ItemState},
    ItemId,
};
use parking_lot::RwLock;
use std::{
    fmt,
    time::{Duration, Instant},
};

#[cfg(feature = "dbus")]
pub mod dbus;

/// Extended-attribute name carrying the per-file status.
pub const STATUS_XATTR: &str = "user.onemount.status";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FileStatus {
    Local,
    Syncing,
    OutOfSync,
    Downloading,
    Error,
    Conflict,
}

impl FileStatus {
    /// Status implied by an entry's lifecycle state alone.
    pub fn from_state(state: ItemState) -> FileStatus {
        match state {
            ItemState::Hydrated => FileStatus::Local,
            ItemState::Hydrating => FileStatus::Downloading,
            ItemState::Ghost => FileStatus::OutOfSync,
            ItemState::DirtyLocal => FileStatus::OutOfSync,
            ItemState::Conflict => FileStatus::Conflict,
        }
    }

    pub fn from_entry(entry: &Entry) -> FileStatus {
        if entry.is_directory() {
            FileStatus::Local
        } else {
            Self::from_state(entry.state)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Local => "Local",
            FileStatus::Syncing => "Syncing",
            FileStatus::OutOfSync => "OutOfSync",
            FileStatus::Downloading => "Downloading",
            FileStatus::Error => "Error",
            FileStatus::Conflict => "Conflict",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct StatusEvent {
    pub id: ItemId,
    pub status: FileStatus,
}

pub struct StatusPublisher {
    cache: scc::HashMap<ItemId, (FileStatus, Instant)>,
    subscribers: RwLock<Vec<flume::Sender<StatusEvent>>>,
    ttl: Duration,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl StatusPublisher {
    pub fn new(ttl: Duration) -> Self {
        StatusPublisher {
            cache: scc::HashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            ttl,
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<StatusEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    /// Record and broadcast a status. No-op when the fresh cached
    /// value is identical, which debounces republish storms.
    pub fn publish(&self, id: &ItemId, status: FileStatus) {
        let now = Instant::now();
        let mut changed = true;
        self.cache
            .entry(id.clone())
            .and_modify(|(old, at)| {
                changed = *old != status || at.elapsed() > self.ttl;
                *old = status;
                *at = now;
            })
            .or_insert((status, now));

        if !changed {
            return;
        }
        let event = StatusEvent {
            id: id.clone(),
            status,
        };
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Current status if the cached value is still inside the TTL.
    pub fn get(&self, id: &ItemId) -> Option<FileStatus> {
        self.cache.read(id, |_, (status, at)| {
            if at.elapsed() <= self.ttl {
                Some(*status)
            } else {
                None
            }
        })?
    }

    /// Cached status, or derive-and-publish when stale.
    pub fn get_or_derive(&self, id: &ItemId, derive: impl FnOnce() -> FileStatus) -> FileStatus {
        if let Some(status) = self.get(id) {
            return status;
        }
        let status = derive();
        self.publish(id, status);
        status
    }

    pub fn forget(&self, id: &ItemId) {
        self.cache.remove(id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_reaches_subscribers() {
        let publisher = StatusPublisher::default();
        let rx = publisher.subscribe();
        publisher.publish(&"f1".into(), FileStatus::Syncing);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, ItemId::from("f1"));
        assert_eq!(event.status, FileStatus::Syncing);
    }

    #[test]
    fn identical_fresh_status_is_debounced() {
        let publisher = StatusPublisher::default();
        let rx = publisher.subscribe();
        publisher.publish(&"f1".into(), FileStatus::Local);
        publisher.publish(&"f1".into(), FileStatus::Local);
        assert_eq!(rx.drain().count(), 1);
    }

    #[test]
    fn ttl_expiry_rederives() {
        let publisher = StatusPublisher::new(Duration::from_millis(0));
        publisher.publish(&"f1".into(), FileStatus::Local);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(publisher.get(&"f1".into()), None);
        let status = publisher.get_or_derive(&"f1".into(), || FileStatus::OutOfSync);
        assert_eq!(status, FileStatus::OutOfSync);
    }

    #[test]
    fn status_from_state() {
        assert_eq!(FileStatus::from_state(ItemState::Ghost), FileStatus::OutOfSync);
        assert_eq!(FileStatus::from_state(ItemState::Hydrating), FileStatus::Downloading);
        assert_eq!(FileStatus::from_state(ItemState::Hydrated), FileStatus::Local);
        assert_eq!(FileStatus::from_state(ItemState::Conflict), FileStatus::Conflict);
    }
}
