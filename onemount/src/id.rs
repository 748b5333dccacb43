use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Prefix marking ids assigned locally before the remote has issued one.
pub const LOCAL_ID_PREFIX: &str = "local-";

static LOCAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier for a remote object.
///
/// Two flavors exist: ids issued by the server, and `local-` prefixed
/// ids assigned for objects created while disconnected. A local id is
/// rewritten to the server-issued one once the creation upload
/// succeeds; see [`InodeGraph::move_id`](crate::inode::InodeGraph::move_id).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    /// Mint a fresh local id for an item created before the server
    /// knows about it. Ids are unique within and across processes on
    /// the same host clock.
    pub fn fresh_local() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seq = LOCAL_SEQ.fetch_add(1, Ordering::Relaxed);
        ItemId(format!("{}{:x}-{:x}", LOCAL_ID_PREFIX, nanos, seq))
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId(s.to_owned())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId(s)
    }
}

impl AsRef<str> for ItemId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dense integer handle the kernel boundary works with.
///
/// A node id never changes for the lifetime of an item, even when its
/// item id is rewritten, and a vacated slot is never reissued.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The filesystem root. Matches the conventional root inode
    /// number at the kernel boundary.
    pub const ROOT: NodeId = NodeId(1);

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_ids_are_unique_and_flagged() {
        let a = ItemId::fresh_local();
        let b = ItemId::fresh_local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!ItemId::from("8A9F00!12").is_local());
    }
}
