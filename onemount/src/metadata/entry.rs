use crate::{remote::DriveItem, task::unix_secs, ItemId};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Directory,
}

/// Content lifecycle of a file.
///
/// Directories occupy `Hydrated` only; their state tracks children
/// list freshness instead.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ItemState {
    /// Known item whose content is not in the local cache.
    Ghost,
    /// A download is materializing the content.
    Hydrating,
    /// Content present and in sync with the last observed remote etag.
    Hydrated,
    /// Local writes not yet pushed to the remote.
    DirtyLocal,
    /// Local and remote diverged; waiting on user resolution.
    Conflict,
}

impl ItemState {
    /// Edge validation for
    /// [`MetadataStore::transition_state`](crate::metadata::MetadataStore::transition_state).
    pub fn can_transition(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Ghost, Hydrating)
                | (Ghost, DirtyLocal)      // truncating write without hydration
                | (Hydrating, Hydrated)
                | (Hydrating, Ghost)       // failed download
                | (Hydrated, Ghost)        // evict / remote content change
                | (Hydrated, DirtyLocal)
                | (DirtyLocal, Hydrated)   // upload success
                | (DirtyLocal, Conflict)   // remote change while dirty
                | (Conflict, Hydrated)     // user resolution
                | (Conflict, DirtyLocal)
                | (Conflict, Ghost)
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Pin {
    Unset,
    /// Re-hydrate immediately whenever the content is invalidated.
    Always,
}

/// Rule choosing whose fields win when local and remote metadata
/// disagree mid-reconciliation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum OverlayPolicy {
    RemoteWins,
    LocalWins,
}

/// The item was just created locally and is expected to appear in a
/// future delta; the flag is cleared on first delta observation or
/// when the TTL lapses.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PendingRemote {
    pub expires: u64,
}

impl PendingRemote {
    pub const TTL_SECS: u64 = 300;

    pub fn new() -> Self {
        PendingRemote {
            expires: unix_secs() + Self::TTL_SECS,
        }
    }

    pub fn expired(&self) -> bool {
        unix_secs() > self.expires
    }
}

impl Default for PendingRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// One persisted record per known item, mirrored into the inode graph
/// as needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: u64,
    pub etag: Option<String>,
    /// Quick non-cryptographic digest for delta equality decisions.
    pub content_hash: Option<String>,
    pub state: ItemState,
    pub pin: Pin,
    pub overlay: OverlayPolicy,
    pub pending_remote: Option<PendingRemote>,
    /// Directory only.
    pub children: Vec<ItemId>,
    pub last_hydrated: Option<u64>,
}

impl Entry {
    pub fn new_file(id: ItemId, parent: ItemId, name: impl Into<String>) -> Self {
        Entry {
            id,
            parent_id: Some(parent),
            name: name.into(),
            kind: ItemKind::File,
            size: 0,
            mtime: unix_secs(),
            etag: None,
            content_hash: None,
            state: ItemState::Ghost,
            pin: Pin::Unset,
            overlay: OverlayPolicy::RemoteWins,
            pending_remote: None,
            children: Vec::new(),
            last_hydrated: None,
        }
    }

    pub fn new_directory(id: ItemId, parent: Option<ItemId>, name: impl Into<String>) -> Self {
        Entry {
            id,
            parent_id: parent,
            name: name.into(),
            kind: ItemKind::Directory,
            size: 0,
            mtime: unix_secs(),
            etag: None,
            content_hash: None,
            state: ItemState::Hydrated,
            pin: Pin::Unset,
            overlay: OverlayPolicy::RemoteWins,
            pending_remote: None,
            children: Vec::new(),
            last_hydrated: None,
        }
    }

    pub fn from_remote(item: &DriveItem) -> Self {
        Entry {
            id: item.id.clone(),
            parent_id: item.parent_id.clone(),
            name: item.name.clone(),
            kind: item.kind,
            size: item.size,
            mtime: item.mtime,
            etag: Some(item.etag.clone()),
            content_hash: item.content_hash.clone(),
            state: match item.kind {
                ItemKind::Directory => ItemState::Hydrated,
                ItemKind::File => ItemState::Ghost,
            },
            pin: Pin::Unset,
            overlay: OverlayPolicy::RemoteWins,
            pending_remote: None,
            children: Vec::new(),
            last_hydrated: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    /// States in which a content blob may legitimately exist.
    pub fn may_have_content(&self) -> bool {
        matches!(
            self.state,
            ItemState::Hydrating | ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Conflict
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_state_edges() {
        use ItemState::*;
        assert!(Ghost.can_transition(Hydrating));
        assert!(Hydrating.can_transition(Hydrated));
        assert!(Hydrated.can_transition(Ghost));
        assert!(Hydrated.can_transition(DirtyLocal));
        assert!(DirtyLocal.can_transition(Hydrated));
        assert!(DirtyLocal.can_transition(Conflict));

        assert!(!Ghost.can_transition(Hydrated));
        assert!(!Hydrated.can_transition(Conflict));
        assert!(!Conflict.can_transition(Hydrating));
        assert!(!Ghost.can_transition(Conflict));
    }

    #[test]
    fn pending_remote_window() {
        let fresh = PendingRemote::new();
        assert!(!fresh.expired());
        let stale = PendingRemote { expires: 1 };
        assert!(stale.expired());
    }
}
