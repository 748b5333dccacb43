//! Conflict detection and naming.
//!
//! A conflict exists when a dirty local file meets a remote change it
//! cannot fast-forward over: either the upload was rejected with a
//! precondition failure, or a delta reported a different etag with a
//! diverging content hash. The local bytes stay under the original
//! name; the remote version is materialized as a sibling conflict
//! copy. Copy materialization lives in [`fs`](crate::fs), which owns
//! the graph and cache handles; this module holds the pure rules.

use crate::{
    metadata::{Entry, ItemState},
    remote::DriveItem,
};

/// Delta-side divergence predicate. The upload-side 412 path reaches
/// [`ItemState::Conflict`] directly through the upload manager.
pub fn is_conflicting(local: &Entry, remote: &DriveItem) -> bool {
    if local.state != ItemState::DirtyLocal {
        return false;
    }
    let etag_differs = local.etag.as_deref() != Some(remote.etag.as_str());
    let hashes_differ = match (&local.content_hash, &remote.content_hash) {
        (Some(a), Some(b)) => a != b,
        // an unknown hash cannot prove equality
        _ => true,
    };
    etag_differs && hashes_differ
}

/// `<name>-conflict-<unix_seconds>`, with a monotonic numeric suffix
/// when the same second already produced a copy.
pub fn conflict_name(name: &str, unix_seconds: u64, taken: impl Fn(&str) -> bool) -> String {
    let base = format!("{}-conflict-{}", name, unix_seconds);
    if !taken(&base) {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::Entry;

    fn remote_item(etag: &str, hash: Option<&str>) -> DriveItem {
        DriveItem {
            id: "f1".into(),
            parent_id: Some("root".into()),
            name: "f.txt".to_owned(),
            kind: crate::metadata::ItemKind::File,
            size: 10,
            mtime: 0,
            etag: etag.to_owned(),
            content_hash: hash.map(str::to_owned),
            deleted: false,
        }
    }

    fn dirty_entry(etag: &str, hash: Option<&str>) -> Entry {
        let mut entry = Entry::new_file("f1".into(), "root".into(), "f.txt");
        entry.state = ItemState::DirtyLocal;
        entry.etag = Some(etag.to_owned());
        entry.content_hash = hash.map(str::to_owned);
        entry
    }

    #[test]
    fn divergence_requires_dirty_state() {
        let mut entry = dirty_entry("e1", Some("h1"));
        let remote = remote_item("e2", Some("h2"));
        assert!(is_conflicting(&entry, &remote));

        entry.state = ItemState::Hydrated;
        assert!(!is_conflicting(&entry, &remote));
    }

    #[test]
    fn matching_hashes_are_not_a_conflict() {
        let entry = dirty_entry("e1", Some("h1"));
        let remote = remote_item("e2", Some("h1"));
        assert!(!is_conflicting(&entry, &remote));
    }

    #[test]
    fn same_etag_is_not_a_conflict() {
        let entry = dirty_entry("e1", Some("h1"));
        let remote = remote_item("e1", Some("h2"));
        assert!(!is_conflicting(&entry, &remote));
    }

    #[test]
    fn conflict_names_disambiguate_same_second() {
        let existing = vec!["f.txt-conflict-100".to_owned()];
        let name = conflict_name("f.txt", 100, |candidate| {
            existing.iter().any(|n| n == candidate)
        });
        assert_eq!(name, "f.txt-conflict-100-1");

        let name = conflict_name("f.txt", 101, |_| false);
        assert_eq!(name, "f.txt-conflict-101");
    }
}
