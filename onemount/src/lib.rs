#![deny(clippy::all)]
#![allow(clippy::ptr_arg)]

#[macro_use]
extern crate serde_derive;

pub mod cache;
pub mod config;
pub mod conflict;
pub mod delta;
mod error;
pub mod fs;
mod id;
pub mod inode;
pub mod metadata;
pub mod offline;
pub mod realtime;
pub mod remote;
pub mod sched;
pub mod status;
pub mod store;
pub mod task;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};
pub use fs::Filesystem;
pub use id::{ItemId, NodeId, LOCAL_ID_PREFIX};
pub use remote::Remote;
pub use status::FileStatus;

pub use anyhow;

pub(crate) use rmp_serde::from_slice as deserialize_from_slice;
pub(crate) use rmp_serde::to_vec as serialize_to_vec;

use xxhash_rust::xxh3::Xxh3;

/// Transfer chunk size for both directions.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Items at most this large are uploaded with a single PUT instead of
/// a chunked session.
pub const SMALL_UPLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Quick non-cryptographic digest used for content equality decisions
/// during reconciliation.
pub fn quick_hash(data: &[u8]) -> String {
    hex::encode(xxhash_rust::xxh3::xxh3_128(data).to_be_bytes())
}

/// Streaming variant of [`quick_hash`] for chunked downloads.
#[derive(Default)]
pub struct QuickHasher(Xxh3);

impl QuickHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(&self) -> String {
        hex::encode(self.0.digest128().to_be_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn streaming_hash_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = QuickHasher::new();
        hasher.update(&data[..10]);
        hasher.update(&data[10..]);
        assert_eq!(hasher.finish(), quick_hash(data));
    }
}
