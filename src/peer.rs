// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The peer/view directory collaborator (§6A): resolves a host id to a
//! network address for the quorum client, the streamer, and `GET /peers`
//! gossip. Per §1 this is an external SQLite-backed service in the original
//! system; this crate only depends on it through a trait, exactly the way
//! the segment engine's core never touches an index implementation directly
//! but only through its `IndexReader`/`IndexWriter` traits.

use crate::id::DiskId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Resolves host ids to addresses and records newly-discovered peers.
pub trait PeerDirectory: Send + Sync {
    /// Looks up the address currently on file for `host_id`.
    fn resolve(&self, host_id: DiskId) -> Option<SocketAddr>;

    /// Records (or updates) a peer's address, e.g. after a `GET /peers`
    /// discovery round or a gossiped replica-set change.
    fn record_peer(&self, host_id: DiskId, addr: SocketAddr);

    /// Every known `(host_id, addr)` pair, for serving `GET /peers`.
    fn all(&self) -> Vec<(DiskId, SocketAddr)>;
}

type Directory = RwLock<HashMap<DiskId, SocketAddr>>;

/// An in-memory peer directory, for tests and the demo CLI. Grounded on the
/// segment engine test harness's `MockIndex`: an `Arc<RwLock<_>>` newtype
/// with a `Deref` to the inner map, rather than a bespoke guard type.
#[derive(Clone, Default)]
pub struct InMemoryPeerDirectory(Arc<Directory>);

impl std::ops::Deref for InMemoryPeerDirectory {
    type Target = Directory;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl InMemoryPeerDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerDirectory for InMemoryPeerDirectory {
    fn resolve(&self, host_id: DiskId) -> Option<SocketAddr> {
        self.read().expect("lock is poisoned").get(&host_id).copied()
    }

    fn record_peer(&self, host_id: DiskId, addr: SocketAddr) {
        self.write().expect("lock is poisoned").insert(host_id, addr);
    }

    fn all(&self) -> Vec<(DiskId, SocketAddr)> {
        self.read().expect("lock is poisoned").iter().map(|(&k, &v)| (k, v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn records_and_resolves() {
        let dir = InMemoryPeerDirectory::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        dir.record_peer(7, addr);
        assert_eq!(dir.resolve(7), Some(addr));
        assert_eq!(dir.resolve(8), None);
    }
}
