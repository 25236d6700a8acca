// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Shared, demand-paged node cache fronting every paged B-tree.
//!
//! Generalizes the blob cache's `quick_cache`-backed pattern from caching
//! variable-sized value blobs to caching fixed-size 32 KiB tree nodes: since
//! every node has the same weight, the cache degenerates to a pure
//! LRU-by-count instead of a byte-budgeted cache.

use crate::btree::node::{DiskBlock, FixedWidth, Node, TREE_BLOCK_SIZE};
use crate::{Error, Result};
use quick_cache::{sync::Cache, Weighter};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Identifies a single tree among the many sharing this process's node cache.
pub type TreeId = u32;

#[derive(Eq, std::hash::Hash, PartialEq, Clone, Copy)]
struct CacheKey(TreeId, DiskBlock);

#[derive(Clone)]
struct NodeWeighter;

impl<K: FixedWidth, V: FixedWidth> Weighter<CacheKey, Arc<NodeInfo<K, V>>> for NodeWeighter {
    fn weight(&self, _: &CacheKey, _: &Arc<NodeInfo<K, V>>) -> u64 {
        TREE_BLOCK_SIZE as u64
    }
}

/// A cache slot for a single node: either resolved, or a placeholder that
/// concurrent lookups wait on while the real read completes.
pub struct NodeInfo<K: FixedWidth, V: FixedWidth> {
    node: Mutex<Option<Arc<Node<K, V>>>>,
    ready: Condvar,
    /// Set once a load has failed, so waiters don't wait forever on a read
    /// that is never going to complete.
    failed: OnceLock<()>,
    /// Whether this node has been linked onto its owning tree's dirty list
    /// by `edit_node`.
    dirty: std::sync::atomic::AtomicBool,
}

impl<K: FixedWidth, V: FixedWidth> NodeInfo<K, V> {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            node: Mutex::new(None),
            ready: Condvar::new(),
            failed: OnceLock::new(),
            dirty: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn resolve(&self, node: Arc<Node<K, V>>) {
        *self.node.lock().expect("lock is poisoned") = Some(node);
        self.ready.notify_all();
    }

    fn fail(&self) {
        let _ = self.failed.set(());
        self.ready.notify_all();
    }

    /// Blocks the calling thread until the node is resolved or the load
    /// failed, returning the resolved node.
    fn wait(&self) -> Result<Arc<Node<K, V>>> {
        let mut guard = self.node.lock().expect("lock is poisoned");
        loop {
            if let Some(node) = guard.as_ref() {
                return Ok(Arc::clone(node));
            }
            if self.failed.get().is_some() {
                return Err(Error::Validation("paged tree node load failed"));
            }
            guard = self.ready.wait(guard).expect("lock is poisoned");
        }
    }

    /// Non-blocking variant of [`wait`](Self::wait): returns `Ok(None)`
    /// rather than blocking when the node is not yet resolved, for callers
    /// in a non-blocking context (see [`crate::Error::WouldBlock`]).
    fn try_get(&self) -> Option<Arc<Node<K, V>>> {
        self.node.lock().expect("lock is poisoned").clone()
    }

    /// Returns the resolved node.
    ///
    /// # Panics
    ///
    /// Panics if the node has not been resolved yet; only safe to call on a
    /// [`NodeInfo`] installed via [`NodeCache::install`], which always
    /// resolves synchronously.
    pub fn get_resolved(&self) -> Arc<Node<K, V>> {
        self.try_get().expect("install() always resolves synchronously")
    }

    /// Marks this node dirty, linking it onto the owning tree's dirty list
    /// conceptually (the list itself lives in [`crate::btree::store`]).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, std::sync::atomic::Ordering::Release);
    }

    /// `true` if this node has unpersisted edits.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Shared pseudo-LRU cache of paged tree nodes, keyed by `(tree, disk block)`.
pub struct NodeCache<K: FixedWidth, V: FixedWidth> {
    inner: Cache<CacheKey, Arc<NodeInfo<K, V>>, NodeWeighter, ahash::RandomState>,
}

impl<K: FixedWidth, V: FixedWidth> NodeCache<K, V> {
    /// Creates a cache holding up to `capacity` nodes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        let estimated_items = capacity.max(1);
        let weight_capacity = capacity * TREE_BLOCK_SIZE as u64;

        Self {
            inner: Cache::with(
                estimated_items as usize,
                weight_capacity,
                NodeWeighter,
                ahash::RandomState::default(),
                DefaultLifecycle::default(),
            ),
        }
    }

    /// Looks up a node, blocking on a concurrent in-flight load if one
    /// exists, or issuing `load` to fetch it from disk on a miss.
    pub fn get_or_load(
        &self,
        tree: TreeId,
        block: DiskBlock,
        load: impl FnOnce() -> Result<Node<K, V>>,
    ) -> Result<Arc<Node<K, V>>> {
        let key = CacheKey(tree, block);

        if let Some(info) = self.inner.get(&key) {
            return info.wait();
        }

        let info = NodeInfo::pending();
        self.inner.insert(key, Arc::clone(&info));

        match load() {
            Ok(node) => {
                let node = Arc::new(node);
                info.resolve(Arc::clone(&node));
                Ok(node)
            }
            Err(e) => {
                info.fail();
                Err(e)
            }
        }
    }

    /// Non-blocking lookup for the delayed-lookup worker's fast path; `None`
    /// if the node is not resident or is still being loaded by someone else.
    #[must_use]
    pub fn try_get(&self, tree: TreeId, block: DiskBlock) -> Option<Arc<Node<K, V>>> {
        self.inner.get(&CacheKey(tree, block))?.try_get()
    }

    /// Installs a freshly-allocated or copy-on-write node directly, as
    /// `edit_node` does after allocating a fresh block.
    pub fn install(&self, tree: TreeId, block: DiskBlock, node: Node<K, V>) -> Arc<NodeInfo<K, V>> {
        let info = NodeInfo::pending();
        info.resolve(Arc::new(node));
        info.mark_dirty();
        self.inner.insert(CacheKey(tree, block), Arc::clone(&info));
        info
    }

    /// Evicts a node, e.g. once its disk block has been freed after a
    /// checkpoint commits.
    pub fn evict(&self, tree: TreeId, block: DiskBlock) {
        self.inner.remove(&CacheKey(tree, block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn miss_then_hit() -> Result<()> {
        let cache: NodeCache<u64, u64> = NodeCache::with_capacity(16);
        let mut loads = 0;

        for _ in 0..3 {
            let node = cache.get_or_load(0, 5, || {
                loads += 1;
                Ok(Node::empty_leaf(1))
            })?;
            assert_eq!(node.generation, 1);
        }

        assert_eq!(loads, 1, "second and third lookups should hit the cache");
        Ok(())
    }

    #[test]
    fn failed_load_is_not_cached_as_success() {
        let cache: NodeCache<u64, u64> = NodeCache::with_capacity(16);
        let result = cache.get_or_load(0, 1, || Err(Error::Validation("disk error")));
        assert!(result.is_err());
    }

    #[test]
    fn install_marks_dirty() {
        let cache: NodeCache<u64, u64> = NodeCache::with_capacity(16);
        let info = cache.install(0, 9, Node::empty_leaf(4));
        assert!(info.is_dirty());
    }
}
