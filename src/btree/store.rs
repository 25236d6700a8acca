// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A single paged, copy-on-write B-tree over the shared [`NodeCache`].

use crate::alloc::BitmapAllocator;
use crate::btree::cache::{NodeCache, NodeInfo, TreeId};
use crate::btree::node::{DiskBlock, FixedWidth, Node, TREE_BLOCK_SIZE};
use crate::device::BlockDevice;
use crate::section::{Section, SectionTable};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn next_tree_id() -> TreeId {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A single paged copy-on-write B-tree instance sharing the process-wide
/// [`NodeCache`] and node-slot bitmap.
pub struct Tree<K: FixedWidth, V: FixedWidth> {
    id: TreeId,
    device: Arc<dyn BlockDevice>,
    table: SectionTable,
    cache: Arc<NodeCache<K, V>>,
    node_bitmap: Arc<BitmapAllocator>,
    root: Mutex<DiskBlock>,
    generation: AtomicU32,

    /// Nodes edited since the last checkpoint commit, awaiting copy-on-write
    /// sync.
    dirty: Mutex<HashMap<DiskBlock, Arc<NodeInfo<K, V>>>>,
}

impl<K: FixedWidth, V: FixedWidth> Tree<K, V> {
    /// Opens a tree rooted at `root`, or creates a fresh empty one if `root`
    /// is [`crate::id::LogId::invalid`]'s paged-tree analogue, block `u64::MAX`.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        table: SectionTable,
        cache: Arc<NodeCache<K, V>>,
        node_bitmap: Arc<BitmapAllocator>,
        root: DiskBlock,
    ) -> Result<Self> {
        let tree = Self {
            id: next_tree_id(),
            device,
            table,
            cache,
            node_bitmap,
            root: Mutex::new(root),
            generation: AtomicU32::new(0),
            dirty: Mutex::new(HashMap::new()),
        };

        if root == DiskBlock::MAX {
            let fresh_root = tree.alloc_node()?;
            tree.cache.install(tree.id, fresh_root, Node::empty_leaf(0));
            *tree.root.lock().expect("lock is poisoned") = fresh_root;
        }

        Ok(tree)
    }

    /// The tree's current root block.
    #[must_use]
    pub fn root(&self) -> DiskBlock {
        *self.root.lock().expect("lock is poisoned")
    }

    fn alloc_node(&self) -> Result<DiskBlock> {
        self.node_bitmap
            .alloc()
            .map(|slot| slot as DiskBlock)
            .map_err(|_| Error::Validation("node-slot bitmap exhausted"))
    }

    fn block_offset(block: DiskBlock) -> u64 {
        block * TREE_BLOCK_SIZE as u64
    }

    /// Reads a node from the cache, faulting it in from disk on a miss and
    /// verifying its embedded checksum.
    pub fn get_node(&self, block: DiskBlock) -> Result<Arc<Node<K, V>>> {
        self.cache.get_or_load(self.id, block, || {
            let mut buf = vec![0u8; TREE_BLOCK_SIZE];
            crate::device::read_section(
                self.device.as_ref(),
                &self.table,
                Section::BTree,
                Self::block_offset(block),
                &mut buf,
            )?;
            let mut cursor = std::io::Cursor::new(buf);
            Ok(Node::decode_from(&mut cursor)?)
        })
    }

    /// Non-blocking node read; returns `Err(WouldBlock)` instead of
    /// suspending when the node is not already resident, per §5's
    /// node-fault policy for non-blocking callers.
    pub fn get_node_nonblocking(&self, block: DiskBlock) -> Result<Arc<Node<K, V>>> {
        self.cache
            .try_get(self.id, block)
            .ok_or(Error::WouldBlock)
    }

    /// Returns a mutable copy of a node for editing, linking it onto the
    /// dirty list so the next checkpoint's copy-on-write sync will persist
    /// it under a fresh block.
    pub fn edit_node(&self, block: DiskBlock) -> Result<Node<K, V>> {
        let node = self.get_node(block)?;
        let info = self.cache.install(self.id, block, (*node).clone());
        info.mark_dirty();
        self.dirty.lock().expect("lock is poisoned").insert(block, info);
        Ok((*node).clone())
    }

    /// Writes back an edited node under its existing block (used for nodes
    /// already moved by a prior sync in the same generation).
    pub fn put_node(&self, block: DiskBlock, node: Node<K, V>) {
        let info = self.cache.install(self.id, block, node);
        self.dirty.lock().expect("lock is poisoned").insert(block, info);
    }

    /// Copy-on-write sync, invoked by the checkpointer: atomically steals the
    /// dirty list, allocates a fresh block for each dirty node (the old block
    /// stays referenced by the last checkpoint until it commits), remaps
    /// child pointers via the `old -> new` map, recomputes the checksum,
    /// writes the node out, then remaps the tree's root.
    ///
    /// Returns the `old -> new` block remap so the checkpointer can defer
    /// freeing the old blocks until the *next* checkpoint commits.
    pub fn sync(&self) -> Result<HashMap<DiskBlock, DiskBlock>> {
        let dirty = std::mem::take(&mut *self.dirty.lock().expect("lock is poisoned"));
        if dirty.is_empty() {
            return Ok(HashMap::new());
        }

        let mut remap = HashMap::new();
        for &old_block in dirty.keys() {
            remap.insert(old_block, self.alloc_node()?);
        }

        let generation = u64::from(self.generation.fetch_add(1, Ordering::AcqRel)) + 1;

        for (old_block, info) in &dirty {
            let new_block = remap[old_block];
            let mut node = (*info.get_resolved()).clone();
            node.generation = generation;

            if !node.is_leaf() {
                for child in &mut node.children {
                    if let Some(&remapped) = remap.get(child) {
                        *child = remapped;
                    }
                }
            }

            let bytes = node.encode_into_vec()?;
            crate::device::write_section(
                self.device.as_ref(),
                &self.table,
                Section::BTree,
                Self::block_offset(new_block),
                &bytes,
            )?;

            self.cache.install(self.id, new_block, node);
            self.cache.evict(self.id, *old_block);
        }

        let mut root = self.root.lock().expect("lock is poisoned");
        if let Some(&new_root) = remap.get(&root) {
            *root = new_root;
        }

        Ok(remap)
    }

    /// Point lookup: descends from the root comparing against routing keys.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        let mut block = self.root();
        loop {
            let node = self.get_node(block)?;
            match node.keys.binary_search(key) {
                Ok(i) if node.is_leaf() => return Ok(Some(node.values[i].clone())),
                Ok(i) => block = node.children[i + 1],
                Err(i) if node.is_leaf() => return Ok(None),
                Err(i) => block = node.children[i],
            }
        }
    }

    /// Returns every `(key, value)` pair in the root leaf, in ascending key
    /// order. Like [`insert_in_root_leaf`](Self::insert_in_root_leaf), this
    /// only supports the single-leaf-root case.
    pub fn all_entries(&self) -> Result<Vec<(K, V)>> {
        let node = self.get_node(self.root())?;
        assert!(node.is_leaf(), "all_entries called on an internal root");
        Ok(node.keys.iter().cloned().zip(node.values.iter().cloned()).collect())
    }

    /// Returns every `(key, value)` pair with `key >= from`, in ascending
    /// key order.
    pub fn scan_from(&self, from: &K) -> Result<Vec<(K, V)>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|(k, _)| k >= from)
            .collect())
    }

    /// Removes a key from the root leaf, if present.
    pub fn remove_in_root_leaf(&self, key: &K) -> Result<()> {
        let root = self.root();
        let mut node = self.edit_node(root)?;
        assert!(node.is_leaf(), "remove_in_root_leaf called on an internal root");

        if let Ok(i) = node.keys.binary_search(key) {
            node.keys.remove(i);
            node.values.remove(i);
        }

        self.put_node(root, node);
        Ok(())
    }

    /// Inserts or replaces a key's value directly in the root leaf.
    ///
    /// This intentionally implements only the single-leaf-root case the
    /// crate's current consumers (range map, super-tree) need; splitting an
    /// overflowing root into a new internal root is not yet implemented.
    pub fn insert_in_root_leaf(&self, key: K, value: V) -> Result<()> {
        let root = self.root();
        let mut node = self.edit_node(root)?;
        assert!(node.is_leaf(), "insert_in_root_leaf called on an internal root");

        match node.keys.binary_search(&key) {
            Ok(i) => node.values[i] = value,
            Err(i) => {
                node.keys.insert(i, key);
                node.values.insert(i, value);
            }
        }

        self.put_node(root, node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use test_log::test;

    fn test_tree() -> Result<(Tree<u64, u64>, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, TREE_BLOCK_SIZE as u64 * 64, 4096, 16 * 1024 * 1024);
        let cache = Arc::new(NodeCache::with_capacity(64));
        let bitmap = Arc::new(BitmapAllocator::new(64));

        let tree = Tree::open(device, table, cache, bitmap, DiskBlock::MAX)?;
        Ok((tree, dir))
    }

    #[test]
    fn insert_then_lookup() -> Result<()> {
        let (tree, _dir) = test_tree()?;
        tree.insert_in_root_leaf(5, 500)?;
        tree.insert_in_root_leaf(1, 100)?;

        assert_eq!(tree.lookup(&5)?, Some(500));
        assert_eq!(tree.lookup(&1)?, Some(100));
        assert_eq!(tree.lookup(&99)?, None);

        Ok(())
    }

    #[test]
    fn sync_persists_under_fresh_block() -> Result<()> {
        let (tree, _dir) = test_tree()?;
        let original_root = tree.root();

        tree.insert_in_root_leaf(1, 100)?;
        tree.sync()?;

        assert_ne!(tree.root(), original_root, "COW sync should move the root");
        assert_eq!(tree.lookup(&1)?, Some(100));

        Ok(())
    }
}
