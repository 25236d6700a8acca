// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The super-tree: the disk-id -> `VDisk` metadata index every [`crate::host::Host`]
//! keeps rooted in its checkpoint, used to rebuild every volume's in-memory
//! state on recovery without replaying the log from genesis.
//!
//! Built directly on the same paged [`Tree`] the range map uses, the same way
//! the segment engine's manifest and its per-segment index both sit on top of
//! one shared tree format rather than each inventing their own.

use crate::btree::cache::NodeCache;
use crate::btree::node::{DiskBlock, FixedWidth};
use crate::btree::store::Tree;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::device::BlockDevice;
use crate::hash::{Hash, HASH_LEN};
use crate::id::DiskId;
use crate::section::SectionTable;
use crate::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Upper bound on the replica set a single super-tree entry can carry.
///
/// The wire protocol's view is a small, operator-sized set of hosts (§4.13
/// expects single-digit replica counts), not an open-ended list, so a fixed
/// slot count keeps `VDiskMeta` a [`FixedWidth`] value instead of requiring a
/// second indirection the way an overflowing node would.
pub const MAX_VIEW_REPLICAS: usize = 8;

/// Everything the super-tree stores for one volume: the root of its range
/// map, its hash-chain head and rolling entropy, its next LSN, and its
/// current replica set.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct VDiskMeta {
    /// Root block of this volume's [`crate::range_map::RangeMap`].
    pub root: DiskBlock,
    /// Next LSN this volume will assign.
    pub lsn: u64,
    /// Current hash-chain head (`currentId`).
    pub head: Hash,
    /// Rolling entropy hash folded into the next entry's secret derivation.
    pub entropy: Hash,
    /// Current replica set, as host ids.
    pub view: Vec<DiskId>,
}

impl FixedWidth for VDiskMeta {
    const ENCODED_LEN: usize = 8 + 8 + HASH_LEN + HASH_LEN + 1 + MAX_VIEW_REPLICAS * 8;
}

impl Encode for VDiskMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        assert!(
            self.view.len() <= MAX_VIEW_REPLICAS,
            "replica set exceeds the super-tree's fixed view width"
        );

        writer.write_u64::<BigEndian>(self.root)?;
        writer.write_u64::<BigEndian>(self.lsn)?;
        self.head.encode_into(writer)?;
        self.entropy.encode_into(writer)?;
        writer.write_u8(self.view.len() as u8)?;

        for slot in 0..MAX_VIEW_REPLICAS {
            let id = self.view.get(slot).copied().unwrap_or(0);
            writer.write_u64::<BigEndian>(id)?;
        }

        Ok(())
    }
}

impl Decode for VDiskMeta {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let root = reader.read_u64::<BigEndian>()?;
        let lsn = reader.read_u64::<BigEndian>()?;

        let head = Hash::decode_from(reader)?;
        let entropy = Hash::decode_from(reader)?;

        let count = reader.read_u8()? as usize;
        let mut slots = [0u64; MAX_VIEW_REPLICAS];
        for slot in slots.iter_mut() {
            *slot = reader.read_u64::<BigEndian>()?;
        }

        if count > MAX_VIEW_REPLICAS {
            return Err(DecodeError::InvalidHeader("super-tree entry's view count overflows its fixed slots"));
        }

        Ok(Self {
            root,
            lsn,
            head,
            entropy,
            view: slots[..count].to_vec(),
        })
    }
}

/// The disk-id -> `VDiskMeta` index, rooted directly in the host's checkpoint.
pub struct Registry {
    tree: Tree<Hash, VDiskMeta>,
}

impl Registry {
    /// Opens (or creates, if `root` is [`DiskBlock::MAX`]) the super-tree
    /// rooted at `root`.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        table: SectionTable,
        cache: Arc<NodeCache<Hash, VDiskMeta>>,
        node_bitmap: Arc<crate::alloc::BitmapAllocator>,
        root: DiskBlock,
    ) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(device, table, cache, node_bitmap, root)?,
        })
    }

    /// The tree's current root block, for checkpointing.
    #[must_use]
    pub fn root(&self) -> DiskBlock {
        self.tree.root()
    }

    /// Looks up a volume's recorded metadata.
    pub fn get(&self, disk: &Hash) -> Result<Option<VDiskMeta>> {
        self.tree.lookup(disk)
    }

    /// Installs (or overwrites) a volume's metadata.
    pub fn put(&self, disk: Hash, meta: VDiskMeta) -> Result<()> {
        self.tree.insert_in_root_leaf(disk, meta)
    }

    /// Drops a volume's entry entirely (not used by ordinary operation today,
    /// kept for symmetry with [`Tree::remove_in_root_leaf`]).
    pub fn remove(&self, disk: &Hash) -> Result<()> {
        self.tree.remove_in_root_leaf(disk)
    }

    /// Every volume currently recorded, for recovery's rescan step (§4.8).
    pub fn all(&self) -> Result<Vec<(Hash, VDiskMeta)>> {
        self.tree.all_entries()
    }

    /// Copy-on-write sync, invoked by the checkpointer alongside every
    /// volume's range-map sync.
    pub fn sync(&self) -> Result<HashMap<DiskBlock, DiskBlock>> {
        self.tree.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BitmapAllocator;
    use crate::btree::node::TREE_BLOCK_SIZE;
    use crate::device::FileDevice;
    use test_log::test;

    fn test_registry() -> Result<(Registry, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, TREE_BLOCK_SIZE as u64 * 64, 4096, 16 * 1024 * 1024);
        let cache = Arc::new(NodeCache::with_capacity(64));
        let bitmap = Arc::new(BitmapAllocator::new(64));

        let registry = Registry::open(device, table, cache, bitmap, DiskBlock::MAX)?;
        Ok((registry, dir))
    }

    fn sample_meta() -> VDiskMeta {
        VDiskMeta {
            root: 7,
            lsn: 3,
            head: Hash::checksum(b"head"),
            entropy: Hash::checksum(b"entropy"),
            view: vec![1, 2, 3],
        }
    }

    #[test]
    fn put_then_get_round_trips() -> Result<()> {
        let (registry, _dir) = test_registry()?;
        let disk = Hash::checksum(b"disk");
        registry.put(disk, sample_meta())?;

        let meta = registry.get(&disk)?.expect("entry should be present");
        assert_eq!(meta, sample_meta());
        Ok(())
    }

    #[test]
    fn unknown_disk_is_absent() -> Result<()> {
        let (registry, _dir) = test_registry()?;
        assert_eq!(registry.get(&Hash::checksum(b"nope"))?, None);
        Ok(())
    }

    #[test]
    fn all_lists_every_registered_volume() -> Result<()> {
        let (registry, _dir) = test_registry()?;
        let a = Hash::checksum(b"a");
        let b = Hash::checksum(b"b");
        registry.put(a, sample_meta())?;
        registry.put(b, sample_meta())?;

        let all = registry.all()?;
        assert_eq!(all.len(), 2);
        Ok(())
    }

    #[test]
    fn sync_persists_under_fresh_block() -> Result<()> {
        let (registry, _dir) = test_registry()?;
        let original_root = registry.root();
        registry.put(Hash::checksum(b"disk"), sample_meta())?;
        registry.sync()?;
        assert_ne!(registry.root(), original_root, "COW sync should move the root");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "fixed view width")]
    fn oversized_view_panics_on_encode() {
        let meta = VDiskMeta {
            root: 0,
            lsn: 0,
            head: Hash::zero(),
            entropy: Hash::zero(),
            view: (0..(MAX_VIEW_REPLICAS as u64 + 1)).collect(),
        };
        let _ = meta.encode_into_vec();
    }
}
