// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The LBA-interval index from `[from, to)` to log position, built on the
//! paged [`Tree`](crate::btree::store::Tree).
//!
//! Inserts are buffered in a fixed in-memory ring before being flushed into
//! the persistent tree, so a burst of sequential writes doesn't force a tree
//! mutation (and a cache-line's worth of copy-on-write) per block. `lookup`
//! always checks the ring first, newest entry wins, before falling through
//! to the tree.

use crate::btree::cache::NodeCache;
use crate::btree::node::{DiskBlock, FixedWidth};
use crate::btree::store::Tree;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::device::BlockDevice;
use crate::id::{LogId, SegmentId};
use crate::section::SectionTable;
use crate::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Upper bound on buffered inserts before a blocking reader forces a flush.
pub const MAX_INSERTS: usize = 6144;

/// Value stored at each `to`-keyed tree entry: the interval's start, the log
/// position its bytes begin at, and the LSN that produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RangeEntry {
    /// Start LBA of this interval (inclusive).
    pub from: u64,
    /// Log position the interval's bytes begin at. Invalid means "elided
    /// all-zero run": reads fall through to the parent snapshot or peer.
    pub log_id: LogId,
    /// LSN of the write that produced this interval.
    pub version: u64,
}

impl FixedWidth for RangeEntry {
    const ENCODED_LEN: usize = 8 + 8 + 8;
}

impl Encode for RangeEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.from)?;
        writer.write_u64::<BigEndian>(self.log_id.as_u64())?;
        writer.write_u64::<BigEndian>(self.version)?;
        Ok(())
    }
}

impl Decode for RangeEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let from = reader.read_u64::<BigEndian>()?;
        let log_id = LogId::from_u64(reader.read_u64::<BigEndian>()?);
        let version = reader.read_u64::<BigEndian>()?;
        Ok(Self { from, log_id, version })
    }
}

/// Notified whenever an insert overwrites a physical block, so the segment
/// cleaner can track how much of each segment is still live.
pub trait ObsolescenceSink: Send + Sync {
    /// Adds `count` obsoleted blocks to `segment`'s counter.
    fn add_obsolete(&self, segment: SegmentId, count: u64);
}

/// No-op sink, for trees (e.g. tests, the super-tree) that don't participate
/// in obsolescence accounting.
pub struct NullObsolescenceSink;

impl ObsolescenceSink for NullObsolescenceSink {
    fn add_obsolete(&self, _segment: SegmentId, _count: u64) {}
}

struct PendingInsert {
    entry: RangeEntry,
    to: u64,
}

/// The persistent `[from, to) -> log position` index for a single volume,
/// fronted by a bounded in-memory insert ring.
pub struct RangeMap {
    tree: Tree<u64, RangeEntry>,
    ring: Mutex<VecDeque<PendingInsert>>,
    ring_len: AtomicUsize,
    obsolescence: Arc<dyn ObsolescenceSink>,
    flusher_wake: mpsc::Sender<()>,
}

impl RangeMap {
    /// Opens (or creates, if `root` is [`DiskBlock::MAX`]) a range map rooted
    /// at `root`.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        table: SectionTable,
        cache: Arc<NodeCache<u64, RangeEntry>>,
        node_bitmap: Arc<crate::alloc::BitmapAllocator>,
        root: DiskBlock,
        obsolescence: Arc<dyn ObsolescenceSink>,
        flusher_wake: mpsc::Sender<()>,
    ) -> Result<Self> {
        Ok(Self {
            tree: Tree::open(device, table, cache, node_bitmap, root)?,
            ring: Mutex::new(VecDeque::new()),
            ring_len: AtomicUsize::new(0),
            obsolescence,
            flusher_wake,
        })
    }

    /// The tree's current root block, for checkpointing.
    #[must_use]
    pub fn root(&self) -> DiskBlock {
        self.tree.root()
    }

    /// Copy-on-write syncs the underlying tree, flushing any buffered ring
    /// inserts first so the persisted root reflects every acknowledged
    /// write. Returns the old-block -> new-block remap for the
    /// checkpointer's deferred-free bookkeeping.
    pub fn sync(&self) -> Result<std::collections::HashMap<DiskBlock, DiskBlock>> {
        self.flush()?;
        self.tree.sync()
    }

    /// Buffers an insert of `[from, to) -> log_id` at `lsn`. Wakes the
    /// flusher at 7/8 full, blocks to flush inline at 15/16 full.
    pub fn insert(&self, lsn: u64, from: u64, to: u64, log_id: LogId) -> Result<()> {
        {
            let mut ring = self.ring.lock().expect("lock is poisoned");
            ring.push_back(PendingInsert {
                entry: RangeEntry { from, log_id, version: lsn },
                to,
            });
            self.ring_len.store(ring.len(), Ordering::Release);
        }

        let len = self.ring_len.load(Ordering::Acquire);
        if len >= MAX_INSERTS * 15 / 16 {
            self.flush()?;
        } else if len >= MAX_INSERTS * 7 / 8 {
            let _ = self.flusher_wake.send(());
        }

        Ok(())
    }

    /// Looks up the run covering `lba`. Checks the ring backwards (newest
    /// first) before consulting the tree. Returns `(log_id, endsat)`, where
    /// `log_id` is already offset to `lba` itself (not the run's start) and
    /// `endsat` is the LBA the returned run ends at (exclusive).
    pub fn lookup(&self, lba: u64) -> Result<Option<(LogId, u64)>> {
        {
            let ring = self.ring.lock().expect("lock is poisoned");
            for pending in ring.iter().rev() {
                if pending.entry.from <= lba && lba < pending.to {
                    let log_id = adjusted_log_id(pending.entry.log_id, lba - pending.entry.from);
                    return Ok(Some((log_id, pending.to)));
                }
            }
        }

        self.lookup_tree(lba)
    }

    fn lookup_tree(&self, lba: u64) -> Result<Option<(LogId, u64)>> {
        let entries = self.tree.scan_from(&0)?;
        for (to, entry) in entries {
            if entry.from <= lba && lba < to {
                let log_id = adjusted_log_id(entry.log_id, lba - entry.from);
                return Ok(Some((log_id, to)));
            }
        }
        Ok(None)
    }

    /// Forces a synchronous flush, draining the ring into the tree in FIFO
    /// order (insertion order must be preserved so obsolescence accounting
    /// reflects the true overwrite sequence).
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<PendingInsert> = {
            let mut ring = self.ring.lock().expect("lock is poisoned");
            let drained = ring.drain(..).collect();
            self.ring_len.store(0, Ordering::Release);
            drained
        };

        for p in pending {
            self.insert_into_tree(p.entry, p.to)?;
        }

        Ok(())
    }

    fn insert_into_tree(&self, entry: RangeEntry, to: u64) -> Result<()> {
        let existing = self.tree.scan_from(&0)?;

        for (existing_to, existing_entry) in &existing {
            let (existing_from, existing_to) = (existing_entry.from, *existing_to);
            if existing_to <= entry.from || existing_from >= to {
                continue; // disjoint
            }

            let overlap_from = existing_from.max(entry.from);
            let overlap_to = existing_to.min(to);
            self.credit_obsolescence(existing_entry, overlap_to - overlap_from);

            if entry.from <= existing_from && to >= existing_to {
                // wholly overlapped: drop it
                self.tree.remove_in_root_leaf(&existing_to)?;
            } else if existing_from < entry.from && existing_to > to {
                // new interval strictly inside the old one: split into a
                // left remainder and a right remainder
                self.tree.remove_in_root_leaf(&existing_to)?;
                self.tree.insert_in_root_leaf(
                    entry.from,
                    RangeEntry { from: existing_from, log_id: existing_entry.log_id, version: existing_entry.version },
                )?;
                self.tree.insert_in_root_leaf(
                    existing_to,
                    RangeEntry {
                        from: to,
                        log_id: offset_log_id(existing_entry.log_id, to - existing_from),
                        version: existing_entry.version,
                    },
                )?;
            } else if existing_from < entry.from {
                // overlap at the tail of the old interval: shrink it
                self.tree.remove_in_root_leaf(&existing_to)?;
                self.tree.insert_in_root_leaf(
                    entry.from,
                    RangeEntry { from: existing_from, log_id: existing_entry.log_id, version: existing_entry.version },
                )?;
            } else {
                // overlap at the head of the old interval: shrink it
                self.tree.remove_in_root_leaf(&existing_to)?;
                self.tree.insert_in_root_leaf(
                    existing_to,
                    RangeEntry {
                        from: to,
                        log_id: offset_log_id(existing_entry.log_id, to - existing_from),
                        version: existing_entry.version,
                    },
                )?;
            }
        }

        self.insert_merged(entry, to)
    }

    /// Inserts the new interval, merging with a physically-contiguous
    /// predecessor so the tree stays compact rather than accumulating one
    /// entry per sequential write.
    fn insert_merged(&self, entry: RangeEntry, to: u64) -> Result<()> {
        if entry.log_id.is_invalid() {
            self.tree.insert_in_root_leaf(to, entry)?;
            return Ok(());
        }

        let existing = self.tree.scan_from(&0)?;
        if let Some((prev_to, prev)) = existing.into_iter().find(|(prev_to, _)| *prev_to == entry.from) {
            let contiguous = prev.log_id.segment() == entry.log_id.segment()
                && u64::from(prev.log_id.block_offset()) + (entry.from - prev.from) == u64::from(entry.log_id.block_offset());

            if contiguous {
                self.tree.remove_in_root_leaf(&prev_to)?;
                self.tree.insert_in_root_leaf(
                    to,
                    RangeEntry { from: prev.from, log_id: prev.log_id, version: entry.version },
                )?;
                return Ok(());
            }
        }

        self.tree.insert_in_root_leaf(to, entry)?;
        Ok(())
    }

    fn credit_obsolescence(&self, entry: &RangeEntry, blocks: u64) {
        if !entry.log_id.is_invalid() {
            self.obsolescence.add_obsolete(entry.log_id.segment(), blocks);
        }
    }
}

/// Offsets a log position forward by `blocks` 512-byte blocks, staying
/// within the same segment (used when shrinking an interval from the head).
fn offset_log_id(log_id: LogId, blocks: u64) -> LogId {
    LogId::new(log_id.segment(), log_id.block_offset() + blocks as u16)
}

/// Like [`offset_log_id`], but leaves the zero-elision sentinel untouched:
/// an invalid log id has no physical position to offset.
fn adjusted_log_id(log_id: LogId, blocks: u64) -> LogId {
    if log_id.is_invalid() {
        log_id
    } else {
        offset_log_id(log_id, blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use test_log::test;

    fn test_map() -> Result<(RangeMap, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, 4096 * 64, 4096, 16 * 1024 * 1024);
        let cache = Arc::new(NodeCache::with_capacity(64));
        let bitmap = Arc::new(crate::alloc::BitmapAllocator::new(64));
        let (tx, _rx) = mpsc::channel();

        let map = RangeMap::open(
            device,
            table,
            cache,
            bitmap,
            DiskBlock::MAX,
            Arc::new(NullObsolescenceSink),
            tx,
        )?;
        Ok((map, dir))
    }

    #[test]
    fn insert_then_lookup_via_ring() -> Result<()> {
        let (map, _dir) = test_map()?;
        map.insert(1, 0, 8, LogId::new(0, 0))?;
        assert_eq!(map.lookup(4)?, Some((LogId::new(0, 4), 8)));
        assert_eq!(map.lookup(9)?, None);
        Ok(())
    }

    #[test]
    fn flush_persists_into_tree() -> Result<()> {
        let (map, _dir) = test_map()?;
        map.insert(1, 0, 8, LogId::new(0, 0))?;
        map.flush()?;
        assert_eq!(map.lookup(4)?, Some((LogId::new(0, 4), 8)));
        Ok(())
    }

    #[test]
    fn overwrite_shrinks_old_interval() -> Result<()> {
        let (map, _dir) = test_map()?;
        map.insert(1, 0, 16, LogId::new(0, 0))?;
        map.flush()?;

        map.insert(2, 4, 8, LogId::new(1, 0))?;
        map.flush()?;

        assert_eq!(map.lookup(0)?, Some((LogId::new(0, 0), 4)));
        assert_eq!(map.lookup(5)?, Some((LogId::new(1, 1), 8)));
        assert_eq!(map.lookup(10)?.map(|(id, _)| id), Some(offset_log_id(LogId::new(0, 0), 10)));
        Ok(())
    }

    #[test]
    fn sequential_writes_merge_into_one_interval() -> Result<()> {
        let (map, _dir) = test_map()?;
        map.insert(1, 0, 1, LogId::new(0, 0))?;
        map.flush()?;
        map.insert(2, 1, 2, LogId::new(0, 1))?;
        map.flush()?;

        let entries = map.all_entries_for_test()?;
        assert_eq!(entries.len(), 1, "contiguous writes should merge into one interval");
        Ok(())
    }

    impl RangeMap {
        fn all_entries_for_test(&self) -> Result<Vec<(u64, RangeEntry)>> {
            self.tree.all_entries()
        }
    }

    #[test]
    fn zero_elision_maps_to_invalid_sentinel() -> Result<()> {
        let (map, _dir) = test_map()?;
        map.insert(1, 0, 1, LogId::invalid())?;
        assert_eq!(map.lookup(0)?, Some((LogId::invalid(), 1)));
        Ok(())
    }

}
