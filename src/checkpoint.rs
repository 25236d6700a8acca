// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The double-buffered checkpoint: a periodic snapshot of every bitmap and
//! tree root needed to bound recovery to "replay since `log_end`" instead of
//! a full log scan.
//!
//! Two fixed slots ([`Section::CheckpointA`]/[`Section::CheckpointB`])
//! alternate by generation parity. A commit is durable the instant its slot
//! write and the device's `sync` both return; recovery reads both slots and
//! takes the higher-generation one whose checksum still matches, exactly
//! mirroring the segment engine's `rewrite_atomic` pattern (write the new
//! copy out fully, never touch the old one until the new one is down) but
//! expressed as two fixed disk regions instead of a temp-file rename, since
//! a checkpoint lives inside the single backing device file rather than its
//! own path.

use crate::alloc::BitmapAllocator;
use crate::btree::node::DiskBlock;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::device::BlockDevice;
use crate::gc::ObsolescenceHeap;
use crate::hash::{Hash, HASH_LEN};
use crate::id::{LogId, SegmentId};
use crate::section::{Section, SectionTable};
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Everything a checkpoint commit snapshots, sufficient to reopen every
/// on-disk structure without replaying the log from the beginning.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Monotonically increasing; always `> 0` for a slot with a valid checksum.
    pub generation: u64,
    /// Log position to resume replay from during recovery.
    pub log_end: LogId,
    /// Root block of the super-tree (the disk-id -> VDisk metadata index).
    pub super_tree_root: DiskBlock,
    /// Serialized segment-allocator bitmap.
    pub segment_bitmap: Vec<u8>,
    /// Width, in bits, of [`Self::segment_bitmap`].
    pub segment_bitmap_width: usize,
    /// Serialized node-slot allocator bitmap.
    pub node_bitmap: Vec<u8>,
    /// Width, in bits, of [`Self::node_bitmap`].
    pub node_bitmap_width: usize,
    /// `(segment, obsolescence count)` as of this checkpoint.
    pub obsolescence: Vec<(SegmentId, u64)>,
}

impl Encode for CheckpointRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.generation)?;
        writer.write_u64::<BigEndian>(self.log_end.as_u64())?;
        writer.write_u64::<BigEndian>(self.super_tree_root)?;

        writer.write_u64::<BigEndian>(self.segment_bitmap_width as u64)?;
        writer.write_u32::<BigEndian>(self.segment_bitmap.len() as u32)?;
        writer.write_all(&self.segment_bitmap)?;

        writer.write_u64::<BigEndian>(self.node_bitmap_width as u64)?;
        writer.write_u32::<BigEndian>(self.node_bitmap.len() as u32)?;
        writer.write_all(&self.node_bitmap)?;

        writer.write_u32::<BigEndian>(self.obsolescence.len() as u32)?;
        for (segment, count) in &self.obsolescence {
            writer.write_u64::<BigEndian>(*segment)?;
            writer.write_u64::<BigEndian>(*count)?;
        }

        Ok(())
    }
}

impl Decode for CheckpointRecord {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let generation = reader.read_u64::<BigEndian>()?;
        let log_end = LogId::from_u64(reader.read_u64::<BigEndian>()?);
        let super_tree_root = reader.read_u64::<BigEndian>()?;

        let segment_bitmap_width = reader.read_u64::<BigEndian>()? as usize;
        let segment_bitmap_len = reader.read_u32::<BigEndian>()? as usize;
        let mut segment_bitmap = vec![0u8; segment_bitmap_len];
        reader.read_exact(&mut segment_bitmap)?;

        let node_bitmap_width = reader.read_u64::<BigEndian>()? as usize;
        let node_bitmap_len = reader.read_u32::<BigEndian>()? as usize;
        let mut node_bitmap = vec![0u8; node_bitmap_len];
        reader.read_exact(&mut node_bitmap)?;

        let obsolescence_len = reader.read_u32::<BigEndian>()?;
        let mut obsolescence = Vec::with_capacity(obsolescence_len as usize);
        for _ in 0..obsolescence_len {
            let segment = reader.read_u64::<BigEndian>()?;
            let count = reader.read_u64::<BigEndian>()?;
            obsolescence.push((segment, count));
        }

        Ok(Self {
            generation,
            log_end,
            super_tree_root,
            segment_bitmap,
            segment_bitmap_width,
            node_bitmap,
            node_bitmap_width,
            obsolescence,
        })
    }
}

/// Owns the alternating-slot commit protocol and the one generation of
/// deferred node-block frees §4.2/§4.5 require: a node block moved by the
/// copy-on-write sync that produced the checkpoint currently on disk must
/// not be freed until the *next* commit supersedes that checkpoint, since
/// until then it is still the only copy a crash-recovery would find.
pub struct Checkpointer {
    device: std::sync::Arc<dyn BlockDevice>,
    table: SectionTable,
    last_generation: AtomicU64,
    pending_frees: Mutex<Vec<DiskBlock>>,
}

impl Checkpointer {
    /// Opens a checkpointer that will commit its next record at
    /// `starting_generation + 1`, typically the generation recovered by
    /// [`Checkpointer::recover`] (or `0` on a fresh disk).
    #[must_use]
    pub fn new(device: std::sync::Arc<dyn BlockDevice>, table: SectionTable, starting_generation: u64) -> Self {
        Self {
            device,
            table,
            last_generation: AtomicU64::new(starting_generation),
            pending_frees: Mutex::new(Vec::new()),
        }
    }

    fn slot_for_generation(generation: u64) -> Section {
        if generation % 2 == 1 {
            Section::CheckpointA
        } else {
            Section::CheckpointB
        }
    }

    /// Commits a new checkpoint: frees the node blocks made safe by this
    /// commit superseding the previous one, snapshots the given bitmaps and
    /// obsolescence counters, and writes the record to the alternate slot.
    ///
    /// `moved` is the `old -> new` remap returned by the super-tree's
    /// [`Tree::sync`](crate::btree::store::Tree::sync); its keys become the
    /// *next* commit's deferred frees, not this one's.
    pub fn commit(
        &self,
        log_end: LogId,
        super_tree_root: DiskBlock,
        moved: &HashMap<DiskBlock, DiskBlock>,
        segment_bitmap: &BitmapAllocator,
        node_bitmap: &BitmapAllocator,
        obsolescence: &ObsolescenceHeap,
        tracked_segments: &[SegmentId],
    ) -> Result<CheckpointRecord> {
        {
            let mut pending = self.pending_frees.lock().expect("lock is poisoned");
            for block in pending.drain(..) {
                node_bitmap.free(block as usize);
            }
        }

        let generation = self.last_generation.load(Ordering::Acquire) + 1;
        let record = CheckpointRecord {
            generation,
            log_end,
            super_tree_root,
            segment_bitmap: segment_bitmap.to_bytes(),
            segment_bitmap_width: segment_bitmap.width(),
            node_bitmap: node_bitmap.to_bytes(),
            node_bitmap_width: node_bitmap.width(),
            obsolescence: tracked_segments.iter().map(|&s| (s, obsolescence.count(s))).collect(),
        };

        let slot = Self::slot_for_generation(generation);
        let body = record.encode_into_vec()?;
        let checksum = Hash::checksum(&body);

        let mut buf = Vec::with_capacity(self.table.length_of(slot) as usize);
        checksum.encode_into(&mut buf)?;
        buf.write_u32::<BigEndian>(body.len() as u32)?;
        buf.extend_from_slice(&body);
        if buf.len() as u64 > self.table.length_of(slot) {
            return Err(Error::Validation("checkpoint record exceeds its slot"));
        }
        buf.resize(self.table.length_of(slot) as usize, 0);

        crate::device::write_section(self.device.as_ref(), &self.table, slot, 0, &buf)?;
        self.device.sync()?;

        self.last_generation.store(generation, Ordering::Release);
        *self.pending_frees.lock().expect("lock is poisoned") = moved.keys().copied().collect();

        Ok(record)
    }

    fn read_slot(device: &dyn BlockDevice, table: &SectionTable, slot: Section) -> Option<CheckpointRecord> {
        let mut buf = vec![0u8; table.length_of(slot) as usize];
        crate::device::read_section(device, table, slot, 0, &mut buf).ok()?;

        if buf.len() < HASH_LEN + 4 {
            return None;
        }

        let mut cursor = Cursor::new(&buf[..]);
        let checksum = Hash::decode_from(&mut cursor).ok()?;
        let body_len = cursor.read_u32::<BigEndian>().ok()? as usize;

        let start = HASH_LEN + 4;
        let body = buf.get(start..start + body_len)?;
        if Hash::checksum(body) != checksum {
            return None;
        }

        let mut body_cursor = Cursor::new(body);
        CheckpointRecord::decode_from(&mut body_cursor).ok().filter(|record| record.generation > 0)
    }

    /// Reads both slots and returns the higher-generation one whose checksum
    /// still matches, or `None` if neither validates — expected only on a
    /// first-boot device, per §7.
    #[must_use]
    pub fn recover(device: &dyn BlockDevice, table: &SectionTable) -> Option<CheckpointRecord> {
        let a = Self::read_slot(device, table, Section::CheckpointA);
        let b = Self::read_slot(device, table, Section::CheckpointB);

        match (a, b) {
            (Some(a), Some(b)) => Some(if a.generation >= b.generation { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use std::sync::Arc;
    use test_log::test;

    fn table() -> SectionTable {
        SectionTable::new(4096, 4096 * 64, 4096, 16 * 1024 * 1024)
    }

    #[test]
    fn commit_then_recover_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = table();

        let segment_bitmap = BitmapAllocator::new(64);
        let node_bitmap = BitmapAllocator::new(64);
        segment_bitmap.alloc().expect("room");
        node_bitmap.alloc().expect("room");
        let obsolescence = ObsolescenceHeap::new();
        obsolescence.add_obsolete(0, 7);

        let checkpointer = Checkpointer::new(Arc::clone(&device), table.clone(), 0);
        let record = checkpointer.commit(
            LogId::new(3, 12),
            5,
            &HashMap::new(),
            &segment_bitmap,
            &node_bitmap,
            &obsolescence,
            &[0],
        )?;
        assert_eq!(record.generation, 1);

        let recovered = Checkpointer::recover(device.as_ref(), &table).expect("slot A should validate");
        assert_eq!(recovered.generation, 1);
        assert_eq!(recovered.log_end, LogId::new(3, 12));
        assert_eq!(recovered.super_tree_root, 5);
        assert_eq!(recovered.obsolescence, vec![(0, 7)]);

        Ok(())
    }

    #[test]
    fn later_generation_wins_on_recovery() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = table();
        let segment_bitmap = BitmapAllocator::new(64);
        let node_bitmap = BitmapAllocator::new(64);
        let obsolescence = ObsolescenceHeap::new();

        let checkpointer = Checkpointer::new(Arc::clone(&device), table.clone(), 0);
        checkpointer.commit(LogId::new(0, 0), 1, &HashMap::new(), &segment_bitmap, &node_bitmap, &obsolescence, &[])?;
        checkpointer.commit(LogId::new(1, 0), 2, &HashMap::new(), &segment_bitmap, &node_bitmap, &obsolescence, &[])?;

        let recovered = Checkpointer::recover(device.as_ref(), &table).expect("a valid slot");
        assert_eq!(recovered.generation, 2);
        assert_eq!(recovered.super_tree_root, 2);
        Ok(())
    }

    #[test]
    fn deferred_frees_wait_one_generation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = table();
        let node_bitmap = BitmapAllocator::new(8);
        let segment_bitmap = BitmapAllocator::new(8);
        let obsolescence = ObsolescenceHeap::new();

        let old_block = node_bitmap.alloc().expect("room") as DiskBlock;
        let mut moved = HashMap::new();
        moved.insert(old_block, node_bitmap.alloc().expect("room") as DiskBlock);

        let checkpointer = Checkpointer::new(Arc::clone(&device), table.clone(), 0);
        checkpointer.commit(LogId::invalid(), 0, &moved, &segment_bitmap, &node_bitmap, &obsolescence, &[])?;
        assert!(node_bitmap.is_allocated(old_block as usize), "old block must survive until the next commit");

        checkpointer.commit(LogId::invalid(), 0, &HashMap::new(), &segment_bitmap, &node_bitmap, &obsolescence, &[])?;
        assert!(!node_bitmap.is_allocated(old_block as usize), "old block frees once a newer checkpoint lands");

        Ok(())
    }
}
