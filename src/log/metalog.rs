// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chain of segments forming one global physical log.

use crate::alloc::BitmapAllocator;
use crate::device::BlockDevice;
use crate::fingerprint::FingerprintAccumulator;
use crate::id::{IdGenerator, LogId, SegmentId};
use crate::log::entry::{BlockPresence, EntryBody, EntryHead, PointerDirection, BLOCK_SIZE};
use crate::section::SectionTable;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, RwLock};

use super::segment::LogSegment;

/// Slack reserved at the end of a segment for the three-child pointer
/// rollover dance (forward pointer, close, backward pointer).
const ROLLOVER_SLACK: u64 = 3 * 512;

/// [`LogId::block_offset`] is a 16-bit field, too narrow to index a 16 MiB
/// segment's byte range (24 bits); packed positions therefore count
/// 512-byte blocks, not bytes. Every relative byte offset this module hands
/// to [`LogId::new`] goes through this conversion, and every block offset
/// read back from a `LogId` goes through [`block_units_to_bytes`].
fn bytes_to_block_units(byte_offset: u64) -> u16 {
    debug_assert_eq!(byte_offset % BLOCK_SIZE as u64, 0, "offsets are always block-aligned");
    (byte_offset / BLOCK_SIZE as u64) as u16
}

fn block_units_to_bytes(block_offset: u16) -> u64 {
    u64::from(block_offset) * BLOCK_SIZE as u64
}

/// Bound on the number of recently-touched segments kept as live
/// [`LogSegment`] handles rather than rebuilt on next access.
const MAX_OPEN_LOGS: usize = 128;

/// Owns the current active segment, the segment bitmap, and per-segment
/// dedup fingerprint accumulators.
pub struct MetaLog {
    device: Arc<dyn BlockDevice>,
    table: SectionTable,
    segment_capacity: u64,
    segment_bitmap: Arc<BitmapAllocator>,
    id_gen: IdGenerator,

    open_segments: RwLock<HashMap<SegmentId, Arc<LogSegment>>>,
    active: Mutex<Option<SegmentId>>,
    fingerprints: Mutex<HashMap<SegmentId, FingerprintAccumulator>>,

    /// Woken whenever an append completes, so remote streamers know to look
    /// for more data.
    streamer_wake: mpsc::Sender<()>,
}

impl MetaLog {
    /// Opens a fresh `MetaLog` over `device`, starting with no active segment.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        table: SectionTable,
        segment_capacity: u64,
        segment_bitmap: Arc<BitmapAllocator>,
        streamer_wake: mpsc::Sender<()>,
    ) -> Self {
        Self {
            device,
            table,
            segment_capacity,
            segment_bitmap,
            id_gen: IdGenerator::new(0),
            open_segments: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
            fingerprints: Mutex::new(HashMap::new()),
            streamer_wake,
        }
    }

    fn segment_base(&self, id: SegmentId) -> u64 {
        id * self.segment_capacity
    }

    fn open_segment(&self, id: SegmentId) -> Arc<LogSegment> {
        let mut open = self.open_segments.write().expect("lock is poisoned");
        if let Some(segment) = open.get(&id) {
            return Arc::clone(segment);
        }

        let segment = Arc::new(LogSegment::new(id, self.segment_capacity));
        if open.len() >= MAX_OPEN_LOGS {
            // Evict an arbitrary entry; the dropped handle's state (cursor,
            // stable end) only matters for the currently-active segment,
            // which callers always keep pinned via `active`.
            if let Some(&evict) = open.keys().next() {
                open.remove(&evict);
            }
        }
        open.insert(id, Arc::clone(&segment));
        segment
    }

    fn allocate_segment(&self) -> Result<Arc<LogSegment>> {
        let id = self
            .segment_bitmap
            .alloc()
            .map_err(|_| Error::Validation("segment bitmap exhausted"))? as SegmentId;
        let segment = self.open_segment(id);
        segment.activate();
        self.fingerprints
            .lock()
            .expect("lock is poisoned")
            .insert(id, FingerprintAccumulator::new());
        Ok(segment)
    }

    /// Appends an update entry, rolling the active segment over to a fresh
    /// one (with forward/backward pointer records) if it would not otherwise
    /// fit.
    pub fn append(&self, head: EntryHead, body: &[u8]) -> Result<LogId> {
        let num_blocks = body.len() / BLOCK_SIZE;
        let needed = (super::entry::HEAD_SIZE + body.len()) as u64;

        let mut guard = self.active.lock().expect("lock is poisoned");
        let active_id = match *guard {
            Some(id) => id,
            None => {
                let segment = self.allocate_segment()?;
                *guard = Some(segment.id);
                segment.id
            }
        };

        let active = self.open_segment(active_id);

        if active.remaining() < needed + ROLLOVER_SLACK {
            self.rollover(&active, &mut guard)?;
        }

        let active_id = guard.expect("rollover always leaves an active segment");
        let active = self.open_segment(active_id);

        let relative_offset = active
            .reserve(num_blocks)
            .ok_or(Error::Validation("entry does not fit in freshly rolled segment"))?;

        if let EntryBody::Update { blkno, .. } = &head.body {
            self.fingerprints
                .lock()
                .expect("lock is poisoned")
                .entry(active_id)
                .or_insert_with(FingerprintAccumulator::new)
                .accumulate_entry(*blkno, body);
        }

        // Callers are responsible for having already set `head.id`/`head.entropy`
        // per the hash-chain invariant before calling append.
        active.write_at(
            self.device.as_ref(),
            &self.table,
            self.segment_base(active_id),
            relative_offset,
            &head,
            body,
        )?;

        let _ = self.streamer_wake.send(());

        Ok(LogId::new(active_id, bytes_to_block_units(relative_offset)))
    }

    fn rollover(&self, current: &Arc<LogSegment>, active_slot: &mut Option<SegmentId>) -> Result<()> {
        let next = self.allocate_segment()?;

        let forward = EntryHead {
            disk: crate::hash::Hash::zero(),
            parent: crate::hash::Hash::invalid(),
            id: crate::hash::Hash::invalid(),
            entropy: crate::hash::Hash::invalid(),
            body: EntryBody::Pointer {
                direction: PointerDirection::Next,
                target: LogId::new(next.id, 0),
            },
        };
        let forward_offset = current
            .reserve(0)
            .ok_or(Error::Validation("no room for forward pointer"))?;
        current.write_at(
            self.device.as_ref(),
            &self.table,
            self.segment_base(current.id),
            forward_offset,
            &forward,
            &[],
        )?;

        current.close(self.device.as_ref(), &self.table, self.segment_base(current.id))?;

        let backward = EntryHead {
            disk: crate::hash::Hash::zero(),
            parent: crate::hash::Hash::invalid(),
            id: crate::hash::Hash::invalid(),
            entropy: crate::hash::Hash::invalid(),
            body: EntryBody::Pointer {
                direction: PointerDirection::Previous,
                target: LogId::new(current.id, bytes_to_block_units(forward_offset)),
            },
        };
        let backward_offset = next
            .reserve(0)
            .ok_or(Error::Validation("no room for backward pointer"))?;
        next.write_at(
            self.device.as_ref(),
            &self.table,
            self.segment_base(next.id),
            backward_offset,
            &backward,
            &[],
        )?;

        *active_slot = Some(next.id);
        Ok(())
    }

    /// Returns the unused bitset's presence for an all-zero write, i.e. an
    /// entirely-elided body.
    #[must_use]
    pub fn empty_bitset(num_blocks: u16) -> BlockPresence {
        BlockPresence::new(num_blocks)
    }

    /// Reads a single 512-byte block directly at a range map's resolved
    /// physical position, bypassing entry framing entirely. A `LogId`
    /// produced by [`crate::range_map::RangeMap::lookup`] addresses an
    /// individual data block, not necessarily the head of the entry that
    /// wrote it, so this reads raw bytes rather than decoding an `EntryHead`.
    pub fn read_block(&self, pos: LogId) -> Result<[u8; BLOCK_SIZE]> {
        let absolute = self.table.resolve(
            crate::section::Section::LogSegments,
            self.segment_base(pos.segment()) + block_units_to_bytes(pos.block_offset()),
        );
        let mut block = [0u8; BLOCK_SIZE];
        self.device.read_at(absolute, &mut block)?;
        Ok(block)
    }

    /// Reads the entry at `id`.
    pub fn read(&self, id: LogId) -> Result<(EntryHead, Vec<u8>)> {
        let segment = self.open_segment(id.segment());
        segment.read_entry(
            self.device.as_ref(),
            &self.table,
            self.segment_base(id.segment()),
            block_units_to_bytes(id.block_offset()),
        )
    }

    /// The segment ID currently accepting appends, if any.
    #[must_use]
    pub fn active_segment(&self) -> Option<SegmentId> {
        *self.active.lock().expect("lock is poisoned")
    }

    /// Every segment ID currently allocated to this log, in ascending order.
    /// Used by the remote-log streamer's catch-up scan (§4.11) in lieu of a
    /// dedicated LSN-to-segment index.
    #[must_use]
    pub fn known_segments(&self) -> Vec<SegmentId> {
        (0..self.segment_bitmap.width() as SegmentId)
            .filter(|&id| self.segment_bitmap.is_allocated(id as usize))
            .collect()
    }

    /// Sequentially scans every entry of `segment`, from its start up to its
    /// stable end, for the segment cleaner's copy pass and for recovery's
    /// forward replay. Stops (without error) at the first position that no
    /// longer decodes as a well-formed entry, matching "first zero block =
    /// logical end".
    pub fn scan_segment(&self, segment: SegmentId) -> Vec<(u64, EntryHead, Vec<u8>)> {
        let handle = self.open_segment(segment);
        let base = self.segment_base(segment);
        let mut offset = 0u64;
        let mut out = Vec::new();

        while offset + super::entry::HEAD_SIZE as u64 <= handle.stable_end() {
            match handle.read_entry(self.device.as_ref(), &self.table, base, offset) {
                Ok((head, body)) => {
                    let entry_len = (super::entry::HEAD_SIZE + body.len()) as u64;
                    out.push((offset, head, body));
                    offset += entry_len;
                }
                Err(_) => break,
            }
        }

        out
    }

    /// The fixed segment capacity this `MetaLog` was opened with.
    #[must_use]
    pub fn segment_capacity(&self) -> u64 {
        self.segment_capacity
    }

    /// Direct handle to the underlying device, for the cleaner's output-segment
    /// writes and the checkpointer's bitmap snapshots.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// The section table this `MetaLog` resolves log offsets against.
    #[must_use]
    pub fn table(&self) -> &SectionTable {
        &self.table
    }

    /// Allocates a fresh segment for the cleaner's copy pass to write its
    /// survivors into. Unlike [`append`](Self::append)'s implicit rollover,
    /// the returned segment is never installed as `active`; the caller
    /// writes into it directly via [`write_verbatim`](Self::write_verbatim)
    /// and the checkpointer later folds it into the ordinary segment set.
    pub fn alloc_output_segment(&self) -> Result<SegmentId> {
        Ok(self.allocate_segment()?.id)
    }

    /// Writes a head and body into `segment` at its next free offset,
    /// bypassing rollover and fingerprint accumulation. Used by the segment
    /// cleaner to carry entries forward into an output segment without
    /// disturbing the live append path.
    pub fn write_verbatim(&self, segment: SegmentId, head: &EntryHead, body: &[u8]) -> Result<LogId> {
        let num_blocks = body.len() / BLOCK_SIZE;
        let handle = self.open_segment(segment);
        let relative_offset = handle
            .reserve(num_blocks)
            .ok_or(Error::Validation("gc output segment has no room for survivor"))?;
        handle.write_at(
            self.device.as_ref(),
            &self.table,
            self.segment_base(segment),
            relative_offset,
            head,
            body,
        )?;
        Ok(LogId::new(segment, bytes_to_block_units(relative_offset)))
    }

    /// Marks `segment` as the active segment directly, used by recovery to
    /// resume appending where the crashed host left off.
    pub fn resume_active(&self, segment: SegmentId) {
        let handle = self.open_segment(segment);
        handle.activate();
        *self.active.lock().expect("lock is poisoned") = Some(segment);
    }

    /// Frees a drained segment back to the allocator and drops its cached
    /// handle and fingerprint accumulator.
    pub fn free_segment(&self, segment: SegmentId) {
        self.segment_bitmap.free(segment as usize);
        self.open_segments.write().expect("lock is poisoned").remove(&segment);
        self.fingerprints.lock().expect("lock is poisoned").remove(&segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use crate::hash::Hash;

    fn update_head(disk: Hash, parent: Hash, lsn: u64, blkno: u64) -> EntryHead {
        let entropy = Hash::combine(&parent, &Hash::zero());
        let secret_id = Hash::combine(&Hash::zero(), &entropy);
        let id = secret_id.apply();
        EntryHead {
            disk,
            parent,
            id,
            entropy,
            body: EntryBody::Update {
                checksum: Hash::zero(),
                lsn,
                blkno,
                num_blocks: 0,
                slice: 0,
                slices_total: 1,
                num_parity: 0,
                bitset: BlockPresence::new(0),
            },
        }
    }

    #[test]
    fn append_then_read_round_trips() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, 4096, 4096, 64 * 1024 * 1024);
        let bitmap = Arc::new(BitmapAllocator::new(4096));
        let (tx, _rx) = mpsc::channel();

        let metalog = MetaLog::new(device, table, 16 * 1024 * 1024, bitmap, tx);

        let disk = Hash::checksum(b"disk");
        let head = update_head(disk, Hash::invalid(), 1, 0);
        let id = metalog.append(head, &[])?;

        let (read_back, body) = metalog.read(id)?;
        assert!(body.is_empty());
        match read_back.body {
            EntryBody::Update { lsn, .. } => assert_eq!(lsn, 1),
            EntryBody::Pointer { .. } => panic!("wrong variant"),
        }

        Ok(())
    }

    #[test]
    fn rollover_happens_when_segment_nearly_full() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, 4096, 4096, 64 * 1024 * 1024);
        let bitmap = Arc::new(BitmapAllocator::new(4096));
        let (tx, _rx) = mpsc::channel();

        // Tiny segments force a rollover quickly.
        let metalog = MetaLog::new(device, table, 4096, bitmap, tx);

        let disk = Hash::checksum(b"disk");
        let mut parent = Hash::invalid();
        let mut last_segment = None;
        for lsn in 0..20u64 {
            let head = update_head(disk, parent, lsn, lsn);
            let id = metalog.append(head.clone(), &[])?;
            parent = match head.body {
                EntryBody::Update { .. } => head.id,
                EntryBody::Pointer { .. } => unreachable!(),
            };
            last_segment = Some(id.segment());
        }

        assert!(last_segment.unwrap() > 0, "expected at least one rollover");
        Ok(())
    }
}
