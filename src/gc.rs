// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The segment cleaner: candidate selection over an obsolescence-counter
//! max-heap, and the copy pass that rewrites surviving blocks into a fresh
//! segment.
//!
//! Candidate selection generalizes the segment engine's `GcStrategy`
//! (`SpaceAmpStrategy`/`StaleThresholdStrategy` in `gc/mod.rs` of the
//! teacher crate) from "pick by stale-byte ratio" to "pick by per-segment
//! obsolescence counter, capped at 64 candidates, abort under 5" — the same
//! pluggable-predicate shape, a different predicate.

use crate::hash::Hash;
use crate::id::{LogId, SegmentId};
use crate::log::entry::{update_checksum, BlockPresence, EntryBody, EntryHead};
use crate::log::MetaLog;
use crate::range_map::ObsolescenceSink;
use crate::Result;
use min_max_heap::MinMaxHeap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Tracks, per segment, how many of its blocks are no longer the current
/// version for their LBA — the signal the cleaner selects candidates by.
#[derive(Default)]
pub struct ObsolescenceHeap {
    counters: RwLock<HashMap<SegmentId, AtomicU64>>,
    /// Active during a GC pass: additions made by concurrent writers are
    /// re-targeted through this table so they land on the segment a block
    /// actually ends up in, rather than corrupting counts for a segment
    /// that's mid-copy.
    remap: Mutex<HashMap<SegmentId, SegmentId>>,
}

impl ObsolescenceHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total capacity (in blocks) a segment holds, used to compute the
    /// candidate-threshold fraction.
    pub fn segment_capacity_blocks(segment_bytes: u64) -> u64 {
        segment_bytes / crate::log::entry::BLOCK_SIZE as u64
    }

    fn resolve(&self, segment: SegmentId) -> SegmentId {
        self.remap
            .lock()
            .expect("lock is poisoned")
            .get(&segment)
            .copied()
            .unwrap_or(segment)
    }

    /// Current obsolescence count for `segment`.
    #[must_use]
    pub fn count(&self, segment: SegmentId) -> u64 {
        self.counters
            .read()
            .expect("lock is poisoned")
            .get(&segment)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Installs a remap so concurrent obsolescence additions against a
    /// segment currently being copied land on its replacement instead.
    pub fn begin_remap(&self, from: SegmentId, to: SegmentId) {
        self.remap.lock().expect("lock is poisoned").insert(from, to);
    }

    /// Clears a segment's counter and any remap entry once it's been freed.
    pub fn clear(&self, segment: SegmentId) {
        self.counters.write().expect("lock is poisoned").remove(&segment);
        self.remap.lock().expect("lock is poisoned").remove(&segment);
    }

    /// Selects up to `max` segments whose counter exceeds `threshold` blocks,
    /// highest obsolescence first.
    #[must_use]
    pub fn select_candidates(&self, threshold: u64, max: usize) -> Vec<(SegmentId, u64)> {
        let counters = self.counters.read().expect("lock is poisoned");
        let mut heap: MinMaxHeap<(u64, SegmentId)> = MinMaxHeap::new();

        for (&segment, counter) in counters.iter() {
            let count = counter.load(Ordering::Relaxed);
            if count > threshold {
                heap.push((count, segment));
            }
        }

        let mut out = Vec::new();
        while out.len() < max {
            match heap.pop_max() {
                Some((count, segment)) => out.push((segment, count)),
                None => break,
            }
        }
        out
    }
}

impl ObsolescenceSink for ObsolescenceHeap {
    fn add_obsolete(&self, segment: SegmentId, count: u64) {
        let segment = self.resolve(segment);
        let counters = self.counters.read().expect("lock is poisoned");
        if let Some(counter) = counters.get(&segment) {
            counter.fetch_add(count, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write().expect("lock is poisoned");
        counters
            .entry(segment)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(count, Ordering::Relaxed);
    }
}

/// Minimum number of candidates a GC pass must assemble before running;
/// below this it rolls back and sleeps, per §4.9.
pub const MIN_CANDIDATES: usize = 5;

/// Upper bound on candidates collected into a single GC pass.
pub const MAX_CANDIDATES: usize = 64;

/// Result of one GC copy pass: which segments are now fully drained (and so
/// may be freed) and the old-position -> new-position remap the caller must
/// batch-apply to every affected volume's range map.
#[derive(Debug, Default)]
pub struct GcPassReport {
    /// Segments whose live blocks were fully copied out and may be freed.
    pub drained_segments: Vec<SegmentId>,
    /// Count of blocks carried forward into the output segment.
    pub blocks_copied: u64,
    /// Count of blocks dropped because the range map no longer pointed at
    /// them (i.e. they were stale by the time the copy pass reached them).
    pub blocks_dropped: u64,
}

/// Told whether a given `(disk, blkno)`'s range-map entry still points at a
/// candidate position, so the copy pass knows whether to carry a block
/// forward or drop it as stale. Implemented by [`crate::host::Host`], which
/// consults the owning `VDisk`'s range map; kept as a trait here so this
/// module doesn't depend on `vdisk`.
pub trait LiveBlockOracle: Send + Sync {
    /// Returns `true` if `disk`'s range map still points `blkno` at `pos`.
    fn is_current(&self, disk: &Hash, blkno: u64, pos: LogId) -> bool;
}

/// Records that range-map entries pointing at `old` must be rewritten to
/// point at `new`, applied in a batch by the caller after a copy pass.
#[derive(Debug, Clone, Copy)]
pub struct PositionRemap {
    /// Volume the remapped entry belongs to.
    pub disk: Hash,
    /// Logical block address the entry covers.
    pub blkno: u64,
    /// Position before the copy.
    pub old: LogId,
    /// Position after the copy.
    pub new: LogId,
}

/// Drains candidate segments into a single freshly-allocated output segment,
/// keeping only blocks the range map still considers current.
///
/// Pointer entries are copied through verbatim; sibling pointer entries in
/// *other* segments that target a moved pointer entry are not rewritten
/// in-place by this pass (see `DESIGN.md`'s note on the journal-before-patch
/// open question) — the caller is expected to journal the remap (the
/// returned `Vec<PositionRemap>`) before applying it, which is the
/// crash-safe half of the two-step protocol.
pub fn run_copy_pass(
    metalog: &MetaLog,
    oracle: &dyn LiveBlockOracle,
    obsolescence: &ObsolescenceHeap,
    candidates: &[(SegmentId, u64)],
    output_segment: SegmentId,
) -> Result<(GcPassReport, Vec<PositionRemap>)> {
    let mut report = GcPassReport::default();
    let mut remaps = Vec::new();

    for &(segment, _count) in candidates {
        obsolescence.begin_remap(segment, output_segment);

        for (offset, head, body) in metalog.scan_segment(segment) {
            let old_pos = LogId::new(segment, (offset / crate::log::entry::BLOCK_SIZE as u64) as u16);

            match &head.body {
                EntryBody::Pointer { .. } => {
                    let new_pos = metalog.write_verbatim(output_segment, &head, &body)?;
                    remaps.push(PositionRemap {
                        disk: head.disk,
                        blkno: u64::MAX,
                        old: old_pos,
                        new: new_pos,
                    });
                }
                EntryBody::Update { blkno, num_blocks, bitset, lsn, .. } => {
                    let mut surviving_body = Vec::new();
                    let mut surviving_bitset = BlockPresence::new(*num_blocks);
                    let mut body_cursor = 0usize;

                    for i in 0..*num_blocks {
                        if !bitset.is_present(i) {
                            continue;
                        }
                        let block = &body[body_cursor * crate::log::entry::BLOCK_SIZE
                            ..(body_cursor + 1) * crate::log::entry::BLOCK_SIZE];
                        body_cursor += 1;

                        if oracle.is_current(&head.disk, blkno + u64::from(i), old_pos) {
                            surviving_bitset.set_present(i);
                            surviving_body.extend_from_slice(block);
                            report.blocks_copied += 1;
                        } else {
                            report.blocks_dropped += 1;
                        }
                    }

                    if surviving_bitset.popcount() == 0 {
                        continue;
                    }

                    let checksum = update_checksum(*lsn, *blkno, *num_blocks, &surviving_body, &surviving_bitset);
                    let new_head = EntryHead {
                        disk: head.disk,
                        parent: head.parent,
                        id: head.id,
                        entropy: head.entropy,
                        body: EntryBody::Update {
                            checksum,
                            lsn: *lsn,
                            blkno: *blkno,
                            num_blocks: *num_blocks,
                            slice: 0,
                            slices_total: 1,
                            num_parity: 0,
                            bitset: surviving_bitset,
                        },
                    };

                    let new_pos = metalog.write_verbatim(output_segment, &new_head, &surviving_body)?;
                    remaps.push(PositionRemap { disk: head.disk, blkno: *blkno, old: old_pos, new: new_pos });
                }
            }
        }
    }

    report.drained_segments = candidates.iter().map(|(s, _)| *s).collect();
    Ok((report, remaps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, FileDevice};
    use crate::hash::Hash;
    use crate::section::SectionTable;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use test_log::test;

    /// Treats every block in `current` as current and everything else as
    /// stale, regardless of which position it's at.
    struct FixedOracle {
        current: Mutex<HashSet<(Hash, u64)>>,
    }

    impl LiveBlockOracle for FixedOracle {
        fn is_current(&self, disk: &Hash, blkno: u64, _pos: LogId) -> bool {
            self.current.lock().expect("lock is poisoned").contains(&(*disk, blkno))
        }
    }

    fn update_head(disk: Hash, lsn: u64, blkno: u64, block: u8) -> (EntryHead, Vec<u8>) {
        let bitset = BlockPresence::new(1);
        let mut bitset = bitset;
        bitset.set_present(0);
        let body = vec![block; crate::log::entry::BLOCK_SIZE];
        let checksum = update_checksum(lsn, blkno, 1, &body, &bitset);
        let head = EntryHead {
            disk,
            parent: Hash::invalid(),
            id: Hash::checksum(format!("id{lsn}").as_bytes()),
            entropy: Hash::invalid(),
            body: EntryBody::Update {
                checksum,
                lsn,
                blkno,
                num_blocks: 1,
                slice: 0,
                slices_total: 1,
                num_parity: 0,
                bitset,
            },
        };
        (head, body)
    }

    #[test]
    fn copy_pass_drops_stale_blocks_and_keeps_current_ones() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, 4096, 4096, 64 * 1024 * 1024);
        let bitmap = Arc::new(crate::alloc::BitmapAllocator::new(64));
        let (tx, _rx) = mpsc::channel();
        let metalog = MetaLog::new(Arc::clone(&device), table, 16 * 1024 * 1024, bitmap, tx);

        let disk = Hash::checksum(b"disk");
        let (head_live, body_live) = update_head(disk, 1, 10, 0xAA);
        let (head_stale, body_stale) = update_head(disk, 2, 20, 0xBB);

        let live_pos = metalog.append(head_live, &body_live)?;
        let _stale_pos = metalog.append(head_stale, &body_stale)?;
        let segment = live_pos.segment();

        let oracle = FixedOracle {
            current: Mutex::new([(disk, 10u64)].into_iter().collect()),
        };
        let obsolescence = ObsolescenceHeap::new();
        let output = metalog.alloc_output_segment()?;

        let (report, remaps) =
            run_copy_pass(&metalog, &oracle, &obsolescence, &[(segment, 1)], output)?;

        assert_eq!(report.blocks_copied, 1);
        assert_eq!(report.blocks_dropped, 1);
        assert_eq!(report.drained_segments, vec![segment]);

        let live_remap = remaps.iter().find(|r| r.blkno == 10).expect("blkno 10 survived");
        assert_eq!(live_remap.disk, disk);
        assert!(remaps.iter().all(|r| r.blkno != 20), "stale blkno 20 should not appear in remap");

        let (_, surviving_body) = metalog.read(live_remap.new)?;
        assert_eq!(surviving_body, body_live);

        Ok(())
    }

    #[test]
    fn selects_candidates_above_threshold_highest_first() {
        let heap = ObsolescenceHeap::new();
        heap.add_obsolete(1, 100);
        heap.add_obsolete(2, 500);
        heap.add_obsolete(3, 50);

        let candidates = heap.select_candidates(60, 64);
        assert_eq!(candidates.first().map(|(s, _)| *s), Some(2));
        assert!(candidates.iter().all(|(_, count)| *count > 60));
    }

    #[test]
    fn remap_redirects_concurrent_additions() {
        let heap = ObsolescenceHeap::new();
        heap.begin_remap(1, 2);
        heap.add_obsolete(1, 10);

        assert_eq!(heap.count(1), 0);
        assert_eq!(heap.count(2), 10);
    }

    #[test]
    fn clear_drops_counter_and_remap() {
        let heap = ObsolescenceHeap::new();
        heap.add_obsolete(5, 3);
        heap.clear(5);
        assert_eq!(heap.count(5), 0);
    }

    #[test]
    fn below_min_candidates_yields_fewer_than_threshold() {
        let heap = ObsolescenceHeap::new();
        heap.add_obsolete(1, 10_000);
        let candidates = heap.select_candidates(5_000, MAX_CANDIDATES);
        assert!(candidates.len() < MIN_CANDIDATES);
    }
}
