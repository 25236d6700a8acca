// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-segment content fingerprints used as deduplication hints.
//!
//! Every block written is hashed; one in sixteen (selected by the low nibble
//! of the hash's first byte) is retained as a 40-bit sample and filed into a
//! van-Emde-Boas-like bank tree keyed by the low byte of the sample. A sealed
//! segment's bank is merged crate-wide so the cleaner can find segments with
//! high block overlap. This is only ever a hint: a bounded hash table of
//! full-length digests is consulted before any range-map redirection is ever
//! written on the strength of a fingerprint match.

use crate::hash::Hash;
use crate::id::SegmentId;
use std::collections::HashMap;
use std::sync::Mutex;

const SAMPLE_MASK: u8 = 0x0F;
const SAMPLE_SELECTOR: u8 = 0x00;

/// A 40-bit sampled fingerprint, the top bits of a block's SHA-1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Sample(u64);

impl Sample {
    fn from_hash(hash: &Hash) -> Self {
        let raw = hash.raw();
        let mut bytes = [0u8; 8];
        bytes[3..8].copy_from_slice(&raw[0..5]);
        Self(u64::from_be_bytes(bytes))
    }

    /// The bank index this sample files under: its low byte.
    #[must_use]
    pub fn bank(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// Per-segment sampled-fingerprint accumulator, fed one block at a time as a
/// segment is written.
#[derive(Default)]
pub struct FingerprintAccumulator {
    /// `blkno -> sample`, only for blocks selected by the 1-in-16 subsample.
    samples: HashMap<u64, Sample>,
}

impl FingerprintAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a written update entry's body into the accumulator, sampling its
    /// 512-byte blocks.
    pub fn accumulate_entry(&mut self, first_blkno: u64, body: &[u8]) {
        for (i, chunk) in body.chunks(crate::log::entry::BLOCK_SIZE).enumerate() {
            let hash = Hash::checksum(chunk);
            if hash.raw()[0] & SAMPLE_MASK == SAMPLE_SELECTOR {
                self.samples
                    .insert(first_blkno + i as u64, Sample::from_hash(&hash));
            }
        }
    }

    /// Samples collected so far.
    #[must_use]
    pub fn samples(&self) -> impl Iterator<Item = (&u64, &Sample)> {
        self.samples.iter()
    }
}

/// A van-Emde-Boas-like nested bank tree: 256 banks keyed by a sample's low
/// byte, each holding the `(segment, blkno)` locations that produced a
/// matching sample. Crate-wide, shared across all sealed segments.
#[derive(Default)]
pub struct BankTree {
    banks: Mutex<[Vec<(Sample, SegmentId, u64)>; 256]>,
}

impl BankTree {
    /// Creates an empty bank tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            banks: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Merges a sealed segment's accumulated samples into the shared tree.
    pub fn merge(&self, segment: SegmentId, accumulator: &FingerprintAccumulator) {
        let mut banks = self.banks.lock().expect("lock is poisoned");
        for (blkno, sample) in accumulator.samples() {
            banks[sample.bank() as usize].push((*sample, segment, *blkno));
        }
    }

    /// Finds candidate `(segment, blkno)` locations whose sample matches.
    #[must_use]
    pub fn lookup(&self, sample: Sample) -> Vec<(SegmentId, u64)> {
        self.banks.lock().expect("lock is poisoned")[sample.bank() as usize]
            .iter()
            .filter(|(s, ..)| *s == sample)
            .map(|(_, seg, blkno)| (*seg, *blkno))
            .collect()
    }

    /// Returns segment pairs whose bank overlap exceeds `min_overlap` samples,
    /// a hint for dedup-aware compaction ordering.
    #[must_use]
    pub fn overlapping_segment_pairs(&self, min_overlap: usize) -> Vec<(SegmentId, SegmentId, usize)> {
        let banks = self.banks.lock().expect("lock is poisoned");
        let mut overlap: HashMap<(SegmentId, SegmentId), usize> = HashMap::new();

        for bank in banks.iter() {
            for i in 0..bank.len() {
                for j in (i + 1)..bank.len() {
                    let (sample_a, seg_a, _) = bank[i];
                    let (sample_b, seg_b, _) = bank[j];
                    if sample_a == sample_b && seg_a != seg_b {
                        let key = if seg_a < seg_b { (seg_a, seg_b) } else { (seg_b, seg_a) };
                        *overlap.entry(key).or_insert(0) += 1;
                    }
                }
            }
        }

        overlap
            .into_iter()
            .filter(|(_, count)| *count >= min_overlap)
            .map(|((a, b), count)| (a, b, count))
            .collect()
    }
}

/// Bounded, pseudo-LRU hash table of full-length digests, consulted before
/// a fingerprint match is trusted enough to redirect a range-map entry.
pub struct HashDb {
    capacity: usize,
    entries: Mutex<HashMap<Hash, (SegmentId, u64)>>,
    order: Mutex<std::collections::VecDeque<Hash>>,
}

/// Default capacity of a [`HashDb`]: 2^18 entries.
pub const DEFAULT_HASH_DB_CAPACITY: usize = 1 << 18;

impl HashDb {
    /// Creates an empty hash-DB bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Records that `hash` was last seen at `(segment, blkno)`, evicting the
    /// oldest entry if the table is full.
    pub fn record(&self, hash: Hash, location: (SegmentId, u64)) {
        let mut entries = self.entries.lock().expect("lock is poisoned");
        let mut order = self.order.lock().expect("lock is poisoned");

        if !entries.contains_key(&hash) && entries.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            }
        }

        entries.insert(hash, location);
        order.push_back(hash);
    }

    /// Looks up the last known location of a full-length digest, confirming
    /// a fingerprint-bank hint before anything is redirected on its strength.
    #[must_use]
    pub fn confirm(&self, hash: &Hash) -> Option<(SegmentId, u64)> {
        self.entries.lock().expect("lock is poisoned").get(hash).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn subsamples_roughly_one_in_sixteen() {
        let mut acc = FingerprintAccumulator::new();
        let body: Vec<u8> = (0..256u32)
            .flat_map(|i| vec![i as u8; crate::log::entry::BLOCK_SIZE])
            .collect();
        acc.accumulate_entry(0, &body);
        assert!(acc.samples.len() < 256);
    }

    #[test]
    fn bank_tree_finds_overlap() {
        let tree = BankTree::new();
        let mut a = FingerprintAccumulator::new();
        let mut b = FingerprintAccumulator::new();

        let block = vec![0x07u8; crate::log::entry::BLOCK_SIZE];
        a.accumulate_entry(0, &block);
        b.accumulate_entry(100, &block);

        tree.merge(1, &a);
        tree.merge(2, &b);

        if !a.samples.is_empty() {
            let pairs = tree.overlapping_segment_pairs(1);
            assert!(pairs.iter().any(|(x, y, _)| (*x, *y) == (1, 2)));
        }
    }

    #[test]
    fn hash_db_evicts_oldest_when_full() {
        let db = HashDb::with_capacity(2);
        db.record(Hash::checksum(b"a"), (0, 0));
        db.record(Hash::checksum(b"b"), (0, 1));
        db.record(Hash::checksum(b"c"), (0, 2));

        assert!(db.confirm(&Hash::checksum(b"a")).is_none());
        assert!(db.confirm(&Hash::checksum(b"c")).is_some());
    }
}
