// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A single 16 MiB append-only log segment.

use crate::coding::{Decode, Encode};
use crate::device::BlockDevice;
use crate::id::SegmentId;
use crate::log::entry::{EntryHead, BLOCK_SIZE, HEAD_SIZE};
use crate::section::{Section, SectionTable};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A segment's lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentMode {
    /// Unallocated, available to become the next appendable segment.
    Free,
    /// The single segment new writes are reserved against.
    Appendable,
    /// Closed and read-only; safe for the cleaner to consider.
    Sealed,
}

/// Tracks in-flight reservations so the segment's "stable end" only advances
/// once every earlier reservation's write has completed, giving readers a
/// linearisable view even though writes may complete out of order.
struct StableEnd {
    stable: AtomicU64,
    in_flight: Mutex<BTreeSet<u64>>,
}

impl StableEnd {
    fn new(start: u64) -> Self {
        Self {
            stable: AtomicU64::new(start),
            in_flight: Mutex::new(BTreeSet::new()),
        }
    }

    fn reserve(&self, offset: u64) {
        self.in_flight.lock().expect("lock is poisoned").insert(offset);
    }

    /// Called when the write that reserved `offset` (and covers up through
    /// `end`) completes; advances the stable end past any now-contiguous
    /// prefix of completed reservations.
    fn complete(&self, offset: u64, end: u64) {
        let mut in_flight = self.in_flight.lock().expect("lock is poisoned");
        in_flight.remove(&offset);

        let mut stable = self.stable.load(Ordering::Acquire);
        if offset == stable {
            stable = end;
            while let Some(&next) = in_flight.iter().next() {
                if next <= stable {
                    in_flight.remove(&next);
                } else {
                    break;
                }
            }
            self.stable.store(stable, Ordering::Release);
        }
    }

    fn get(&self) -> u64 {
        self.stable.load(Ordering::Acquire)
    }
}

/// A single 16 MiB region of the physical log.
pub struct LogSegment {
    pub(crate) id: SegmentId,
    capacity: u64,
    cursor: AtomicU64,
    stable_end: StableEnd,
    mode: Mutex<SegmentMode>,
}

impl LogSegment {
    /// Creates a fresh, empty segment of `capacity` bytes.
    #[must_use]
    pub fn new(id: SegmentId, capacity: u64) -> Self {
        Self {
            id,
            capacity,
            cursor: AtomicU64::new(0),
            stable_end: StableEnd::new(0),
            mode: Mutex::new(SegmentMode::Free),
        }
    }

    /// Marks this segment as the single current appendable segment.
    pub fn activate(&self) {
        *self.mode.lock().expect("lock is poisoned") = SegmentMode::Appendable;
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn mode(&self) -> SegmentMode {
        *self.mode.lock().expect("lock is poisoned")
    }

    /// Bytes remaining before this segment is full.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    /// Reserves space for a head plus `num_body_blocks` body blocks via a
    /// lock-free fetch-add, without writing anything yet.
    ///
    /// Returns the reserved relative offset, or `None` if it would not fit.
    pub fn reserve(&self, num_body_blocks: usize) -> Option<u64> {
        let len = (HEAD_SIZE + num_body_blocks * BLOCK_SIZE) as u64;
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            if current + len > self.capacity {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.stable_end.reserve(current);
                    return Some(current);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Appends a head and body at a previously [`reserve`](Self::reserve)d
    /// relative offset, writing through `device` at `section`'s absolute
    /// base, then advances the stable end.
    #[allow(clippy::too_many_arguments)]
    pub fn write_at(
        &self,
        device: &dyn BlockDevice,
        table: &SectionTable,
        base: u64,
        relative_offset: u64,
        head: &EntryHead,
        body: &[u8],
    ) -> Result<()> {
        let absolute = table.resolve(Section::LogSegments, base + relative_offset);

        let mut buf = head.encode_into_vec()?;
        buf.extend_from_slice(body);
        device.write_at(absolute, &buf)?;

        let end = relative_offset + buf.len() as u64;
        self.stable_end.complete(relative_offset, end);

        Ok(())
    }

    /// Reads past the stable end returns zeros rather than unstable data; this
    /// reports how far a reader may safely read.
    #[must_use]
    pub fn stable_end(&self) -> u64 {
        self.stable_end.get()
    }

    /// Reads the entry head and body at `relative_offset`, given the body's
    /// expected block count.
    pub fn read_entry(
        &self,
        device: &dyn BlockDevice,
        table: &SectionTable,
        base: u64,
        relative_offset: u64,
    ) -> Result<(EntryHead, Vec<u8>)> {
        if relative_offset + HEAD_SIZE as u64 > self.stable_end() {
            return Err(Error::Validation("read past stable end of segment"));
        }

        let absolute = table.resolve(Section::LogSegments, base + relative_offset);
        let mut head_buf = [0u8; HEAD_SIZE];
        device.read_at(absolute, &mut head_buf)?;

        let mut cursor = std::io::Cursor::new(&head_buf[..]);
        let head = EntryHead::decode_from(&mut cursor)?;

        let body_len = head.body_block_count() * BLOCK_SIZE;
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            device.read_at(absolute + HEAD_SIZE as u64, &mut body)?;
        }

        Ok((head, body))
    }

    /// Pads the remainder of the segment with zeros and seals it, so recovery
    /// can rely on "first zero block = logical end" when scanning forward.
    pub fn close(&self, device: &dyn BlockDevice, table: &SectionTable, base: u64) -> Result<()> {
        let cursor = self.cursor.load(Ordering::Acquire);
        let remaining = self.capacity - cursor;
        if remaining > 0 {
            let zeros = vec![0u8; remaining as usize];
            let absolute = table.resolve(Section::LogSegments, base + cursor);
            device.write_at(absolute, &zeros)?;
        }
        *self.mode.lock().expect("lock is poisoned") = SegmentMode::Sealed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use crate::hash::Hash;
    use crate::id::LogId;
    use crate::log::entry::{BlockPresence, EntryBody, PointerDirection};
    use test_log::test;

    fn pointer_head() -> EntryHead {
        EntryHead {
            disk: Hash::checksum(b"d"),
            parent: Hash::invalid(),
            id: Hash::checksum(b"id"),
            entropy: Hash::checksum(b"e"),
            body: EntryBody::Pointer {
                direction: PointerDirection::Next,
                target: LogId::invalid(),
            },
        }
    }

    #[test]
    fn reserve_then_write_then_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let device = FileDevice::open(&dir.path().join("disk"), 3)?;
        let table = SectionTable::new(4096, 4096, 4096, 16 * 1024 * 1024);

        let segment = LogSegment::new(0, 16 * 1024 * 1024);
        segment.activate();

        let offset = segment.reserve(0).expect("room");
        segment.write_at(&device, &table, 0, offset, &pointer_head(), &[])?;

        assert_eq!(segment.stable_end(), HEAD_SIZE as u64);

        let (head, body) = segment.read_entry(&device, &table, 0, offset)?;
        assert!(body.is_empty());
        match head.body {
            EntryBody::Pointer { direction, .. } => assert_eq!(direction, PointerDirection::Next),
            EntryBody::Update { .. } => panic!("wrong variant"),
        }

        Ok(())
    }

    #[test]
    fn out_of_order_completion_still_advances_stable_end_in_order() {
        let segment = LogSegment::new(0, 16 * 1024 * 1024);
        segment.activate();

        let a = segment.reserve(0).expect("room");
        let b = segment.reserve(0).expect("room");

        // complete b first; stable end must not advance past a yet
        segment.stable_end.complete(b, b + HEAD_SIZE as u64);
        assert_eq!(segment.stable_end(), 0);

        segment.stable_end.complete(a, a + HEAD_SIZE as u64);
        assert_eq!(segment.stable_end(), b + HEAD_SIZE as u64);
    }

    #[test]
    fn reserve_fails_when_segment_full() {
        let segment = LogSegment::new(0, HEAD_SIZE as u64);
        segment.activate();
        assert!(segment.reserve(0).is_some());
        assert!(segment.reserve(0).is_none());
    }

    #[test]
    fn close_pads_with_zeros() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let device = FileDevice::open(&dir.path().join("disk"), 3)?;
        let table = SectionTable::new(4096, 4096, 4096, 16 * 1024 * 1024);

        let segment = LogSegment::new(0, 2 * HEAD_SIZE as u64);
        segment.activate();
        let offset = segment.reserve(0).expect("room");
        segment.write_at(&device, &table, 0, offset, &pointer_head(), &[])?;

        segment.close(&device, &table, 0)?;
        assert_eq!(segment.mode(), SegmentMode::Sealed);

        let mut tail = vec![0xffu8; HEAD_SIZE];
        device.read_at(table.resolve(Section::LogSegments, HEAD_SIZE as u64), &mut tail)?;
        assert!(tail.iter().all(|&b| b == 0));

        Ok(())
    }
}
