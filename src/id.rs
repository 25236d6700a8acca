// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};
use std::sync::{atomic::AtomicU64, Arc};

/// Maximum number of segments a single disk may hold (`0x1000`)
pub const MAX_NUM_SEGMENTS: u64 = 0x1000;

/// Identifies a log segment on a single disk.
#[allow(clippy::module_name_repetitions)]
pub type SegmentId = u64;

/// Identifies a physical disk taking part in a replica set.
#[allow(clippy::module_name_repetitions)]
pub type DiskId = u64;

/// Sentinel [`LogId`] bit pattern meaning "no location" (all-ones, as in the
/// reference layout where an unset 64-bit field reads back as `!0`).
const INVALID: u64 = u64::MAX;

const BLOCK_OFFSET_BITS: u32 = 16;
const BLOCK_OFFSET_MASK: u64 = (1 << BLOCK_OFFSET_BITS) - 1;

/// Packed `{segment: 48, block_offset: 16}` address of a record within a disk's log.
///
/// This is the on-disk pointer format used throughout the B-tree, checkpoint and
/// pointer-record machinery: 48 bits of segment number leave room for far more
/// segments than [`MAX_NUM_SEGMENTS`] ever allows in one generation, and the low
/// 16 bits address a block within that segment.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LogId(u64);

impl std::fmt::Debug for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "LogId(invalid)")
        } else {
            write!(
                f,
                "LogId(segment={}, block_offset={})",
                self.segment(),
                self.block_offset()
            )
        }
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::invalid()
    }
}

impl LogId {
    /// The out-of-band sentinel meaning "this pointer is unset".
    #[must_use]
    pub fn invalid() -> Self {
        Self(INVALID)
    }

    /// Packs a segment number and in-segment block offset into a single `LogId`.
    ///
    /// # Panics
    ///
    /// Panics if `block_offset` does not fit in 16 bits.
    #[must_use]
    pub fn new(segment: SegmentId, block_offset: u16) -> Self {
        assert!(
            segment >> (64 - BLOCK_OFFSET_BITS) == 0,
            "segment number does not fit in 48 bits"
        );
        Self((segment << BLOCK_OFFSET_BITS) | u64::from(block_offset))
    }

    /// `true` if this is the [`LogId::invalid`] sentinel.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.0 == INVALID
    }

    /// The segment number component.
    #[must_use]
    pub fn segment(&self) -> SegmentId {
        self.0 >> BLOCK_OFFSET_BITS
    }

    /// The in-segment block offset component.
    #[must_use]
    pub fn block_offset(&self) -> u16 {
        (self.0 & BLOCK_OFFSET_MASK) as u16
    }

    /// The packed representation, as stored on disk.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Reconstructs a `LogId` from its packed on-disk representation.
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl Encode for LogId {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        use byteorder::{BigEndian, WriteBytesExt};
        writer.write_u64::<BigEndian>(self.0)?;
        Ok(())
    }
}

impl Decode for LogId {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        use byteorder::{BigEndian, ReadBytesExt};
        Ok(Self(reader.read_u64::<BigEndian>()?))
    }
}

/// Monotonic ID generator shared between threads, used to hand out fresh
/// segment IDs as the log rolls over.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Default)]
pub struct IdGenerator(Arc<AtomicU64>);

impl std::ops::Deref for IdGenerator {
    type Target = Arc<AtomicU64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IdGenerator {
    /// Creates a generator that will hand out `start` as its first ID.
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    /// Atomically hands out the next ID.
    pub fn next(&self) -> SegmentId {
        self.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn invalid_round_trips() {
        assert!(LogId::invalid().is_invalid());
    }

    #[test]
    fn pack_unpack() {
        let id = LogId::new(1234, 56);
        assert_eq!(id.segment(), 1234);
        assert_eq!(id.block_offset(), 56);
        assert!(!id.is_invalid());
    }

    #[test]
    fn encode_decode_round_trip() -> crate::Result<()> {
        let id = LogId::new(42, 7);
        let bytes = id.encode_into_vec()?;
        let mut cursor = std::io::Cursor::new(bytes);
        assert_eq!(LogId::decode_from(&mut cursor)?, id);
        Ok(())
    }

    #[test]
    fn id_generator_monotonic() {
        let gen = IdGenerator::new(5);
        assert_eq!(gen.next(), 5);
        assert_eq!(gen.next(), 6);
        assert_eq!(gen.next(), 7);
    }
}
