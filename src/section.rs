// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Disk section table: translates the six typed regions of a CloudFS disk
//! into absolute byte offsets.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::version::MAGIC_BYTES;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Logical alignment every section offset and I/O is rounded to.
pub const BLOCK_SIZE: u64 = 512;

/// Bounds the addressable span of the paged-tree region:
/// `TREE_BLOCK_SIZE * TREE_MAX_BLOCKS`.
pub const MAX_FILE_SIZE: u64 = crate::btree::TREE_BLOCK_SIZE as u64 * crate::btree::TREE_MAX_BLOCKS as u64;

/// One of the six typed regions of a CloudFS disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Section {
    /// The fixed disk header, containing the magic and the section table itself.
    Header = 0,
    /// Checkpoint slot A.
    CheckpointA = 1,
    /// Checkpoint slot B.
    CheckpointB = 2,
    /// Paged copy-on-write B-tree region.
    BTree = 3,
    /// Fingerprint / dedup bank-tree region.
    VebTree = 4,
    /// Append-only log segment region.
    LogSegments = 5,
}

impl Section {
    const ALL: [Self; 6] = [
        Self::Header,
        Self::CheckpointA,
        Self::CheckpointB,
        Self::BTree,
        Self::VebTree,
        Self::LogSegments,
    ];

    fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u32 == value)
    }
}

/// A `{type, offset}` row of the on-disk section table.
#[derive(Clone, Copy, Debug)]
struct SectionEntry {
    kind: Section,
    offset: u64,
}

impl Encode for SectionEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.kind as u32)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        Ok(())
    }
}

impl Decode for SectionEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u32::<BigEndian>()?;
        let offset = reader.read_u64::<BigEndian>()?;
        let kind = Section::from_u32(tag).ok_or(DecodeError::InvalidTag(("Section", tag as u8)))?;
        Ok(Self { kind, offset })
    }
}

/// Resolves `(Section, relative_offset)` into absolute disk offsets.
///
/// Built once at format time (or recovered by reading the header) and shared
/// read-only for the life of the host.
#[derive(Debug, Clone)]
pub struct SectionTable {
    entries: [u64; 6],
    lengths: [u64; 6],
}

impl SectionTable {
    /// Lays out a fresh section table for a disk of `log_bytes` of segment
    /// space, `checkpoint_slot_bytes` per checkpoint slot, `btree_bytes` of
    /// paged-tree space and `veb_bytes` of fingerprint-bank space.
    #[must_use]
    pub fn new(checkpoint_slot_bytes: u64, btree_bytes: u64, veb_bytes: u64, log_bytes: u64) -> Self {
        let header_bytes = align_up(MAGIC_BYTES.len() as u64 + 1 + (6 * (4 + 8)), BLOCK_SIZE);
        let checkpoint_slot_bytes = align_up(checkpoint_slot_bytes, BLOCK_SIZE);
        let btree_bytes = align_up(btree_bytes, BLOCK_SIZE);
        let veb_bytes = align_up(veb_bytes, BLOCK_SIZE);

        let header_off = 0;
        let ckpt_a_off = header_off + header_bytes;
        let ckpt_b_off = ckpt_a_off + checkpoint_slot_bytes;
        let btree_off = ckpt_b_off + checkpoint_slot_bytes;
        let veb_off = btree_off + btree_bytes;
        let log_off = veb_off + veb_bytes;

        Self {
            entries: [header_off, ckpt_a_off, ckpt_b_off, btree_off, veb_off, log_off],
            lengths: [header_bytes, checkpoint_slot_bytes, checkpoint_slot_bytes, btree_bytes, veb_bytes, log_bytes],
        }
    }

    /// Returns the absolute start offset of `section`.
    #[must_use]
    pub fn offset_of(&self, section: Section) -> u64 {
        self.entries[section as usize]
    }

    /// Returns the byte length reserved for `section`.
    #[must_use]
    pub fn length_of(&self, section: Section) -> u64 {
        self.lengths[section as usize]
    }

    /// Resolves a relative offset within `section` into an absolute disk offset.
    #[must_use]
    pub fn resolve(&self, section: Section, relative_offset: u64) -> u64 {
        self.offset_of(section) + relative_offset
    }
}

impl Encode for SectionTable {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        for section in Section::ALL {
            SectionEntry {
                kind: section,
                offset: self.entries[section as usize],
            }
            .encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for SectionTable {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("bad disk magic"));
        }

        let mut entries = [0u64; 6];
        let mut lengths = [0u64; 6];
        let mut rows = Vec::with_capacity(6);
        for _ in 0..6 {
            rows.push(SectionEntry::decode_from(reader)?);
        }
        rows.sort_by_key(|r| r.offset);
        for (i, row) in rows.iter().enumerate() {
            entries[row.kind as usize] = row.offset;
            let next_offset = rows.get(i + 1).map_or(row.offset, |r| r.offset);
            lengths[row.kind as usize] = next_offset.saturating_sub(row.offset);
        }

        Ok(Self { entries, lengths })
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sections_are_monotonically_increasing() {
        let table = SectionTable::new(4096, 32 * 1024 * 2048, 4096 * 64, 16 * 1024 * 1024 * 10);
        let offsets: Vec<u64> = Section::ALL.iter().map(|s| table.offset_of(*s)).collect();
        for pair in offsets.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn encode_decode_round_trip() -> crate::Result<()> {
        let table = SectionTable::new(4096, 65536, 4096, 16 * 1024 * 1024);
        let bytes = table.encode_into_vec()?;
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = SectionTable::decode_from(&mut cursor)?;
        assert_eq!(decoded.offset_of(Section::LogSegments), table.offset_of(Section::LogSegments));
        Ok(())
    }
}
