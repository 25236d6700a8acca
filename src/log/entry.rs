// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk log entry framing.
//!
//! Unlike the rest of this crate's on-disk and on-wire structures, which
//! follow `byteorder::BigEndian` (the segment-store convention this crate is
//! built in the style of), the log entry head is bit-exact with the packed,
//! little-endian layout the wire-compatibility contract pins, so this module
//! uses `byteorder::LittleEndian` throughout.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::hash::Hash;
use crate::id::LogId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size in bytes of a log entry head, body blocks excluded.
pub const HEAD_SIZE: usize = 512;

/// Size in bytes of a single data block following an update head.
pub const BLOCK_SIZE: usize = 512;

/// The logical block number reserved for view-change entries.
pub const METADATA_BLOCK: u64 = u64::MAX;

const TAG_POINTER: u32 = 1;
const TAG_UPDATE: u32 = 2;

const DIRECTION_PREV: u16 = 1;
const DIRECTION_NEXT: u16 = 2;

/// Direction of a pointer record, letting recovery traverse segments across
/// non-contiguous physical locations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerDirection {
    /// Points at the segment preceding this one in temporal order.
    Previous,
    /// Points at the segment following this one in temporal order.
    Next,
}

/// A bitset marking which of an update's logical blocks are physically
/// present in the entry body; all-zero blocks are elided entirely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockPresence(Vec<u8>);

impl BlockPresence {
    /// Builds a presence bitset for `num_blocks`, all initially absent.
    #[must_use]
    pub fn new(num_blocks: u16) -> Self {
        Self(vec![0u8; (usize::from(num_blocks)).div_ceil(8)])
    }

    /// Marks block `i` as present.
    pub fn set_present(&mut self, i: u16) {
        let i = usize::from(i);
        self.0[i / 8] |= 1 << (i % 8);
    }

    /// Returns `true` if block `i` is marked present.
    #[must_use]
    pub fn is_present(&self, i: u16) -> bool {
        let i = usize::from(i);
        (self.0[i / 8] >> (i % 8)) & 1 == 1
    }

    /// Number of blocks physically present in the body.
    #[must_use]
    pub fn popcount(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Number of bytes the bitset occupies on the wire.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.0.len()
    }
}

/// The tag-discriminated payload of a log entry head.
#[derive(Clone, Debug)]
pub enum EntryBody {
    /// Links a segment to its temporal neighbour.
    Pointer {
        /// Which neighbour this points at.
        direction: PointerDirection,
        /// The neighbouring segment's boundary position.
        target: LogId,
    },
    /// A data or view-change write.
    Update {
        /// SHA-1 over `{lsn, blkno, num_blocks, body, bitset}`.
        checksum: Hash,
        /// Monotone per-volume sequence number.
        lsn: u64,
        /// Starting logical block address (or [`METADATA_BLOCK`]).
        blkno: u64,
        /// Logical block count this entry covers.
        num_blocks: u16,
        /// This fragment's index, for multi-part writes.
        slice: u16,
        /// Total fragments in this write.
        slices_total: u16,
        /// Parity fragment count, for erasure-coded writes.
        num_parity: u16,
        /// Which logical blocks are physically present in the body.
        bitset: BlockPresence,
    },
}

/// A complete log entry head: tag-independent chain fields plus the
/// tag-discriminated [`EntryBody`].
#[derive(Clone, Debug)]
pub struct EntryHead {
    /// Base id of the volume this entry belongs to.
    pub disk: Hash,
    /// Hash-chain parent of this entry.
    pub parent: Hash,
    /// This entry's own chain id, `apply(secret_id)`.
    pub id: Hash,
    /// Rolling entropy hash folded into the next entry's secret derivation.
    pub entropy: Hash,
    /// Tag-discriminated payload.
    pub body: EntryBody,
}

impl EntryHead {
    /// Number of 512-byte body blocks following this head: `popcount(bitset)`
    /// for update entries, zero for pointer entries.
    #[must_use]
    pub fn body_block_count(&self) -> usize {
        match &self.body {
            EntryBody::Pointer { .. } => 0,
            EntryBody::Update { bitset, .. } => bitset.popcount(),
        }
    }
}

/// Writes a chain hash via [`Hash::to_bytes`], not the panicking
/// [`Hash::raw`]: `parent`/`id`/`entropy` are legitimately [`Hash::invalid`]
/// for pointer records and a volume's genesis entry.
fn write_hash<W: Write>(writer: &mut W, hash: &Hash) -> Result<(), EncodeError> {
    writer.write_all(&hash.to_bytes())?;
    Ok(())
}

fn read_hash<R: Read>(reader: &mut R) -> Result<Hash, DecodeError> {
    let mut raw = [0u8; crate::hash::HASH_LEN];
    reader.read_exact(&mut raw)?;
    Ok(Hash::from_bytes(raw))
}

impl Encode for EntryHead {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut buf = Vec::with_capacity(HEAD_SIZE);

        match &self.body {
            EntryBody::Pointer { .. } => buf.write_u32::<LittleEndian>(TAG_POINTER)?,
            EntryBody::Update { .. } => buf.write_u32::<LittleEndian>(TAG_UPDATE)?,
        }

        write_hash(&mut buf, &self.disk)?;
        write_hash(&mut buf, &self.parent)?;
        write_hash(&mut buf, &self.id)?;
        write_hash(&mut buf, &self.entropy)?;

        match &self.body {
            EntryBody::Pointer { direction, target } => {
                buf.write_u16::<LittleEndian>(match direction {
                    PointerDirection::Previous => DIRECTION_PREV,
                    PointerDirection::Next => DIRECTION_NEXT,
                })?;
                buf.write_u64::<LittleEndian>(target.as_u64())?;
            }
            EntryBody::Update {
                checksum,
                lsn,
                blkno,
                num_blocks,
                slice,
                slices_total,
                num_parity,
                bitset,
            } => {
                write_hash(&mut buf, checksum)?;
                buf.write_u64::<LittleEndian>(*lsn)?;
                buf.write_u64::<LittleEndian>(*blkno)?;
                buf.write_u16::<LittleEndian>(*num_blocks)?;
                buf.write_u16::<LittleEndian>(*slice)?;
                buf.write_u16::<LittleEndian>(*slices_total)?;
                buf.write_u16::<LittleEndian>(*num_parity)?;
                buf.write_u16::<LittleEndian>(0)?; // unused
                buf.extend_from_slice(&bitset.0);
            }
        }

        assert!(buf.len() <= HEAD_SIZE, "log entry head overflowed 512 bytes");
        buf.resize(HEAD_SIZE, 0);
        writer.write_all(&buf)?;

        Ok(())
    }
}

impl Decode for EntryHead {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; HEAD_SIZE];
        reader.read_exact(&mut buf)?;
        let mut cursor = std::io::Cursor::new(&buf[..]);

        let tag = cursor.read_u32::<LittleEndian>()?;
        let disk = read_hash(&mut cursor)?;
        let parent = read_hash(&mut cursor)?;
        let id = read_hash(&mut cursor)?;
        let entropy = read_hash(&mut cursor)?;

        let body = match tag {
            TAG_POINTER => {
                let direction = match cursor.read_u16::<LittleEndian>()? {
                    DIRECTION_PREV => PointerDirection::Previous,
                    DIRECTION_NEXT => PointerDirection::Next,
                    other => {
                        return Err(DecodeError::InvalidTag(("PointerDirection", other as u8)))
                    }
                };
                let target = LogId::from_u64(cursor.read_u64::<LittleEndian>()?);
                EntryBody::Pointer { direction, target }
            }
            TAG_UPDATE => {
                let checksum = read_hash(&mut cursor)?;
                let lsn = cursor.read_u64::<LittleEndian>()?;
                let blkno = cursor.read_u64::<LittleEndian>()?;
                let num_blocks = cursor.read_u16::<LittleEndian>()?;
                let slice = cursor.read_u16::<LittleEndian>()?;
                let slices_total = cursor.read_u16::<LittleEndian>()?;
                let num_parity = cursor.read_u16::<LittleEndian>()?;
                let _unused = cursor.read_u16::<LittleEndian>()?;

                let bitset_len = (usize::from(num_blocks)).div_ceil(8);
                let mut bitset_bytes = vec![0u8; bitset_len];
                cursor.read_exact(&mut bitset_bytes)?;

                EntryBody::Update {
                    checksum,
                    lsn,
                    blkno,
                    num_blocks,
                    slice,
                    slices_total,
                    num_parity,
                    bitset: BlockPresence(bitset_bytes),
                }
            }
            other => return Err(DecodeError::InvalidTag(("EntryHead", other as u8))),
        };

        Ok(Self {
            disk,
            parent,
            id,
            entropy,
            body,
        })
    }
}

/// Computes the checksum an update entry's head should carry:
/// SHA-1 over `{lsn, blkno, num_blocks, body, bitset}`.
#[must_use]
pub fn update_checksum(lsn: u64, blkno: u64, num_blocks: u16, body: &[u8], bitset: &BlockPresence) -> Hash {
    let mut buf = Vec::with_capacity(8 + 8 + 2 + body.len() + bitset.0.len());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&blkno.to_le_bytes());
    buf.extend_from_slice(&num_blocks.to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&bitset.0);
    Hash::checksum(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pointer_entry_round_trip() -> crate::Result<()> {
        let entry = EntryHead {
            disk: Hash::checksum(b"disk"),
            parent: Hash::invalid(),
            id: Hash::checksum(b"id"),
            entropy: Hash::checksum(b"entropy"),
            body: EntryBody::Pointer {
                direction: PointerDirection::Next,
                target: LogId::new(3, 7),
            },
        };

        let bytes = entry.encode_into_vec()?;
        assert_eq!(bytes.len(), HEAD_SIZE);

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = EntryHead::decode_from(&mut cursor)?;

        // The whole point of this case: an invalid chain field must not
        // panic on encode and must decode back as invalid, not as the
        // all-zero digest.
        assert!(!decoded.parent.is_valid());
        assert_eq!(decoded.disk, entry.disk);
        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.entropy, entry.entropy);

        match decoded.body {
            EntryBody::Pointer { direction, target } => {
                assert_eq!(direction, PointerDirection::Next);
                assert_eq!(target, LogId::new(3, 7));
            }
            EntryBody::Update { .. } => panic!("wrong variant"),
        }

        Ok(())
    }

    #[test]
    fn update_entry_round_trip_with_bitset() -> crate::Result<()> {
        let mut bitset = BlockPresence::new(4);
        bitset.set_present(0);
        bitset.set_present(3);

        let entry = EntryHead {
            disk: Hash::checksum(b"disk"),
            parent: Hash::checksum(b"parent"),
            id: Hash::checksum(b"id"),
            entropy: Hash::checksum(b"entropy"),
            body: EntryBody::Update {
                checksum: Hash::checksum(b"body"),
                lsn: 42,
                blkno: 1024,
                num_blocks: 4,
                slice: 0,
                slices_total: 1,
                num_parity: 0,
                bitset,
            },
        };

        let bytes = entry.encode_into_vec()?;
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = EntryHead::decode_from(&mut cursor)?;

        match decoded.body {
            EntryBody::Update {
                lsn, blkno, bitset, ..
            } => {
                assert_eq!(lsn, 42);
                assert_eq!(blkno, 1024);
                assert!(bitset.is_present(0));
                assert!(!bitset.is_present(1));
                assert!(bitset.is_present(3));
                assert_eq!(bitset.popcount(), 2);
            }
            EntryBody::Pointer { .. } => panic!("wrong variant"),
        }

        Ok(())
    }

    #[test]
    fn all_zero_block_bitset_elides_blocks() {
        let bitset = BlockPresence::new(8);
        assert_eq!(bitset.popcount(), 0);
    }
}
