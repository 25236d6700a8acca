// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The view-change entry body (§3): the single 512-byte data block that
//! follows a view-change [`crate::log::entry::EntryHead`], carrying the
//! replica set a volume henceforth lives on.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::hash::Hash;
use crate::id::DiskId;
use crate::log::entry::BLOCK_SIZE;
use crate::registry::MAX_VIEW_REPLICAS;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// `{view, invalidates_view, replicas[N]}`: attests that a volume now lives
/// on `replicas` under a new `secretView` (`view = apply(secretView)`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ViewChangePayload {
    /// `apply(secretView)` of the view this entry installs.
    pub view: Hash,
    /// The view this entry supersedes, or [`Hash::invalid`] at volume creation.
    pub invalidates_view: Hash,
    /// The replica set the volume lives on under `view`.
    pub replicas: Vec<DiskId>,
}

impl Encode for ViewChangePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        assert!(
            self.replicas.len() <= MAX_VIEW_REPLICAS,
            "view-change replica set exceeds the fixed on-wire slot count"
        );

        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.write_all(&self.view.to_bytes())?;
        buf.write_all(&self.invalidates_view.to_bytes())?;
        buf.write_u8(self.replicas.len() as u8)?;
        for slot in 0..MAX_VIEW_REPLICAS {
            buf.write_u64::<BigEndian>(self.replicas.get(slot).copied().unwrap_or(0))?;
        }

        buf.resize(BLOCK_SIZE, 0);
        writer.write_all(&buf)?;
        Ok(())
    }
}

impl Decode for ViewChangePayload {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut view_raw = [0u8; crate::hash::HASH_LEN];
        reader.read_exact(&mut view_raw)?;
        let mut invalidates_raw = [0u8; crate::hash::HASH_LEN];
        reader.read_exact(&mut invalidates_raw)?;

        let count = reader.read_u8()? as usize;
        if count > MAX_VIEW_REPLICAS {
            return Err(DecodeError::InvalidHeader("view-change replica count overflows its fixed slots"));
        }

        let mut replicas = Vec::with_capacity(count);
        for slot in 0..MAX_VIEW_REPLICAS {
            let id = reader.read_u64::<BigEndian>()?;
            if slot < count {
                replicas.push(id);
            }
        }

        Ok(Self {
            view: Hash::from_bytes(view_raw),
            invalidates_view: Hash::from_bytes(invalidates_raw),
            replicas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn round_trips_through_a_single_block() -> crate::Result<()> {
        let payload = ViewChangePayload {
            view: Hash::checksum(b"view"),
            invalidates_view: Hash::invalid(),
            replicas: vec![1, 2, 3],
        };

        let bytes = payload.encode_into_vec()?;
        assert_eq!(bytes.len(), BLOCK_SIZE);

        let decoded = ViewChangePayload::decode_from(&mut std::io::Cursor::new(bytes))?;
        assert_eq!(decoded, payload);

        // The genesis case this entry models: `invalidates_view` must not
        // panic on encode and must decode back as invalid rather than the
        // all-zero digest.
        assert!(!decoded.invalidates_view.is_valid());
        Ok(())
    }

    #[test]
    fn rejects_oversized_replica_count() {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[40] = (MAX_VIEW_REPLICAS + 1) as u8;
        assert!(ViewChangePayload::decode_from(&mut std::io::Cursor::new(buf)).is_err());
    }
}
