// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The fixed-size paged node format shared by every B-tree this crate keeps
//! (the super-tree, the range map, the fingerprint bank tree): a 20-byte
//! SHA-1 of the remainder of the block, a monotone generation, an element
//! count, a leaf flag, child pointers, and packed key/value entries.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::hash::{Hash, HASH_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size in bytes of one paged tree node (`8 * 4096`).
pub const TREE_BLOCK_SIZE: usize = 8 * 4096;

/// Width of the node-slot bitmap (`TREE_MAX_BLOCKS`).
pub const TREE_MAX_BLOCKS: usize = 2048;

/// Index of a node's slot within the paged-tree disk region.
pub type DiskBlock = u64;

const HEADER_LEN: usize = HASH_LEN + 8 /* generation */ + 4 /* count */ + 1 /* leaf */;

/// A value that can be packed into a fixed-width on-disk representation,
/// as every B-tree key/value this crate stores must be.
pub trait FixedWidth: Encode + Decode + Clone + Ord {
    /// Number of bytes this type always occupies on the wire.
    const ENCODED_LEN: usize;
}

impl FixedWidth for u64 {
    const ENCODED_LEN: usize = 8;
}

impl Encode for u64 {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(*self)?;
        Ok(())
    }
}

impl Decode for u64 {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(reader.read_u64::<BigEndian>()?)
    }
}

impl FixedWidth for Hash {
    const ENCODED_LEN: usize = HASH_LEN;
}

/// A fixed-size 32 KiB B-tree node: either a leaf (keys paired with values)
/// or an internal node (keys used only for routing, paired with `n+1`
/// children).
#[derive(Clone, Debug)]
pub struct Node<K: FixedWidth, V: FixedWidth> {
    /// Monotonically increasing generation, bumped on every copy-on-write.
    pub generation: u64,
    /// Routing keys, always sorted ascending.
    pub keys: Vec<K>,
    /// Present (and meaningful) only for leaves; `values.len() == keys.len()`.
    pub values: Vec<V>,
    /// Present (and meaningful) only for internal nodes;
    /// `children.len() == keys.len() + 1`.
    pub children: Vec<DiskBlock>,
}

impl<K: FixedWidth, V: FixedWidth> Node<K, V> {
    /// The maximum number of routing keys a node of this type can hold,
    /// derived from `(node_size - header) / (child_ptr + key + value)`.
    #[must_use]
    pub fn branching_factor() -> usize {
        let per_leaf_entry = K::ENCODED_LEN + V::ENCODED_LEN;
        let per_internal_entry = K::ENCODED_LEN + 8;
        let entry_size = per_leaf_entry.max(per_internal_entry);
        (TREE_BLOCK_SIZE - HEADER_LEN) / entry_size
    }

    /// Creates an empty leaf node.
    #[must_use]
    pub fn empty_leaf(generation: u64) -> Self {
        Self {
            generation,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// `true` if this node has no children, i.e. is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// `true` if this node holds the maximum number of keys it can.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.keys.len() >= Self::branching_factor()
    }
}

impl<K: FixedWidth, V: FixedWidth> Encode for Node<K, V> {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut body = Vec::with_capacity(TREE_BLOCK_SIZE - HASH_LEN);

        body.write_u64::<BigEndian>(self.generation)?;
        body.write_u32::<BigEndian>(self.keys.len() as u32)?;
        body.write_u8(u8::from(self.is_leaf()))?;

        for key in &self.keys {
            key.encode_into(&mut body)?;
        }

        if self.is_leaf() {
            for value in &self.values {
                value.encode_into(&mut body)?;
            }
        } else {
            for child in &self.children {
                body.write_u64::<BigEndian>(*child)?;
            }
        }

        assert!(
            body.len() + HASH_LEN <= TREE_BLOCK_SIZE,
            "node contents overflowed the fixed block size"
        );
        body.resize(TREE_BLOCK_SIZE - HASH_LEN, 0);

        let checksum = Hash::checksum(&body);
        writer.write_all(checksum.raw())?;
        writer.write_all(&body)?;

        Ok(())
    }
}

impl<K: FixedWidth, V: FixedWidth> Decode for Node<K, V> {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut checksum_bytes = [0u8; HASH_LEN];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = Hash::from_raw(checksum_bytes);

        let mut body = vec![0u8; TREE_BLOCK_SIZE - HASH_LEN];
        reader.read_exact(&mut body)?;

        if Hash::checksum(&body) != expected {
            return Err(DecodeError::InvalidHeader("paged tree node checksum mismatch"));
        }

        let mut cursor = std::io::Cursor::new(&body[..]);
        let generation = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let leaf = cursor.read_u8()? != 0;

        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(K::decode_from(&mut cursor)?);
        }

        let mut values = Vec::new();
        let mut children = Vec::new();
        if leaf {
            for _ in 0..count {
                values.push(V::decode_from(&mut cursor)?);
            }
        } else {
            for _ in 0..=count {
                children.push(cursor.read_u64::<BigEndian>()?);
            }
        }

        Ok(Self {
            generation,
            keys,
            values,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn leaf_round_trips() -> crate::Result<()> {
        let mut node: Node<u64, u64> = Node::empty_leaf(1);
        node.keys = vec![1, 2, 3];
        node.values = vec![10, 20, 30];

        let bytes = node.encode_into_vec()?;
        assert_eq!(bytes.len(), TREE_BLOCK_SIZE);

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded: Node<u64, u64> = Node::decode_from(&mut cursor)?;
        assert!(decoded.is_leaf());
        assert_eq!(decoded.keys, vec![1, 2, 3]);
        assert_eq!(decoded.values, vec![10, 20, 30]);

        Ok(())
    }

    #[test]
    fn internal_round_trips() -> crate::Result<()> {
        let node: Node<u64, u64> = Node {
            generation: 2,
            keys: vec![5, 9],
            values: Vec::new(),
            children: vec![100, 200, 300],
        };

        let bytes = node.encode_into_vec()?;
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded: Node<u64, u64> = Node::decode_from(&mut cursor)?;
        assert!(!decoded.is_leaf());
        assert_eq!(decoded.children, vec![100, 200, 300]);

        Ok(())
    }

    #[test]
    fn corrupted_checksum_is_rejected() -> crate::Result<()> {
        let node: Node<u64, u64> = Node::empty_leaf(0);
        let mut bytes = node.encode_into_vec()?;
        bytes[HASH_LEN + 20] ^= 0xFF;

        let mut cursor = std::io::Cursor::new(bytes);
        let result: Result<Node<u64, u64>, _> = Node::decode_from(&mut cursor);
        assert!(result.is_err());

        Ok(())
    }
}
