// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bitmap allocators for log segments and paged B-tree node slots.

use std::sync::Mutex;

/// A fixed-width bitmap allocator: `alloc` linearly scans for the first
/// clear bit, sets it and returns the index; `free` clears a bit.
///
/// Node-slot frees are deferred by callers until the next checkpoint commits,
/// so a freed slot is never handed back out while a not-yet-persisted
/// checkpoint still points at its old contents; this type only implements the
/// bitmap mechanics, not the deferral policy.
pub struct BitmapAllocator {
    bits: Mutex<fixedbitset::FixedBitSet>,
    width: usize,
}

/// Minimal fixed-width bitset, avoiding a dependency the rest of the crate's
/// pack does not otherwise pull in.
mod fixedbitset {
    #[derive(Clone)]
    pub struct FixedBitSet {
        words: Vec<u64>,
        len: usize,
    }

    impl FixedBitSet {
        pub fn with_capacity(len: usize) -> Self {
            Self {
                words: vec![0u64; len.div_ceil(64)],
                len,
            }
        }

        pub fn is_set(&self, index: usize) -> bool {
            (self.words[index / 64] >> (index % 64)) & 1 == 1
        }

        pub fn set(&mut self, index: usize, value: bool) {
            let word = &mut self.words[index / 64];
            if value {
                *word |= 1 << (index % 64);
            } else {
                *word &= !(1 << (index % 64));
            }
        }

        pub fn first_clear(&self) -> Option<usize> {
            (0..self.len).find(|&i| !self.is_set(i))
        }

        pub fn count_ones(&self) -> usize {
            (0..self.len).filter(|&i| self.is_set(i)).count()
        }

        pub fn as_bytes(&self) -> Vec<u8> {
            self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
        }

        pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
            let words = bytes
                .chunks(8)
                .map(|chunk| {
                    let mut arr = [0u8; 8];
                    arr[..chunk.len()].copy_from_slice(chunk);
                    u64::from_le_bytes(arr)
                })
                .collect();
            Self { words, len }
        }
    }
}

/// Error returned when a bitmap has no clear bits left.
#[derive(Debug)]
pub struct ExhaustedError;

impl std::fmt::Display for ExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bitmap allocator exhausted")
    }
}

impl std::error::Error for ExhaustedError {}

impl BitmapAllocator {
    /// Creates an allocator over `width` slots, all initially free.
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            bits: Mutex::new(fixedbitset::FixedBitSet::with_capacity(width)),
            width,
        }
    }

    /// Restores an allocator from a previously-persisted bitmap.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], width: usize) -> Self {
        Self {
            bits: Mutex::new(fixedbitset::FixedBitSet::from_bytes(bytes, width)),
            width,
        }
    }

    /// Allocates and returns the first clear index, marking it set.
    pub fn alloc(&self) -> Result<usize, ExhaustedError> {
        let mut bits = self.bits.lock().expect("lock is poisoned");
        let index = bits.first_clear().ok_or(ExhaustedError)?;
        bits.set(index, true);
        Ok(index)
    }

    /// Marks `index` as free.
    pub fn free(&self, index: usize) {
        self.bits.lock().expect("lock is poisoned").set(index, false);
    }

    /// Returns `true` if `index` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.bits.lock().expect("lock is poisoned").is_set(index)
    }

    /// Number of currently-allocated slots.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.bits.lock().expect("lock is poisoned").count_ones()
    }

    /// Total width of the bitmap.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Serializes the bitmap for inclusion in a checkpoint.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.lock().expect("lock is poisoned").as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn allocates_first_clear_bit() {
        let alloc = BitmapAllocator::new(8);
        assert_eq!(alloc.alloc().expect("room"), 0);
        assert_eq!(alloc.alloc().expect("room"), 1);
        alloc.free(0);
        assert_eq!(alloc.alloc().expect("room"), 0);
    }

    #[test]
    fn exhausts_cleanly() {
        let alloc = BitmapAllocator::new(2);
        alloc.alloc().expect("room");
        alloc.alloc().expect("room");
        assert!(alloc.alloc().is_err());
    }

    #[test]
    fn round_trips_through_bytes() {
        let alloc = BitmapAllocator::new(128);
        alloc.alloc().expect("room");
        alloc.alloc().expect("room");
        alloc.free(0);

        let restored = BitmapAllocator::from_bytes(&alloc.to_bytes(), 128);
        assert!(!restored.is_allocated(0));
        assert!(restored.is_allocated(1));
    }
}
