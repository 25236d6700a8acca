// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host configuration.
///
/// Built with a fluent builder, then consumed by [`crate::host::Host::open`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the backing disk file.
    pub(crate) path: PathBuf,

    /// Size of a log segment, in bytes.
    pub(crate) segment_size_bytes: u64,

    /// Number of node slots in the paged B-tree cache.
    pub(crate) node_cache_capacity: u64,

    /// Capacity, in bytes, of the in-memory value cache fronting the log.
    pub(crate) blob_cache_capacity_bytes: u64,

    /// Number of peers a write-quorum round must hear back from.
    pub(crate) replica_fan_out: usize,

    /// Threshold of agreeing peers required for a quorum round to succeed.
    pub(crate) quorum_threshold: usize,

    /// Maximum number of times a transient I/O error is retried before the
    /// host panics rather than silently losing an acknowledged write.
    pub(crate) max_io_retries: u32,

    /// Obsolescence-counter fraction of segment capacity at which a segment
    /// becomes a GC candidate.
    pub(crate) gc_candidate_threshold: f64,

    /// Upper bound on candidates collected into a single GC pass.
    pub(crate) gc_max_candidates: usize,

    /// Minimum number of candidates a GC pass must assemble before running;
    /// below this it rolls back and sleeps.
    pub(crate) gc_min_candidates: usize,

    /// How long a socket-driven component waits before considering a peer dead.
    pub(crate) peer_timeout: Duration,

    /// Number of 16 MiB segments the log region is sized to hold.
    ///
    /// Bounds the physical file size; [`crate::id::MAX_NUM_SEGMENTS`] is the
    /// hard on-disk-format ceiling this must stay under.
    pub(crate) max_segments: u64,

    /// Byte size of the paged B-tree region shared by every volume's range
    /// map and the super-tree registry.
    pub(crate) btree_region_bytes: u64,

    /// Byte size reserved for the fingerprint bank-tree region.
    ///
    /// Unused by this crate today: [`crate::fingerprint::BankTree`] and
    /// [`crate::fingerprint::HashDb`] are in-memory-only hints rebuilt from
    /// sealed segments at open time (see `DESIGN.md`), so this is reserved
    /// layout space rather than a region this crate writes through.
    pub(crate) veb_region_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cloudfs.disk"),
            segment_size_bytes: 16 * 1_024 * 1_024,
            node_cache_capacity: 2048,
            blob_cache_capacity_bytes: 64 * 1_024 * 1_024,
            replica_fan_out: 3,
            quorum_threshold: 3,
            max_io_retries: 50,
            gc_candidate_threshold: 0.2,
            gc_max_candidates: 64,
            gc_min_candidates: 5,
            peer_timeout: Duration::from_secs(5),
            max_segments: 64,
            btree_region_bytes: crate::btree::TREE_BLOCK_SIZE as u64 * 4096,
            veb_region_bytes: 4096,
        }
    }
}

impl Config {
    /// Creates a configuration pointed at `path`, with every other value defaulted.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Sets the target size of a log segment.
    ///
    /// Default = 16 MiB, matching the on-disk layout fixed in the original format.
    #[must_use]
    pub fn segment_size_bytes(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    /// Sets the number of node slots kept warm in the paged B-tree cache.
    #[must_use]
    pub fn node_cache_capacity(mut self, slots: u64) -> Self {
        self.node_cache_capacity = slots;
        self
    }

    /// Sets the byte capacity of the in-memory blob/value cache.
    #[must_use]
    pub fn blob_cache_capacity_bytes(mut self, bytes: u64) -> Self {
        self.blob_cache_capacity_bytes = bytes;
        self
    }

    /// Sets how many peers a write-quorum round fans a head out to.
    #[must_use]
    pub fn replica_fan_out(mut self, n: usize) -> Self {
        self.replica_fan_out = n;
        self
    }

    /// Sets the number of agreeing peers a quorum round requires.
    #[must_use]
    pub fn quorum_threshold(mut self, n: usize) -> Self {
        self.quorum_threshold = n;
        self
    }

    /// Sets the retry bound for transient I/O errors before the host panics.
    #[must_use]
    pub fn max_io_retries(mut self, n: u32) -> Self {
        self.max_io_retries = n;
        self
    }

    /// Sets the obsolescence-counter fraction (of segment capacity) at which
    /// a segment becomes a GC candidate.
    #[must_use]
    pub fn gc_candidate_threshold(mut self, fraction: f64) -> Self {
        self.gc_candidate_threshold = fraction;
        self
    }

    /// Sets the peer round-trip timeout used by the streamer and quorum client.
    #[must_use]
    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Sets the maximum number of log segments the disk's log region holds.
    #[must_use]
    pub fn max_segments(mut self, n: u64) -> Self {
        self.max_segments = n;
        self
    }

    /// Sets the byte size of the shared paged B-tree region.
    #[must_use]
    pub fn btree_region_bytes(mut self, bytes: u64) -> Self {
        self.btree_region_bytes = bytes;
        self
    }
}
