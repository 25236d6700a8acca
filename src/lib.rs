// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A distributed, log-structured block-storage engine.
//!
//! Each volume (a [`vdisk::VDisk`]) is a hash-chained append-only log of
//! writes, synchronously replicated across a small, operator-chosen set of
//! hosts by a write-quorum protocol ([`quorum`]). A host ([`host::Host`])
//! owns a single on-disk device: a shared segment log ([`log`]) that every
//! volume interleaves its entries into, a paged copy-on-write B-tree store
//! ([`btree`]) that backs both the per-volume LBA index ([`range_map`]) and
//! the disk-id registry ([`registry`]), and a double-buffered checkpoint
//! ([`checkpoint`]) that lets recovery skip replaying the log from genesis.
//!
//! Space is reclaimed by an online segment cleaner ([`gc`]) guided by a
//! sampled-fingerprint dedup hint ([`fingerprint`]) and an obsolescence heap
//! that tracks how much of each segment is still live.
//!
//! Hosts talk to each other and to clients over a minimal HTTP/1.1 wire
//! protocol ([`wire`], routed by [`host`]'s server loop), used both for
//! ordinary block reads/writes and for one host streaming another's log tail
//! to catch a lagging replica up ([`streamer`] serving, [`replicator`]
//! following).
//!
//! # Example usage
//!
//! ```no_run
//! use cloudfs::{Config, Host, InMemoryPeerDirectory};
//! use std::sync::Arc;
//!
//! # fn main() -> cloudfs::Result<()> {
//! # let folder = tempfile::tempdir()?;
//! let config = Config::new(folder.path().join("disk"));
//! let peers = Arc::new(InMemoryPeerDirectory::default());
//! let host = Host::open(config, 1, peers)?;
//!
//! let disks = host.new_disks(1)?;
//! let (base_id, _secret) = disks[0];
//!
//! host.write(&base_id, 0, &[0u8; 512])?;
//! let block = host.read(&base_id, 0, 1)?;
//! assert_eq!(block, vec![0u8; 512]);
//! #
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod alloc;
mod btree;
mod checkpoint;
mod coding;
mod config;
mod device;
mod error;
mod fingerprint;
mod gc;
mod hash;
mod host;
mod id;
mod log;
mod peer;
mod quorum;
mod range_map;
mod registry;
mod replicator;
mod section;
mod streamer;
mod vdisk;
mod version;
mod viewchange;
mod wire;

#[doc(hidden)]
pub mod server;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    alloc::BitmapAllocator,
    config::Config,
    device::{BlockDevice, FileDevice},
    error::{Error, Result},
    gc::GcPassReport,
    hash::Hash,
    host::Host,
    id::{DiskId, LogId, SegmentId},
    peer::{InMemoryPeerDirectory, PeerDirectory},
    vdisk::VDisk,
    version::Version,
};

#[doc(hidden)]
pub use {
    range_map::{RangeEntry, RangeMap},
    registry::VDiskMeta,
    wire::Request,
};
