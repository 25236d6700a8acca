// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The host: the single process that owns one backing disk file, every
//! volume opened against it, and the collaborators (checkpointer, cleaner,
//! super-tree, peer directory) that keep them all consistent.
//!
//! This is the crate's top-level assembly point, the way the segment engine's
//! `ValueLog` ties together a manifest, an index, a blob cache and a set of
//! segment writers. `Host` plays the same role for a disk's section table,
//! bitmaps, log, range maps and super-tree.

use crate::alloc::BitmapAllocator;
use crate::btree::cache::NodeCache;
use crate::btree::node::DiskBlock;
use crate::checkpoint::Checkpointer;
use crate::coding::{Decode, Encode};
use crate::config::Config;
use crate::gc::{self, GcPassReport, LiveBlockOracle, ObsolescenceHeap, PositionRemap};
use crate::hash::Hash;
use crate::id::DiskId;
use crate::log::entry::EntryBody;
use crate::log::MetaLog;
use crate::peer::PeerDirectory;
use crate::range_map::{RangeEntry, RangeMap};
use crate::registry::{Registry, VDiskMeta};
use crate::section::SectionTable;
use crate::vdisk::VDisk;
use crate::version::Version;
use crate::{device::BlockDevice, device::FileDevice, Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex, RwLock};

/// Everything a single backing disk needs to operate: its section layout,
/// bitmaps, log, range-map/super-tree node cache, open volumes, and
/// replication collaborators.
pub struct Host {
    config: Config,
    device: Arc<dyn BlockDevice>,
    table: SectionTable,

    segment_bitmap: Arc<BitmapAllocator>,
    /// Shared by every tree this host keeps (every volume's range map, and
    /// the super-tree): they all live in one [`crate::section::Section::BTree`]
    /// region, so one allocator governs the whole region.
    node_bitmap: Arc<BitmapAllocator>,

    range_map_cache: Arc<NodeCache<u64, RangeEntry>>,
    registry_cache: Arc<NodeCache<Hash, VDiskMeta>>,

    metalog: Arc<MetaLog>,
    checkpointer: Checkpointer,
    obsolescence: Arc<ObsolescenceHeap>,
    registry: Mutex<Registry>,

    disks: RwLock<HashMap<Hash, Arc<VDisk>>>,
    peers: Arc<dyn PeerDirectory>,

    /// This host's own id within a replica set (the id peers address it as).
    host_id: DiskId,

    /// `(disk, peer_host_id)` pairs a [`crate::replicator`] worker has
    /// already been spawned for, so a replica re-announcing its view via a
    /// repeated `PUT /log` doesn't pile up redundant follow connections.
    following: Mutex<HashSet<(Hash, DiskId)>>,

    /// Woken whenever a write appends, so a remote streamer's live-attach
    /// phase learns promptly; cloned into every [`VDisk`] via its own
    /// independent mpsc pair, not shared here (see `vdisk::VDisk::attach_stream`).
    _flusher_wake: mpsc::Sender<()>,
}

impl Host {
    /// Opens (creating if necessary) the disk at `config.path`, recovering
    /// from the latest valid checkpoint and replaying its log tail if one is
    /// found, or formatting a fresh disk otherwise.
    pub fn open(config: Config, host_id: DiskId, peers: Arc<dyn PeerDirectory>) -> Result<Self> {
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&config.path, config.max_io_retries)?);

        let checkpoint_slot_bytes = 64 * 1024;
        let table = SectionTable::new(
            checkpoint_slot_bytes,
            config.btree_region_bytes,
            config.veb_region_bytes,
            config.segment_size_bytes * config.max_segments,
        );

        let range_map_cache = Arc::new(NodeCache::with_capacity(config.node_cache_capacity));
        let registry_cache = Arc::new(NodeCache::with_capacity(config.node_cache_capacity));
        let obsolescence = Arc::new(ObsolescenceHeap::new());

        let segment_width = config.max_segments as usize;
        let node_width = (config.btree_region_bytes / crate::btree::TREE_BLOCK_SIZE as u64) as usize;

        let (streamer_wake_tx, streamer_wake_rx) = mpsc::channel();
        // Recovery never needs to observe wakeups before any volume is open,
        // so the receiver is dropped rather than stored; `MetaLog` only needs
        // a live sender to send into.
        drop(streamer_wake_rx);

        match Checkpointer::recover(device.as_ref(), &table) {
            Some(record) => {
                let segment_bitmap =
                    Arc::new(BitmapAllocator::from_bytes(&record.segment_bitmap, record.segment_bitmap_width));
                let node_bitmap = Arc::new(BitmapAllocator::from_bytes(&record.node_bitmap, record.node_bitmap_width));

                for (segment, count) in &record.obsolescence {
                    obsolescence.add_obsolete(*segment, *count);
                }

                let metalog = Arc::new(MetaLog::new(
                    Arc::clone(&device),
                    table.clone(),
                    config.segment_size_bytes,
                    Arc::clone(&segment_bitmap),
                    streamer_wake_tx.clone(),
                ));
                metalog.resume_active(record.log_end.segment());

                let registry = Registry::open(
                    Arc::clone(&device),
                    table.clone(),
                    Arc::clone(&registry_cache),
                    Arc::clone(&node_bitmap),
                    record.super_tree_root,
                )?;

                let checkpointer = Checkpointer::new(Arc::clone(&device), table.clone(), record.generation);

                let mut host = Self {
                    config,
                    device,
                    table,
                    segment_bitmap,
                    node_bitmap,
                    range_map_cache,
                    registry_cache,
                    metalog,
                    checkpointer,
                    obsolescence,
                    registry: Mutex::new(registry),
                    disks: RwLock::new(HashMap::new()),
                    peers,
                    host_id,
                    following: Mutex::new(HashSet::new()),
                    _flusher_wake: streamer_wake_tx,
                };

                host.rebuild_volumes_from_registry()?;
                host.replay_log_tail(record.log_end.segment())?;

                Ok(host)
            }
            None => {
                let mut header = Vec::new();
                Version::V1.write_file_header(&mut header)?;
                header.resize(table.length_of(crate::section::Section::Header) as usize, 0);
                crate::device::write_section(device.as_ref(), &table, crate::section::Section::Header, 0, &header)?;

                let segment_bitmap = Arc::new(BitmapAllocator::new(segment_width));
                let node_bitmap = Arc::new(BitmapAllocator::new(node_width));

                let metalog = Arc::new(MetaLog::new(
                    Arc::clone(&device),
                    table.clone(),
                    config.segment_size_bytes,
                    Arc::clone(&segment_bitmap),
                    streamer_wake_tx.clone(),
                ));

                let registry = Registry::open(
                    Arc::clone(&device),
                    table.clone(),
                    Arc::clone(&registry_cache),
                    Arc::clone(&node_bitmap),
                    DiskBlock::MAX,
                )?;

                let checkpointer = Checkpointer::new(Arc::clone(&device), table.clone(), 0);

                Ok(Self {
                    config,
                    device,
                    table,
                    segment_bitmap,
                    node_bitmap,
                    range_map_cache,
                    registry_cache,
                    metalog,
                    checkpointer,
                    obsolescence,
                    registry: Mutex::new(registry),
                    disks: RwLock::new(HashMap::new()),
                    peers,
                    host_id,
                    following: Mutex::new(HashSet::new()),
                    _flusher_wake: streamer_wake_tx,
                })
            }
        }
    }

    /// Rebuilds every [`VDisk`] the super-tree remembers, opening each
    /// volume's range map at its recorded root. Run once at the start of
    /// recovery, before the log tail replay corrects heads/LSNs that moved
    /// past the last checkpoint.
    fn rebuild_volumes_from_registry(&mut self) -> Result<()> {
        let entries = self.registry.get_mut().expect("lock is poisoned").all()?;
        let mut disks = self.disks.write().expect("lock is poisoned");

        for (base_id, meta) in entries {
            let range_map = RangeMap::open(
                Arc::clone(&self.device),
                self.table.clone(),
                Arc::clone(&self.range_map_cache),
                Arc::clone(&self.node_bitmap),
                meta.root,
                Arc::clone(&self.obsolescence) as Arc<dyn crate::range_map::ObsolescenceSink>,
                self.metalog_flusher_wake(),
            )?;

            let vdisk = Arc::new(VDisk::from_recovered(
                base_id,
                Arc::clone(&self.metalog),
                range_map,
                meta.head,
                meta.entropy,
                meta.lsn,
                meta.view,
            ));
            disks.insert(base_id, vdisk);
        }

        Ok(())
    }

    /// A fresh sender the flusher thread wakes on; every range map gets its
    /// own pair since none of this crate's current range-map flush paths
    /// block on it (`RangeMap::insert` only fires it as a hint).
    fn metalog_flusher_wake(&self) -> mpsc::Sender<()> {
        let (tx, _rx) = mpsc::channel();
        tx
    }

    /// Replays every entry past the last checkpoint's `log_end`, per §4.8:
    /// scans every known segment's tail (stopping at `log_end`'s segment
    /// unless later segments exist from an in-flight rollover) and folds each
    /// `Update` entry into its volume's in-memory head/LSN/range-map state,
    /// stopping per-disk at the first entry whose `parent` does not chain
    /// from that disk's current head.
    fn replay_log_tail(&self, resume_segment: crate::id::SegmentId) -> Result<()> {
        let mut segments: Vec<_> = self.metalog.known_segments().into_iter().filter(|&s| s >= resume_segment).collect();
        segments.sort_unstable();

        let disks = self.disks.read().expect("lock is poisoned");

        for segment in segments {
            for (offset, head, body) in self.metalog.scan_segment(segment) {
                let EntryBody::Update { lsn, blkno, num_blocks, bitset, .. } = &head.body else {
                    continue;
                };

                let Some(vdisk) = disks.get(&head.disk) else {
                    continue;
                };

                if head.parent != vdisk.head() || *lsn != vdisk.lsn() {
                    // Not a continuation of this volume's recovered head:
                    // either already captured by the checkpoint, or a torn
                    // write past the last fully-acknowledged entry.
                    continue;
                }

                let head_pos = crate::id::LogId::new(segment, (offset / crate::log::entry::BLOCK_SIZE as u64) as u16);
                vdisk.replay_committed(head_pos, head.id, head.entropy, *lsn, *blkno, *num_blocks, bitset, &body)?;
            }
        }

        Ok(())
    }

    /// This host's id.
    #[must_use]
    pub fn host_id(&self) -> DiskId {
        self.host_id
    }

    /// Looks up an open volume by its base id.
    #[must_use]
    pub fn disk(&self, base_id: &Hash) -> Option<Arc<VDisk>> {
        self.disks.read().expect("lock is poisoned").get(base_id).cloned()
    }

    /// Creates `count` brand-new writable volumes, each with a freshly
    /// generated secret and a genesis view of just this host.
    pub fn new_disks(&self, count: usize) -> Result<Vec<(Hash, Hash)>> {
        let mut out = Vec::with_capacity(count);
        let mut disks = self.disks.write().expect("lock is poisoned");

        for _ in 0..count {
            let secret = Hash::random();
            let secret_view = Hash::random();
            let base_id = secret.apply();

            let range_map = RangeMap::open(
                Arc::clone(&self.device),
                self.table.clone(),
                Arc::clone(&self.range_map_cache),
                Arc::clone(&self.node_bitmap),
                DiskBlock::MAX,
                Arc::clone(&self.obsolescence) as Arc<dyn crate::range_map::ObsolescenceSink>,
                self.metalog_flusher_wake(),
            )?;

            let vdisk = Arc::new(VDisk::new_root(
                base_id,
                Arc::clone(&self.metalog),
                range_map,
                secret,
                secret_view,
                vec![self.host_id],
            ));

            self.registry
                .lock()
                .expect("lock is poisoned")
                .put(base_id, vdisk.registry_meta())?;
            disks.insert(base_id, Arc::clone(&vdisk));
            out.push((base_id, secret));
        }

        Ok(out)
    }

    /// Writes `data` to `disk` at `lba`, the local half of an accepted write;
    /// replication fan-out is the caller's (the server route's) concern.
    pub fn write(&self, disk: &Hash, lba: u64, data: &[u8]) -> Result<()> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;
        vdisk.write(lba, data)
    }

    /// Reads `nblk` blocks from `disk` starting at `lba`.
    pub fn read(&self, disk: &Hash, lba: u64, nblk: u16) -> Result<Vec<u8>> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;
        vdisk.read(lba, nblk)
    }

    /// Carves an immutable read-only snapshot out of `disk`'s current state
    /// (§4.7). `disk` keeps its base id and stays writable; it just starts
    /// its range map over empty, falling through to the returned carcass for
    /// any LBA it hasn't rewritten since. Subsequent writes to `disk` never
    /// affect reads of the returned snapshot.
    pub fn snapshot(&self, disk: &Hash) -> Result<Arc<VDisk>> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;

        let fresh_range_map = RangeMap::open(
            Arc::clone(&self.device),
            self.table.clone(),
            Arc::clone(&self.range_map_cache),
            Arc::clone(&self.node_bitmap),
            DiskBlock::MAX,
            Arc::clone(&self.obsolescence) as Arc<dyn crate::range_map::ObsolescenceSink>,
            self.metalog_flusher_wake(),
        )?;

        vdisk.snapshot(fresh_range_map)
    }

    /// Forces a view change on `disk`, excluding `excluded_host` from the new
    /// replica set; used by the `force` CLI/admin operation when a replica is
    /// known to be gone for good.
    pub fn force_view(&self, disk: &Hash, excluded_host: DiskId) -> Result<()> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;
        let view: Vec<DiskId> = vdisk.view().into_iter().filter(|&h| h != excluded_host).collect();
        vdisk.set_view(view);
        self.registry
            .lock()
            .expect("lock is poisoned")
            .put(*disk, vdisk.registry_meta())
    }

    /// Installs a secret on `disk`, making this host the writable master.
    pub fn set_secret(&self, disk: &Hash, secret: Hash, secret_view: Hash) -> Result<()> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;
        vdisk.set_secret(secret, secret_view)?;
        self.registry
            .lock()
            .expect("lock is poisoned")
            .put(*disk, vdisk.registry_meta())
    }

    /// Revokes this host's write capability over `disk`, e.g. before handing
    /// it off during a view change.
    pub fn release_secret(&self, disk: &Hash) -> Result<(Hash, Hash)> {
        let vdisk = self.disk(disk).ok_or(Error::Validation("no such disk"))?;
        vdisk.get_secret()
    }

    /// Flushes every open volume's range map and the super-tree, then commits
    /// a new checkpoint record. Run periodically by the checkpoint worker
    /// thread (§5), not on every write.
    pub fn checkpoint(&self) -> Result<()> {
        let disks = self.disks.read().expect("lock is poisoned");
        for vdisk in disks.values() {
            vdisk.sync_range_map()?;
            self.registry
                .lock()
                .expect("lock is poisoned")
                .put(vdisk.base_id(), vdisk.registry_meta())?;
        }
        drop(disks);

        let registry = self.registry.lock().expect("lock is poisoned");
        let moved = registry.sync()?;
        let super_tree_root = registry.root();
        drop(registry);

        let log_end = self
            .metalog
            .active_segment()
            .map_or(crate::id::LogId::invalid(), |segment| crate::id::LogId::new(segment, 0));

        let tracked_segments = self.metalog.known_segments();
        self.checkpointer.commit(
            log_end,
            super_tree_root,
            &moved,
            &self.segment_bitmap,
            &self.node_bitmap,
            &self.obsolescence,
            &tracked_segments,
        )?;

        Ok(())
    }

    /// Runs one segment-cleaner pass: selects candidates above the
    /// configured obsolescence threshold, copies surviving blocks into a
    /// fresh segment, batch-applies the resulting redirections to every
    /// affected volume's range map, and frees the drained segments.
    ///
    /// Returns `None` (and does nothing) if fewer than
    /// [`crate::gc::MIN_CANDIDATES`] segments clear the threshold, per §4.9's
    /// "roll back and sleep" rule.
    pub fn run_gc_pass(&self) -> Result<Option<GcPassReport>> {
        let threshold = (ObsolescenceHeap::segment_capacity_blocks(self.config.segment_size_bytes) as f64
            * self.config.gc_candidate_threshold) as u64;

        let candidates = self.obsolescence.select_candidates(threshold, self.config.gc_max_candidates);
        if candidates.len() < self.config.gc_min_candidates.min(crate::gc::MIN_CANDIDATES).max(1) {
            return Ok(None);
        }

        let output_segment = self.metalog.alloc_output_segment()?;
        let (report, remaps) = gc::run_copy_pass(&self.metalog, self, &self.obsolescence, &candidates, output_segment)?;

        self.apply_gc_remaps(&remaps)?;

        for &segment in &report.drained_segments {
            self.metalog.free_segment(segment);
            self.obsolescence.clear(segment);
        }

        Ok(Some(report))
    }

    /// Batch-applies a GC copy pass's position redirections to every affected
    /// volume's range map.
    ///
    /// Pointer-entry remaps (`blkno == u64::MAX`) are not applied here: this
    /// crate's recovery scans segments directly (`MetaLog::scan_segment`)
    /// rather than following `EntryBody::Pointer` targets across segments, so
    /// a sibling segment's stale pointer is inert dead weight, never a
    /// dangling reference a reader could follow — see `DESIGN.md`.
    fn apply_gc_remaps(&self, remaps: &[PositionRemap]) -> Result<()> {
        let disks = self.disks.read().expect("lock is poisoned");
        for remap in remaps {
            if remap.blkno == u64::MAX {
                continue;
            }
            if let Some(vdisk) = disks.get(&remap.disk) {
                vdisk.apply_gc_redirect(remap.blkno, remap.new)?;
            }
        }
        Ok(())
    }

    /// Direct access to the underlying log, for the streamer and server
    /// routes that need to read entries outside any single volume's range
    /// map (e.g. the catch-up scan).
    #[must_use]
    pub fn metalog(&self) -> &Arc<MetaLog> {
        &self.metalog
    }

    /// This host's peer directory, for the server's `/peers` route and the
    /// quorum client.
    #[must_use]
    pub fn peers(&self) -> &Arc<dyn PeerDirectory> {
        &self.peers
    }

    /// Replica fan-out, quorum threshold and peer timeout, as configured.
    #[must_use]
    pub fn quorum_settings(&self) -> (usize, usize, std::time::Duration) {
        (self.config.replica_fan_out, self.config.quorum_threshold, self.config.peer_timeout)
    }

    /// `<base_id, head>` for every open volume, for the `GET /heads` route.
    #[must_use]
    pub fn all_heads(&self) -> Vec<(Hash, Hash)> {
        self.disks.read().expect("lock is poisoned").values().map(|v| (v.base_id(), v.head())).collect()
    }

    /// Creates a brand-new volume and runs a write-quorum round (§4.12) to
    /// install its genesis view-change entry on `replicas`, this host
    /// included. Returns the new volume's base id and secret once the round
    /// reaches the configured threshold.
    ///
    /// This host commits its own copy exactly the way [`Host::accept_log_entry`]
    /// commits a peer's: the quorum round's local leg is just a loopback
    /// through the same acceptance path every other replica runs, so there is
    /// only one code path that ever installs a view-change entry.
    pub fn create_replicated_disk(&self, replicas: Vec<DiskId>) -> Result<(Hash, Hash)> {
        let secret = Hash::random();
        let secret_view = Hash::random();
        let base_id = secret.apply();
        let view = secret_view.apply();

        let payload = crate::viewchange::ViewChangePayload {
            view,
            invalidates_view: Hash::invalid(),
            replicas: replicas.clone(),
        };

        let head = crate::log::entry::EntryHead {
            disk: base_id,
            parent: Hash::invalid(),
            id: base_id,
            entropy: Hash::invalid(),
            body: crate::log::entry::EntryBody::Update {
                checksum: Hash::invalid(),
                lsn: 0,
                blkno: crate::log::entry::METADATA_BLOCK,
                num_blocks: 1,
                slice: 0,
                slices_total: 1,
                num_parity: 0,
                bitset: {
                    let mut b = crate::log::entry::BlockPresence::new(1);
                    b.set_present(0);
                    b
                },
            },
        };

        let body = payload.encode_into_vec()?;
        let head = finalize_view_change_checksum(head, &body);

        self.accept_log_entry(head.clone(), body.clone(), Some((secret, secret_view)))?;

        let peers = self.resolve_peers(&replicas)?;
        let (_, threshold, peer_timeout) = self.quorum_settings();
        let remote_peers: Vec<_> = peers.into_iter().filter(|p| p.host_id != self.host_id).collect();

        if !remote_peers.is_empty() {
            let mut wire_body = [0u8; 1024];
            let head_bytes = head.encode_into_vec()?;
            wire_body[..crate::log::entry::HEAD_SIZE].copy_from_slice(&head_bytes);
            wire_body[crate::log::entry::HEAD_SIZE..].copy_from_slice(&body);

            let request = crate::quorum::QuorumRequest {
                disk: base_id,
                parent: head.parent,
                body: wire_body,
                secret: Some((secret, secret_view)),
            };
            crate::quorum::run(&remote_peers, &request, threshold.saturating_sub(1).max(1), peer_timeout)?;
        }

        Ok((base_id, secret))
    }

    fn resolve_peers(&self, hosts: &[DiskId]) -> Result<Vec<crate::quorum::Peer>> {
        Ok(hosts
            .iter()
            .filter_map(|&host_id| self.peers.resolve(host_id).map(|addr| crate::quorum::Peer { host_id, addr }))
            .collect())
    }

    /// The replica-acceptor side of a view change (§4.13): validates and
    /// commits a view-change entry, whether it arrived from a peer's `PUT
    /// /log` or (via [`Host::create_replicated_disk`]) from this host's own
    /// quorum round.
    pub fn accept_log_entry(
        &self,
        head: crate::log::entry::EntryHead,
        body: Vec<u8>,
        provided_secret: Option<(Hash, Hash)>,
    ) -> Result<()> {
        let crate::log::entry::EntryBody::Update { checksum, lsn, blkno, num_blocks, bitset, .. } = &head.body else {
            return Err(Error::Validation("PUT /log body is not an update entry"));
        };
        if *blkno != crate::log::entry::METADATA_BLOCK {
            return Err(Error::Validation("PUT /log only accepts view-change entries"));
        }
        if body.len() != bitset.popcount() * crate::log::entry::BLOCK_SIZE {
            return Err(Error::Validation("view-change body size does not match its bitset"));
        }
        let expected = crate::log::entry::update_checksum(*lsn, *blkno, *num_blocks, &body, bitset);
        if expected != *checksum {
            return Err(Error::Validation("view-change checksum mismatch"));
        }

        let payload = crate::viewchange::ViewChangePayload::decode_from(&mut &body[..])?;
        if !payload.replicas.contains(&self.host_id) {
            return Err(Error::Validation("this host is not a member of the new replica set"));
        }

        let vdisk = match self.disk(&head.disk) {
            Some(vdisk) => {
                if head.parent.apply() != vdisk.head() {
                    return Err(Error::Validation("view-change parent does not chain from the current head"));
                }
                vdisk
            }
            None => {
                if head.parent.is_valid() {
                    return Err(Error::Validation("unknown volume with a non-genesis parent"));
                }

                let range_map = RangeMap::open(
                    Arc::clone(&self.device),
                    self.table.clone(),
                    Arc::clone(&self.range_map_cache),
                    Arc::clone(&self.node_bitmap),
                    DiskBlock::MAX,
                    Arc::clone(&self.obsolescence) as Arc<dyn crate::range_map::ObsolescenceSink>,
                    self.metalog_flusher_wake(),
                )?;

                let vdisk = Arc::new(VDisk::from_recovered(
                    head.disk,
                    Arc::clone(&self.metalog),
                    range_map,
                    Hash::invalid(),
                    Hash::invalid(),
                    0,
                    payload.replicas.clone(),
                ));
                self.disks.write().expect("lock is poisoned").insert(head.disk, Arc::clone(&vdisk));
                vdisk
            }
        };

        let head_pos = self.metalog.append(head.clone(), &body)?;
        vdisk.replay_committed(head_pos, head.id, head.entropy, *lsn, *blkno, *num_blocks, bitset, &body)?;
        vdisk.set_view(payload.replicas.clone());

        if let Some((secret, secret_view)) = provided_secret {
            if secret.is_valid() {
                if vdisk.is_writable() {
                    return Err(Error::Validation("this host is already master for this volume"));
                }
                vdisk.set_secret(secret, secret_view)?;
            }
        }

        self.registry.lock().expect("lock is poisoned").put(head.disk, vdisk.registry_meta())?;
        Ok(())
    }

    /// Commits one ordinary block-update entry pulled from a primary's `GET
    /// /stream` (§4.11/§4.13): validates it chains from this volume's current
    /// head and checksums correctly, appends it to the local log, and folds
    /// it into the volume's range map exactly as [`VDisk::replay_committed`]
    /// does for recovery's log-tail replay — a replica streamer and the
    /// recovery path both consume entries someone else already ordered, so
    /// they share this one commit routine.
    pub fn accept_streamed_update(&self, head: crate::log::entry::EntryHead, body: Vec<u8>) -> Result<()> {
        let crate::log::entry::EntryBody::Update { checksum, lsn, blkno, num_blocks, bitset, .. } = &head.body else {
            return Err(Error::Validation("streamed entry is not an update entry"));
        };
        if *blkno == crate::log::entry::METADATA_BLOCK {
            return Err(Error::Validation("streamed update entry must not be a view-change entry"));
        }
        if body.len() != bitset.popcount() * crate::log::entry::BLOCK_SIZE {
            return Err(Error::Validation("streamed update body size does not match its bitset"));
        }
        let expected = crate::log::entry::update_checksum(*lsn, *blkno, *num_blocks, &body, bitset);
        if expected != *checksum {
            return Err(Error::Validation("streamed update checksum mismatch"));
        }

        let vdisk = self.disk(&head.disk).ok_or(Error::Validation("no such disk"))?;
        if head.parent.apply() != vdisk.head() {
            return Err(Error::Validation("streamed update does not chain from the current head"));
        }

        let head_pos = self.metalog.append(head.clone(), &body)?;
        vdisk.replay_committed(head_pos, head.id, head.entropy, *lsn, *blkno, *num_blocks, bitset, &body)?;

        self.registry.lock().expect("lock is poisoned").put(head.disk, vdisk.registry_meta())?;
        Ok(())
    }

    /// Makes sure a background [`crate::replicator`] worker is pulling
    /// `disk`'s log from every other member of its current view, spawning
    /// one the first time a given `(disk, peer)` pair is seen. Called after
    /// this host accepts a view-change entry that makes it a non-writable
    /// member of a multi-host replica set, so a fresh replica starts
    /// following its primary without an operator having to start anything by
    /// hand.
    pub fn ensure_following(self: &Arc<Self>, disk: Hash) {
        let Some(vdisk) = self.disk(&disk) else { return };
        if vdisk.is_writable() {
            return;
        }

        for peer_host_id in vdisk.view() {
            if peer_host_id == self.host_id {
                continue;
            }
            let key = (disk, peer_host_id);
            {
                let mut following = self.following.lock().expect("lock is poisoned");
                if !following.insert(key) {
                    continue;
                }
            }
            crate::replicator::spawn(self, disk, peer_host_id);
        }
    }
}

/// Computes and installs the correct checksum for a view-change entry built
/// from `body` — [`Host::create_replicated_disk`]'s entry is assembled
/// before its checksum-dependent fields can be filled in, so this patches
/// the head's `checksum` after the fact rather than threading a mutable head
/// through entry construction.
fn finalize_view_change_checksum(mut head: crate::log::entry::EntryHead, body: &[u8]) -> crate::log::entry::EntryHead {
    if let crate::log::entry::EntryBody::Update { checksum, lsn, blkno, num_blocks, bitset, .. } = &mut head.body {
        *checksum = crate::log::entry::update_checksum(*lsn, *blkno, *num_blocks, body, bitset);
    }
    head
}

impl LiveBlockOracle for Host {
    fn is_current(&self, disk: &Hash, blkno: u64, pos: crate::id::LogId) -> bool {
        let Some(vdisk) = self.disk(disk) else {
            return false;
        };
        matches!(vdisk.lookup_position(blkno), Ok(Some(current)) if current == pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::InMemoryPeerDirectory;
    use test_log::test;

    fn test_host() -> Result<(Host, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path().join("disk"))
            .segment_size_bytes(4 * 1024 * 1024)
            .max_segments(8)
            .btree_region_bytes(crate::btree::TREE_BLOCK_SIZE as u64 * 64);
        let host = Host::open(config, 1, Arc::new(InMemoryPeerDirectory::new()))?;
        Ok((host, dir))
    }

    #[test]
    fn new_disks_are_immediately_writable() -> Result<()> {
        let (host, _dir) = test_host()?;
        let created = host.new_disks(1)?;
        assert_eq!(created.len(), 1);

        let (base_id, _secret) = created[0];
        let data = vec![0x41u8; 512];
        host.write(&base_id, 0, &data)?;
        assert_eq!(host.read(&base_id, 0, 1)?, data);
        Ok(())
    }

    #[test]
    fn checkpoint_then_reopen_recovers_volumes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path().join("disk"))
            .segment_size_bytes(4 * 1024 * 1024)
            .max_segments(8)
            .btree_region_bytes(crate::btree::TREE_BLOCK_SIZE as u64 * 64);

        let base_id = {
            let host = Host::open(config.clone(), 1, Arc::new(InMemoryPeerDirectory::new()))?;
            let created = host.new_disks(1)?;
            let (base_id, _secret) = created[0];
            host.write(&base_id, 0, &[0x42u8; 512])?;
            host.checkpoint()?;
            base_id
        };

        let reopened = Host::open(config, 1, Arc::new(InMemoryPeerDirectory::new()))?;
        assert_eq!(reopened.read(&base_id, 0, 1)?, vec![0x42u8; 512]);
        Ok(())
    }

    #[test]
    fn gc_pass_is_a_noop_below_min_candidates() -> Result<()> {
        let (host, _dir) = test_host()?;
        assert!(host.run_gc_pass()?.is_none());
        Ok(())
    }

    #[test]
    fn snapshot_freezes_reads_against_later_writes() -> Result<()> {
        let (host, _dir) = test_host()?;
        let (base_id, _secret) = host.new_disks(1)?[0];
        host.write(&base_id, 0, &[0xAAu8; 512])?;

        let snapshot = host.snapshot(&base_id)?;
        host.write(&base_id, 0, &[0xBBu8; 512])?;

        assert_eq!(host.read(&base_id, 0, 1)?, vec![0xBBu8; 512]);
        assert_eq!(snapshot.read(0, 1)?, vec![0xAAu8; 512]);
        Ok(())
    }

    /// Finds the committed entry at `lsn`, the way
    /// [`crate::streamer::Streamer`]'s catch-up scan would, to hand it to a
    /// second host as a replica acceptor receives it from `GET /stream`.
    fn find_entry_by_lsn(host: &Host, disk: Hash, lsn: u64) -> (crate::log::entry::EntryHead, Vec<u8>) {
        for segment in host.metalog().known_segments() {
            for (_, head, body) in host.metalog().scan_segment(segment) {
                if head.disk != disk {
                    continue;
                }
                if let crate::log::entry::EntryBody::Update { lsn: l, .. } = &head.body {
                    if *l == lsn {
                        return (head, body);
                    }
                }
            }
        }
        panic!("no entry found for lsn {lsn}");
    }

    #[test]
    fn accept_streamed_update_commits_on_a_replica() -> Result<()> {
        let (primary, _primary_dir) = test_host()?;
        let (base_id, _secret) = primary.create_replicated_disk(vec![1, 2])?;
        primary.write(&base_id, 0, &[0x77u8; 512])?;

        let replica_dir = tempfile::tempdir()?;
        let replica_config = Config::new(replica_dir.path().join("disk"))
            .segment_size_bytes(4 * 1024 * 1024)
            .max_segments(8)
            .btree_region_bytes(crate::btree::TREE_BLOCK_SIZE as u64 * 64);
        let replica = Host::open(replica_config, 2, Arc::new(InMemoryPeerDirectory::new()))?;

        let genesis = find_entry_by_lsn(&primary, base_id, 0);
        replica.accept_log_entry(genesis.0, genesis.1, None)?;
        assert!(!replica.disk(&base_id).expect("replica knows the volume").is_writable());

        let (head, body) = find_entry_by_lsn(&primary, base_id, 1);
        replica.accept_streamed_update(head, body)?;

        assert_eq!(replica.read(&base_id, 0, 1)?, vec![0x77u8; 512]);
        Ok(())
    }

    #[test]
    fn accept_streamed_update_rejects_a_forked_parent() -> Result<()> {
        let (primary, _primary_dir) = test_host()?;
        let (base_id, _secret) = primary.create_replicated_disk(vec![1, 2])?;
        primary.write(&base_id, 0, &[0x11u8; 512])?;

        let replica_dir = tempfile::tempdir()?;
        let replica_config = Config::new(replica_dir.path().join("disk"))
            .segment_size_bytes(4 * 1024 * 1024)
            .max_segments(8)
            .btree_region_bytes(crate::btree::TREE_BLOCK_SIZE as u64 * 64);
        let replica = Host::open(replica_config, 2, Arc::new(InMemoryPeerDirectory::new()))?;

        let genesis = find_entry_by_lsn(&primary, base_id, 0);
        replica.accept_log_entry(genesis.0, genesis.1, None)?;

        primary.write(&base_id, 0, &[0x22u8; 512])?;
        // lsn 1 (the first write) is skipped; lsn 2's parent is lsn 1's id,
        // which the replica never committed.
        let (head, body) = find_entry_by_lsn(&primary, base_id, 2);

        assert!(replica.accept_streamed_update(head, body).is_err());
        Ok(())
    }

    #[test]
    fn ensure_following_is_a_noop_for_a_writable_master() -> Result<()> {
        let (host, _dir) = test_host()?;
        let host = Arc::new(host);
        let (base_id, _secret) = host.new_disks(1)?[0];
        host.ensure_following(base_id);
        assert!(host.following.lock().expect("lock is poisoned").is_empty());
        Ok(())
    }
}
