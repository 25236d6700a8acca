// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-volume state machine: hash-chain head, secret lifecycle, write/read
//! paths, and snapshot branching.
//!
//! A volume is identified by its `base_id`; ownership of the append right is
//! proved by knowledge of `secret_parent`, the pre-image of `parent` under
//! [`Hash::apply`]. A host either holds that secret (writable master) or
//! does not (read-only replica or snapshot): there is no separate variant
//! tag, writability is just "is `secret_parent` valid".

use crate::hash::Hash;
use crate::id::DiskId;
use crate::log::entry::{update_checksum, BlockPresence, EntryBody, EntryHead, BLOCK_SIZE};
use crate::log::MetaLog;
use crate::range_map::RangeMap;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};

/// Chain and membership state advanced on every committed write. The lock
/// guarding it is held for the whole of a single [`VDisk::write`] call,
/// including the log append itself, so that the chain's `parent`/`lsn`
/// sequence can never fork between two concurrent writers; this makes
/// `write` a serialization point rather than a purely in-memory critical
/// section.
struct VDiskState {
    /// Current head id, `apply(secret_parent)`.
    head: Hash,
    /// Pre-image of `head`; valid iff this host is the writable master.
    secret_parent: Hash,
    /// Current view's secret, folded into the next entry's id derivation.
    secret_view: Hash,
    /// Rolling entropy hash folded into the next entry's secret derivation.
    entropy: Hash,
    /// Next LSN to assign.
    lsn: u64,
    /// Bumped on every secret install/clear, so queued writers can tell
    /// whether the reservation they were waiting on is still the one they
    /// queued against.
    generation: u64,
    /// Current replica set for this volume.
    view: Vec<DiskId>,
}

/// A single virtual disk: its hash-chain head, its LBA→position range map,
/// and (if it has one) a parent snapshot consulted on a range-map miss.
pub struct VDisk {
    base_id: Hash,
    metalog: Arc<MetaLog>,
    range_map: RwLock<Arc<RangeMap>>,
    parent_disk: RwLock<Option<Arc<VDisk>>>,
    state: Mutex<VDiskState>,

    /// Streams currently attached to this volume's live write path; each
    /// entry gets a verbatim copy of every committed entry.
    streams: Mutex<Vec<mpsc::Sender<(EntryHead, Vec<u8>)>>>,

    /// In-flight writer count; `get_secret` quiesces by requesting no new
    /// admissions and waiting for this to drain to zero.
    inflight: AtomicU64,
    quiesce_requested: AtomicBool,
    quiesce_lock: Mutex<()>,
    drained: Condvar,
}

/// RAII admission guard: decrements the in-flight counter and wakes any
/// quiescing `get_secret` call when a write completes or is rejected.
struct Admission<'a> {
    disk: &'a VDisk,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.disk.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the lock here, even though nothing in it needs updating,
            // closes the gap between `get_secret`'s predicate check and its
            // actual park: without it a notify landing in that gap would be
            // missed, since `Condvar::wait` only synchronizes with notifies
            // issued by a thread holding this same mutex.
            let _guard = self.disk.quiesce_lock.lock().expect("lock is poisoned");
            self.disk.drained.notify_all();
        }
    }
}

impl VDisk {
    /// Creates a brand-new writable volume: `base_id` is both its identity
    /// and its genesis head, with no parent entry to chain from.
    #[must_use]
    pub fn new_root(
        base_id: Hash,
        metalog: Arc<MetaLog>,
        range_map: RangeMap,
        secret: Hash,
        secret_view: Hash,
        view: Vec<DiskId>,
    ) -> Self {
        Self {
            base_id,
            metalog,
            range_map: RwLock::new(Arc::new(range_map)),
            parent_disk: RwLock::new(None),
            state: Mutex::new(VDiskState {
                head: base_id,
                secret_parent: secret,
                secret_view,
                entropy: Hash::invalid(),
                lsn: 0,
                generation: 0,
                view,
            }),
            streams: Mutex::new(Vec::new()),
            inflight: AtomicU64::new(0),
            quiesce_requested: AtomicBool::new(false),
            quiesce_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Reconstructs a `VDisk` from recovered state (super-tree entry plus
    /// replayed log tail), with no write capability until `set_secret` is
    /// called.
    #[must_use]
    pub fn from_recovered(
        base_id: Hash,
        metalog: Arc<MetaLog>,
        range_map: RangeMap,
        head: Hash,
        entropy: Hash,
        lsn: u64,
        view: Vec<DiskId>,
    ) -> Self {
        Self {
            base_id,
            metalog,
            range_map: RwLock::new(Arc::new(range_map)),
            parent_disk: RwLock::new(None),
            state: Mutex::new(VDiskState {
                head,
                secret_parent: Hash::invalid(),
                secret_view: Hash::invalid(),
                entropy,
                lsn,
                generation: 0,
                view,
            }),
            streams: Mutex::new(Vec::new()),
            inflight: AtomicU64::new(0),
            quiesce_requested: AtomicBool::new(false),
            quiesce_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// This volume's base identity.
    #[must_use]
    pub fn base_id(&self) -> Hash {
        self.base_id
    }

    /// Current chain head.
    #[must_use]
    pub fn head(&self) -> Hash {
        self.state.lock().expect("lock is poisoned").head
    }

    /// Current LSN (next one to be assigned).
    #[must_use]
    pub fn lsn(&self) -> u64 {
        self.state.lock().expect("lock is poisoned").lsn
    }

    /// `true` iff this host holds the append right and is not quiesced.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state.lock().expect("lock is poisoned").secret_parent.is_valid()
            && !self.quiesce_requested.load(Ordering::Acquire)
    }

    /// The range map root block, for checkpointing.
    #[must_use]
    pub fn range_map_root(&self) -> crate::btree::node::DiskBlock {
        self.range_map.read().expect("lock is poisoned").root()
    }

    /// Looks up where `blkno` currently resolves to in this volume's range
    /// map, for the segment cleaner's [`crate::gc::LiveBlockOracle`] and for
    /// recording a GC copy pass's redirection.
    pub fn lookup_position(&self, blkno: u64) -> Result<Option<crate::id::LogId>> {
        let range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
        Ok(range_map.lookup(blkno)?.map(|(log_id, _endsat)| log_id))
    }

    /// Redirects `blkno` to `new_log_id` in this volume's range map, after a
    /// GC copy pass has carried the block forward into a fresh segment. This
    /// is just an ordinary range-map insert at the single-block interval
    /// `[blkno, blkno + 1)`, reusing the same overlap-splitting logic a live
    /// write would go through.
    pub fn apply_gc_redirect(&self, blkno: u64, new_log_id: crate::id::LogId) -> Result<()> {
        let lsn = self.state.lock().expect("lock is poisoned").lsn;
        let range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
        range_map.insert(lsn, blkno, blkno + 1, new_log_id)
    }

    /// Syncs this volume's range map, for the checkpointer's commit pass.
    pub fn sync_range_map(&self) -> Result<std::collections::HashMap<crate::btree::node::DiskBlock, crate::btree::node::DiskBlock>> {
        self.range_map.read().expect("lock is poisoned").sync()
    }

    /// Folds an already-durable entry into this volume's in-memory
    /// head/LSN/range-map state, without appending anything to the log.
    ///
    /// Used by two callers that both consume entries someone else already
    /// wrote: [`crate::host::Host`]'s log-tail replay during recovery (§4.8),
    /// and the replica acceptor (§4.13) committing an entry a primary
    /// streamed or quorum-wrote to this host. `head_pos` is the entry head's
    /// own log position, used to derive where its body (if any) begins
    /// (`head_pos` plus one block, the same relationship [`VDisk::write`]
    /// relies on).
    #[allow(clippy::too_many_arguments)]
    pub fn replay_committed(
        &self,
        head_pos: crate::id::LogId,
        id: Hash,
        entropy: Hash,
        lsn: u64,
        blkno: u64,
        num_blocks: u16,
        bitset: &BlockPresence,
        body: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock().expect("lock is poisoned");

        if blkno != crate::log::entry::METADATA_BLOCK {
            let body_base = crate::id::LogId::new(head_pos.segment(), head_pos.block_offset() + 1);
            let range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
            apply_run_updates(&range_map, lsn, blkno, num_blocks, bitset, body_base)?;
        }
        let _ = body;

        state.head = id;
        state.entropy = entropy;
        state.lsn = lsn + 1;

        Ok(())
    }

    /// Snapshot of everything the super-tree registry needs for this volume.
    #[must_use]
    pub fn registry_meta(&self) -> crate::registry::VDiskMeta {
        let state = self.state.lock().expect("lock is poisoned");
        crate::registry::VDiskMeta {
            root: self.range_map_root(),
            lsn: state.lsn,
            head: state.head,
            entropy: state.entropy,
            view: state.view.clone(),
        }
    }

    /// Attaches a remote streamer to this volume's live write path; it
    /// receives a copy of every entry committed from this point on.
    pub fn attach_stream(&self, sender: mpsc::Sender<(EntryHead, Vec<u8>)>) {
        self.streams.lock().expect("lock is poisoned").push(sender);
    }

    fn admit(&self) -> Result<Admission<'_>> {
        if self.quiesce_requested.load(Ordering::Acquire) {
            return Err(Error::NotWritable(0));
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        // Re-check: a quiesce request racing with the increment above must
        // still see this writer and wait for it, which `get_secret`'s
        // drain-to-zero wait already guarantees; nothing further to do here.
        Ok(Admission { disk: self })
    }

    /// Writes `data` (a whole multiple of 512 bytes) starting at logical
    /// block address `lba`.
    pub fn write(&self, lba: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(Error::Validation("write length is not a multiple of the block size"));
        }
        let num_blocks = u16::try_from(data.len() / BLOCK_SIZE)
            .map_err(|_| Error::Validation("write spans too many blocks for one entry"))?;

        let _admission = self.admit()?;

        let mut state = self.state.lock().expect("lock is poisoned");
        if !state.secret_parent.is_valid() {
            return Err(Error::NotWritable(0));
        }

        let mut bitset = BlockPresence::new(num_blocks);
        let mut body = Vec::new();
        for i in 0..num_blocks {
            let block = &data[usize::from(i) * BLOCK_SIZE..(usize::from(i) + 1) * BLOCK_SIZE];
            if block.iter().any(|&b| b != 0) {
                bitset.set_present(i);
                body.extend_from_slice(block);
            }
        }

        let lsn = state.lsn;
        let parent = state.head;
        let checksum = update_checksum(lsn, lba, num_blocks, &body, &bitset);
        let entropy = Hash::combine(&parent, &checksum);
        let secret_id = Hash::combine(&state.secret_view, &entropy);
        let id = secret_id.apply();

        let head = EntryHead {
            disk: self.base_id,
            parent,
            id,
            entropy,
            body: EntryBody::Update {
                checksum,
                lsn,
                blkno: lba,
                num_blocks,
                slice: 0,
                slices_total: 1,
                num_parity: 0,
                bitset: bitset.clone(),
            },
        };

        let log_id = self.metalog.append(head.clone(), &body)?;
        // `append` returns the position of the entry's head; its body
        // (if any) starts exactly one 512-byte block later, since
        // `HEAD_SIZE == BLOCK_SIZE`.
        let body_base = crate::id::LogId::new(log_id.segment(), log_id.block_offset() + 1);

        {
            let streams = self.streams.lock().expect("lock is poisoned");
            for tx in streams.iter() {
                let _ = tx.send((head.clone(), body.clone()));
            }
        }

        let range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
        apply_run_updates(&range_map, lsn, lba, num_blocks, &bitset, body_base)?;

        state.head = id;
        state.secret_parent = secret_id;
        state.entropy = entropy;
        state.lsn += 1;

        Ok(())
    }

    /// Reads `nblk` blocks starting at `lba`.
    pub fn read(&self, lba: u64, nblk: u16) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::from(nblk) * BLOCK_SIZE);
        for i in 0..u64::from(nblk) {
            out.extend_from_slice(&self.read_block(lba + i)?);
        }
        Ok(out)
    }

    fn read_block(&self, lba: u64) -> Result<[u8; BLOCK_SIZE]> {
        let range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
        match range_map.lookup(lba)? {
            Some((log_id, _endsat)) if !log_id.is_invalid() => self.metalog.read_block(log_id),
            _ => match self.parent_disk.read().expect("lock is poisoned").clone() {
                Some(parent) => parent.read_block(lba),
                None => Ok([0u8; BLOCK_SIZE]),
            },
        }
    }

    /// Carves an immutable read-only snapshot out of the current state,
    /// resets this (live) volume to a fresh range map, and points it at the
    /// new snapshot for future read fallback.
    ///
    /// `fresh_range_map` must be a newly-allocated, empty [`RangeMap`]
    /// (the caller, normally [`crate::host::Host`], owns paged-tree
    /// allocation and passes one in rather than this module reaching into
    /// the shared node cache itself).
    pub fn snapshot(&self, fresh_range_map: RangeMap) -> Result<Arc<VDisk>> {
        let state = self.state.lock().expect("lock is poisoned");

        let carcass_range_map = Arc::clone(&self.range_map.read().expect("lock is poisoned"));
        let carcass_parent = self.parent_disk.read().expect("lock is poisoned").clone();

        let carcass = Arc::new(VDisk {
            base_id: self.base_id,
            metalog: Arc::clone(&self.metalog),
            range_map: RwLock::new(carcass_range_map),
            parent_disk: RwLock::new(carcass_parent),
            state: Mutex::new(VDiskState {
                head: state.head,
                secret_parent: Hash::invalid(),
                secret_view: state.secret_view,
                entropy: state.entropy,
                lsn: state.lsn,
                generation: state.generation,
                view: state.view.clone(),
            }),
            streams: Mutex::new(Vec::new()),
            inflight: AtomicU64::new(0),
            quiesce_requested: AtomicBool::new(true),
            quiesce_lock: Mutex::new(()),
            drained: Condvar::new(),
        });

        drop(state);

        *self.range_map.write().expect("lock is poisoned") = Arc::new(fresh_range_map);
        *self.parent_disk.write().expect("lock is poisoned") = Some(Arc::clone(&carcass));

        Ok(carcass)
    }

    /// Installs a secret, making this host the writable master, after
    /// verifying `apply(secret) == head`. Wakes any writers parked waiting
    /// for a secret to arrive (there are none yet in this crate's
    /// single-process demo harness, but the generation bump is the hook a
    /// future queued-writer path would wait on).
    pub fn set_secret(&self, secret: Hash, secret_view: Hash) -> Result<()> {
        let mut state = self.state.lock().expect("lock is poisoned");
        if secret.apply() != state.head {
            return Err(Error::Validation("setSecret: apply(secret) does not match current head"));
        }

        state.secret_parent = secret;
        state.secret_view = secret_view;
        state.generation += 1;
        self.quiesce_requested.store(false, Ordering::Release);
        Ok(())
    }

    /// Requests quiesce, waits for in-flight writers to drain, then returns
    /// and clears the secret: this host is no longer master.
    pub fn get_secret(&self) -> Result<(Hash, Hash)> {
        self.quiesce_requested.store(true, Ordering::Release);

        let guard = self.quiesce_lock.lock().expect("lock is poisoned");
        let _guard = self
            .drained
            .wait_while(guard, |_| self.inflight.load(Ordering::Acquire) > 0)
            .expect("lock is poisoned");

        let mut state = self.state.lock().expect("lock is poisoned");
        if !state.secret_parent.is_valid() {
            return Err(Error::NotWritable(0));
        }
        let secret = state.secret_parent;
        let secret_view = state.secret_view;
        state.secret_parent = Hash::invalid();
        state.secret_view = Hash::invalid();
        Ok((secret, secret_view))
    }

    /// Current replica set.
    #[must_use]
    pub fn view(&self) -> Vec<DiskId> {
        self.state.lock().expect("lock is poisoned").view.clone()
    }

    /// Installs a new replica set, e.g. after a write-quorum-driven
    /// view-change entry has been committed locally.
    pub fn set_view(&self, view: Vec<DiskId>) {
        self.state.lock().expect("lock is poisoned").view = view;
    }
}

/// Splits a write's zero-elided bitset into maximal present/absent runs and
/// applies one range-map insert per run: present runs get the physical
/// position offset by the count of present blocks preceding them in the
/// body (since elided blocks contribute no bytes); absent runs get the
/// invalid sentinel so reads fall through to the parent or to zeros.
fn apply_run_updates(
    range_map: &RangeMap,
    lsn: u64,
    lba: u64,
    num_blocks: u16,
    bitset: &BlockPresence,
    base: crate::id::LogId,
) -> Result<()> {
    let mut i = 0u16;
    let mut body_offset = 0u64;

    while i < num_blocks {
        let present = bitset.is_present(i);
        let run_start = i;
        let mut run_present_blocks = 0u64;

        while i < num_blocks && bitset.is_present(i) == present {
            if present {
                run_present_blocks += 1;
            }
            i += 1;
        }

        let from = lba + u64::from(run_start);
        let to = lba + u64::from(i);
        let log_id = if present {
            offset_log_id(base, body_offset)
        } else {
            crate::id::LogId::invalid()
        };
        range_map.insert(lsn, from, to, log_id)?;

        body_offset += run_present_blocks;
    }

    Ok(())
}

fn offset_log_id(log_id: crate::id::LogId, blocks: u64) -> crate::id::LogId {
    crate::id::LogId::new(log_id.segment(), log_id.block_offset() + blocks as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BitmapAllocator;
    use crate::btree::cache::NodeCache;
    use crate::btree::node::{DiskBlock, TREE_BLOCK_SIZE};
    use crate::device::{BlockDevice, FileDevice};
    use crate::range_map::NullObsolescenceSink;
    use crate::section::SectionTable;
    use test_log::test;

    fn test_disk() -> Result<(Arc<VDisk>, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, TREE_BLOCK_SIZE as u64 * 64, 4096, 64 * 1024 * 1024);
        let bitmap = Arc::new(BitmapAllocator::new(4096));
        let node_bitmap = Arc::new(BitmapAllocator::new(64));
        let node_cache = Arc::new(NodeCache::with_capacity(64));
        let (tx, _rx) = mpsc::channel();

        let metalog = Arc::new(MetaLog::new(Arc::clone(&device), table.clone(), 16 * 1024 * 1024, bitmap, tx));

        let (rtx, _rrx) = mpsc::channel();
        let range_map = RangeMap::open(
            Arc::clone(&device),
            table,
            node_cache,
            node_bitmap,
            DiskBlock::MAX,
            Arc::new(NullObsolescenceSink),
            rtx,
        )?;

        let secret = Hash::checksum(b"secret");
        let base_id = secret.apply();
        let secret_view = Hash::checksum(b"view");

        let disk = Arc::new(VDisk::new_root(base_id, metalog, range_map, secret, secret_view, vec![1]));
        Ok((disk, dir))
    }

    #[test]
    fn write_then_read_round_trips() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        let data = vec![0x41u8; BLOCK_SIZE];
        disk.write(0, &data)?;
        assert_eq!(disk.read(0, 1)?, data);
        Ok(())
    }

    #[test]
    fn zero_write_elides_but_still_reads_as_zero() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        disk.write(0, &[0x41u8; BLOCK_SIZE])?;
        disk.write(0, &[0u8; BLOCK_SIZE])?;
        assert_eq!(disk.read(0, 1)?, vec![0u8; BLOCK_SIZE]);
        Ok(())
    }

    #[test]
    fn unwritten_region_reads_as_zero() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        assert_eq!(disk.read(1000, 2)?, vec![0u8; BLOCK_SIZE * 2]);
        Ok(())
    }

    #[test]
    fn write_advances_head_and_lsn() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        let before = disk.head();
        disk.write(0, &[0x11u8; BLOCK_SIZE])?;
        assert_ne!(disk.head(), before);
        assert_eq!(disk.lsn(), 1);
        Ok(())
    }

    #[test]
    fn set_secret_requires_matching_head() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        let (secret, secret_view) = disk.get_secret()?;
        assert!(disk.set_secret(secret, secret_view).is_ok());
        assert!(disk.set_secret(Hash::checksum(b"wrong"), secret_view).is_err());
        Ok(())
    }

    #[test]
    fn get_secret_revokes_write_capability() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        assert!(disk.is_writable());
        let _ = disk.get_secret()?;
        assert!(!disk.is_writable());
        assert!(disk.write(0, &[1u8; BLOCK_SIZE]).is_err());
        Ok(())
    }

    #[test]
    fn snapshot_isolates_further_writes() -> Result<()> {
        let (disk, _dir) = test_disk()?;
        disk.write(0, &[0xAAu8; BLOCK_SIZE])?;

        let aux_dir = tempfile::tempdir()?;
        let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&aux_dir.path().join("disk"), 3)?);
        let table = SectionTable::new(4096, TREE_BLOCK_SIZE as u64 * 64, 4096, 64 * 1024 * 1024);
        let node_cache = Arc::new(NodeCache::with_capacity(64));
        let node_bitmap = Arc::new(BitmapAllocator::new(64));
        let (rtx, _rrx) = mpsc::channel();
        let fresh = RangeMap::open(device, table, node_cache, node_bitmap, DiskBlock::MAX, Arc::new(NullObsolescenceSink), rtx)?;

        let snapshot = disk.snapshot(fresh)?;
        disk.write(0, &[0xBBu8; BLOCK_SIZE])?;

        assert_eq!(disk.read(0, 1)?, vec![0xBBu8; BLOCK_SIZE]);
        assert_eq!(snapshot.read(0, 1)?, vec![0xAAu8; BLOCK_SIZE]);
        Ok(())
    }
}
