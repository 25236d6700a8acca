use cloudfs::{Config, Host, InMemoryPeerDirectory};
use std::path::Path;
use std::sync::Arc;

/// 64 paged-tree nodes at 32 KiB each: enough slots for every test in this
/// suite without forcing a node reuse mid-test.
pub const BTREE_REGION_BYTES: u64 = 64 * 32 * 1024;

/// Opens a host over a fresh device at `dir`, with small segments so the
/// tests that need several segments (checkpoint, GC) don't have to write
/// gigabytes to get there.
pub fn open_host(dir: &Path, host_id: u64) -> cloudfs::Result<Host> {
    open_host_with(dir, host_id, |c| c)
}

/// Like [`open_host`], but lets the caller adjust the configuration (segment
/// size, quorum settings, ...) before the host opens.
pub fn open_host_with(dir: &Path, host_id: u64, adjust: impl FnOnce(Config) -> Config) -> cloudfs::Result<Host> {
    let config = adjust(
        Config::new(dir.join("disk"))
            .segment_size_bytes(4 * 1024 * 1024)
            .max_segments(16)
            .btree_region_bytes(BTREE_REGION_BYTES),
    );
    Host::open(config, host_id, Arc::new(InMemoryPeerDirectory::new()))
}
