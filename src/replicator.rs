// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The replica-side counterpart of [`crate::streamer`] (§4.11/§4.13): a
//! background worker that dials a primary's `GET /stream`, reads its
//! catch-up-then-live entry feed, and commits each ordinary block update
//! through [`crate::host::Host::accept_streamed_update`].
//!
//! Matches §5A's "plain `std::thread` + `std::sync` over hand-rolled
//! reactors" the same way the write-quorum client does: one blocking thread
//! per peer being followed, looping on reconnect rather than a shared event
//! loop multiplexing every peer's socket.

use crate::coding::Decode;
use crate::hash::Hash;
use crate::host::Host;
use crate::id::DiskId;
use crate::log::entry::{EntryBody, EntryHead};
use crate::wire;
use crate::Result;
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// How long a dropped connection to a primary waits before it is redialed.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Spawns a detached thread that follows `disk`'s log from `peer_host_id`
/// until the process exits, reconnecting on every transient failure. The
/// thread exits for good only if `peer_host_id` can never be resolved to an
/// address (a peer directory entry that is never coming is not a transient
/// failure worth retrying forever).
pub fn spawn(host: &Arc<Host>, disk: Hash, peer_host_id: DiskId) {
    let host = Arc::clone(host);
    std::thread::spawn(move || run(&host, disk, peer_host_id));
}

fn run(host: &Arc<Host>, disk: Hash, peer_host_id: DiskId) {
    loop {
        let Some(vdisk) = host.disk(&disk) else { return };
        if vdisk.is_writable() {
            return;
        }

        let Some(addr) = host.peers().resolve(peer_host_id) else {
            log::warn!("replicator: no address on file for peer {peer_host_id:016x}, giving up");
            return;
        };

        let from_lsn = vdisk.lsn();
        match follow_once(host, &disk, addr, from_lsn) {
            Ok(()) => return,
            Err(error) => {
                log::warn!("replicator: stream from {peer_host_id:016x} ({addr}) dropped: {error}");
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// Opens one `GET /stream` connection and commits entries off it until the
/// connection closes or an entry fails validation. Returns `Ok(())` only if
/// the caller has decided not to reconnect (this volume stopped existing, or
/// became this host's own write master mid-stream); any I/O or protocol
/// error returns `Err` so [`run`] retries.
fn follow_once(host: &Arc<Host>, disk: &Hash, addr: std::net::SocketAddr, from_lsn: u64) -> Result<()> {
    let mut stream = TcpStream::connect(addr)?;

    let target = format!("/stream?{}&{}", disk.to_hex(), from_lsn);
    let no_headers: [(&str, String); 0] = [];
    wire::write_request_head(&mut stream, "GET", &target, &no_headers)?;

    let status = wire::read_status_line(&mut stream)?;
    if status != 200 {
        return Err(crate::Error::ProtocolViolation("primary refused stream request"));
    }

    loop {
        let Some(vdisk) = host.disk(disk) else { return Ok(()) };
        if vdisk.is_writable() {
            return Ok(());
        }

        let head = match EntryHead::decode_from(&mut stream) {
            Ok(head) => head,
            Err(_) => return Ok(()),
        };

        let body_len = head.body_block_count() * crate::log::entry::BLOCK_SIZE;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body)?;

        if matches!(head.body, EntryBody::Pointer { .. }) {
            continue;
        }

        host.accept_streamed_update(head, body)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::InMemoryPeerDirectory;
    use test_log::test;

    /// A peer that never appears in the directory must not spin forever.
    #[test]
    fn gives_up_when_peer_address_never_resolves() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path().join("disk")).segment_size_bytes(4 * 1024 * 1024).max_segments(8);
        let host = Arc::new(Host::open(config, 1, Arc::new(InMemoryPeerDirectory::new()))?);

        let (base_id, _secret) = host.new_disks(1)?[0];
        let vdisk = host.disk(&base_id).expect("disk just created");
        let _ = vdisk.get_secret()?;
        assert!(!vdisk.is_writable());

        // Runs synchronously (no address on file for host 2): must return
        // promptly rather than retrying a peer that will never resolve.
        run(&host, base_id, 2);
        Ok(())
    }
}
