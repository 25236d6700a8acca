// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The write-quorum client (§4.12): fans a view-change entry out to a
//! replica set and waits for a threshold of peers to agree before anyone
//! sends the body, so a unique writer is guaranteed even if the round is
//! only partially acknowledged.
//!
//! §4.12 describes the reference protocol as non-blocking sockets driven by
//! a select loop with an explicit 4-state table per peer. This crate instead
//! runs one blocking worker thread per peer (matching §5A's "plain
//! `std::thread` + `std::sync` over hand-rolled reactors"), with the same
//! four states expressed as the thread body's control flow rather than a
//! literal enum polled from an event loop.

use crate::hash::Hash;
use crate::id::DiskId;
use crate::wire;
use crate::{Error, Result};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One target of a quorum round.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    /// The peer's host id.
    pub host_id: DiskId,
    /// Address to dial.
    pub addr: SocketAddr,
}

/// A view-change entry to fan out: `PUT /log?<disk>&<parent>` with a fixed
/// 1024-byte body (a 512-byte head plus a 512-byte data block).
pub struct QuorumRequest {
    /// Volume this entry belongs to.
    pub disk: Hash,
    /// `parent` query parameter: the head this entry extends.
    pub parent: Hash,
    /// The exact 1024-byte wire body sent to every peer.
    pub body: [u8; 1024],
    /// Cleartext `(secret, secret_view)`, sent only to peer index 0; every
    /// other peer sees secret zeroed out and only the real `secret_view`.
    pub secret: Option<(Hash, Hash)>,
}

struct Coordinator {
    agreeing: Mutex<usize>,
    bad: Mutex<usize>,
    condvar: Condvar,
    threshold: usize,
    num_hosts: usize,
}

impl Coordinator {
    fn mark_agreeing(&self) {
        *self.agreeing.lock().expect("lock is poisoned") += 1;
        self.condvar.notify_all();
    }

    fn mark_bad(&self) {
        *self.bad.lock().expect("lock is poisoned") += 1;
        self.condvar.notify_all();
    }

    fn aborted(&self) -> bool {
        *self.bad.lock().expect("lock is poisoned") > self.num_hosts.saturating_sub(self.threshold)
    }

    /// Blocks until either the threshold of agreeing peers is reached (and
    /// returns `true`) or enough peers have gone bad that the threshold can
    /// no longer be reached (returns `false`).
    fn wait_for_threshold(&self) -> bool {
        let guard = self.agreeing.lock().expect("lock is poisoned");
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, Duration::from_secs(30), |agreeing| {
                *agreeing < self.threshold && !self.aborted()
            })
            .expect("lock is poisoned");
        *guard >= self.threshold
    }
}

/// Runs one write-quorum round against `peers`, returning the number of
/// peers that fully acknowledged (200/204) the body, or
/// [`Error::QuorumNotReached`] if fewer than `threshold` peers agreed to
/// accept the body in the first place.
pub fn run(peers: &[Peer], request: &QuorumRequest, threshold: usize, peer_timeout: Duration) -> Result<usize> {
    let coordinator = Arc::new(Coordinator {
        agreeing: Mutex::new(0),
        bad: Mutex::new(0),
        condvar: Condvar::new(),
        threshold,
        num_hosts: peers.len(),
    });

    let handles: Vec<_> = peers
        .iter()
        .enumerate()
        .map(|(index, peer)| {
            let coordinator = Arc::clone(&coordinator);
            let peer = *peer;
            let disk = request.disk;
            let parent = request.parent;
            let body = request.body;
            let secret = request.secret;
            std::thread::spawn(move || run_peer(index, peer, disk, parent, &body, secret, &coordinator, peer_timeout))
        })
        .collect();

    let mut done = 0usize;
    for handle in handles {
        if handle.join().unwrap_or(Ok(false)).unwrap_or(false) {
            done += 1;
        }
    }

    let agreeing = *coordinator.agreeing.lock().expect("lock is poisoned");
    if agreeing < threshold {
        return Err(Error::QuorumNotReached { agreeing, threshold });
    }

    Ok(done)
}

#[allow(clippy::too_many_arguments)]
fn run_peer(
    index: usize,
    peer: Peer,
    disk: Hash,
    parent: Hash,
    body: &[u8; 1024],
    secret: Option<(Hash, Hash)>,
    coordinator: &Coordinator,
    peer_timeout: Duration,
) -> Result<bool> {
    let mut stream = TcpStream::connect_timeout(&peer.addr, peer_timeout)?;
    stream.set_read_timeout(Some(peer_timeout))?;

    let secret_header = match (index, secret) {
        (0, Some((secret, secret_view))) => format!("{},{}", secret.to_hex(), secret_view.to_hex()),
        (_, Some((_, secret_view))) => format!("{},{}", Hash::zero().to_hex(), secret_view.to_hex()),
        (_, None) => String::new(),
    };

    let mut headers = vec![
        ("Content-Length", "1024".to_string()),
        ("Expect", "100-continue".to_string()),
    ];
    if !secret_header.is_empty() {
        headers.push(("Secret", secret_header));
    }

    let target = format!("/log?{}&{}", disk.to_hex(), parent.to_hex());
    wire::write_request_head(&mut stream, "PUT", &target, &headers)?;

    // State 1 -> 2: require the interim 100 Continue.
    match wire::read_status_line(&mut stream) {
        Ok(100) => coordinator.mark_agreeing(),
        _ => {
            coordinator.mark_bad();
            return Ok(false);
        }
    }

    // State 2 -> 3: wait for the round-wide threshold before sending body.
    if !coordinator.wait_for_threshold() {
        return Ok(false);
    }

    // State 3 -> 4: send body, require 200/204.
    use std::io::Write;
    stream.write_all(body)?;
    stream.flush()?;

    match wire::read_status_line(&mut stream) {
        Ok(200 | 204) => Ok(true),
        _ => {
            coordinator.mark_bad();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn coordinator_releases_waiters_once_threshold_reached() {
        let coordinator = Arc::new(Coordinator {
            agreeing: Mutex::new(0),
            bad: Mutex::new(0),
            condvar: Condvar::new(),
            threshold: 2,
            num_hosts: 3,
        });

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            std::thread::spawn(move || coordinator.wait_for_threshold())
        };

        coordinator.mark_agreeing();
        coordinator.mark_agreeing();

        assert!(waiter.join().expect("waiter thread panicked"));
    }

    #[test]
    fn coordinator_aborts_once_quorum_is_unreachable() {
        let coordinator = Coordinator {
            agreeing: Mutex::new(0),
            bad: Mutex::new(0),
            condvar: Condvar::new(),
            threshold: 3,
            num_hosts: 3,
        };

        coordinator.mark_bad();
        assert!(!coordinator.aborted());
        coordinator.mark_bad();
        assert!(coordinator.aborted());
    }
}
