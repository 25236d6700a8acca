// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The §6 HTTP route table: one `TcpListener` accept loop handing each
//! connection off to a small worker pool, the way the segment engine hands
//! flush/compaction work off to its own background threads rather than
//! inlining it into the caller.

use crate::hash::Hash;
use crate::host::Host;
use crate::id::DiskId;
use crate::log::entry::EntryHead;
use crate::section::BLOCK_SIZE;
use crate::streamer::Streamer;
use crate::wire::{self, Request};
use crate::{coding::Decode, Error, Result};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// Number of worker threads pulling connections off the accept loop.
///
/// §5 sizes this at "a small pool", matching the segment engine's flush
/// worker pool rather than a one-thread-per-core sizing; eight keeps a modest
/// host responsive without the accept loop itself ever blocking on I/O.
const WORKER_POOL_SIZE: usize = 8;

/// Binds `addr` and serves the route table until the process exits.
///
/// Spawns [`WORKER_POOL_SIZE`] worker threads, each independently calling
/// `accept()` on a cloned listener handle; the kernel distributes incoming
/// connections across them, so there is no separate dispatcher thread.
pub fn serve(host: Arc<Host>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)?;

    let mut workers = Vec::with_capacity(WORKER_POOL_SIZE);
    for _ in 0..WORKER_POOL_SIZE {
        let listener = listener.try_clone()?;
        let host = Arc::clone(&host);
        workers.push(std::thread::spawn(move || worker_loop(&listener, &host)));
    }

    for worker in workers {
        let _ = worker.join();
    }

    Ok(())
}

fn worker_loop(listener: &TcpListener, host: &Arc<Host>) {
    loop {
        let Ok((stream, _addr)) = listener.accept() else {
            continue;
        };
        if let Err(error) = handle_connection(host, stream) {
            log::warn!("connection handling failed: {error}");
        }
    }
}

fn handle_connection(host: &Arc<Host>, mut stream: TcpStream) -> Result<()> {
    let peer_addr = stream.peer_addr().ok();
    let (request, leftover) = wire::read_request_head(&mut stream)?;

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/blocks") => handle_get_blocks(host, &request, leftover, &mut stream),
        ("PUT", "/blocks") => handle_put_blocks(host, &request, leftover, &mut stream),
        ("PUT", "/log") => handle_put_log(host, &request, leftover, &mut stream),
        ("GET", "/stream") => handle_get_stream(host, &request, leftover, &mut stream),
        ("GET", "/lsn") => handle_get_lsn(host, &request, leftover, &mut stream),
        ("GET", "/heads") => handle_get_heads(host, &mut stream),
        ("GET", "/peers") => handle_get_peers(host, &request, peer_addr, &mut stream),
        _ => wire::write_response(&mut stream, 404, "Not Found", &[], b""),
    }
}

fn parse_disk_token(token: &str) -> Result<Hash> {
    Hash::from_hex(token).ok_or(Error::ProtocolViolation("malformed disk id in query string"))
}

fn parse_host_token(token: &str) -> Result<DiskId> {
    u64::from_str_radix(token, 16).map_err(|_| Error::ProtocolViolation("malformed host id in query string"))
}

/// Parses a `Range: bytes=<from>-<to>` header (inclusive byte range) into a
/// `(lba, nblk)` pair, both in [`BLOCK_SIZE`] units.
fn parse_range(request: &Request) -> Result<(u64, u16)> {
    let raw = request
        .header("range")
        .ok_or(Error::ProtocolViolation("missing Range header"))?;
    let spec = raw
        .strip_prefix("bytes=")
        .ok_or(Error::ProtocolViolation("malformed Range header"))?;
    let (from, to) = spec
        .split_once('-')
        .ok_or(Error::ProtocolViolation("malformed Range header"))?;
    let from: u64 = from.parse().map_err(|_| Error::ProtocolViolation("malformed Range header"))?;
    let to: u64 = to.parse().map_err(|_| Error::ProtocolViolation("malformed Range header"))?;
    if to < from || from % BLOCK_SIZE != 0 || (to - from + 1) % BLOCK_SIZE != 0 {
        return Err(Error::ProtocolViolation("Range is not block-aligned"));
    }

    let lba = from / BLOCK_SIZE;
    let nblk = u16::try_from((to - from + 1) / BLOCK_SIZE).map_err(|_| Error::ProtocolViolation("Range spans too many blocks"))?;
    Ok((lba, nblk))
}

fn handle_get_blocks(host: &Arc<Host>, request: &Request, leftover: Vec<u8>, stream: &mut TcpStream) -> Result<()> {
    let _ = wire::read_body(stream, leftover, request.content_length())?;

    let Some(token) = request.query_tokens().into_iter().next() else {
        return wire::write_response(stream, 400, "Bad Request", &[], b"missing disk id");
    };
    let disk = parse_disk_token(token)?;

    let Some(vdisk) = host.disk(&disk) else {
        return wire::write_response(stream, 404, "Not Found", &[], b"unknown volume");
    };

    let (lba, nblk) = parse_range(request)?;

    if let Some(id_hex) = request.header("if-none-match").map(|v| v.trim_matches('"')) {
        if id_hex == vdisk.head().to_hex() {
            return wire::write_response(stream, 204, "No Content", &[], b"");
        }
        if Hash::from_hex(id_hex).is_some() {
            // A non-current but well-formed id is treated as an already-known
            // history point: the caller has it, nothing to resend.
            return wire::write_response(stream, 304, "Not Modified", &[], b"");
        }
    }

    let data = host.read(&disk, lba, nblk)?;
    wire::write_response(stream, 200, "OK", &[("Content-Type", "application/octet-stream".to_string())], &data)
}

fn handle_put_blocks(host: &Arc<Host>, request: &Request, leftover: Vec<u8>, stream: &mut TcpStream) -> Result<()> {
    let Some(token) = request.query_tokens().into_iter().next() else {
        return wire::write_response(stream, 400, "Bad Request", &[], b"missing disk id");
    };
    let disk = parse_disk_token(token)?;

    let (lba, nblk) = parse_range(request)?;
    let body = wire::read_body(stream, leftover, request.content_length())?;

    if body.len() != usize::from(nblk) * BLOCK_SIZE as usize {
        return wire::write_response(stream, 400, "Bad Request", &[], b"body does not match Range");
    }

    let Some(vdisk) = host.disk(&disk) else {
        return wire::write_response(stream, 404, "Not Found", &[], b"unknown volume");
    };

    if let Some(id_hex) = request.header("if-none-match").map(|v| v.trim_matches('"')) {
        if id_hex == vdisk.head().to_hex() {
            return wire::write_response(stream, 304, "Not Modified", &[], b"");
        }
    }

    host.write(&disk, lba, &body)?;
    wire::write_response(stream, 204, "No Content", &[], b"")
}

fn handle_put_log(host: &Arc<Host>, request: &Request, leftover: Vec<u8>, stream: &mut TcpStream) -> Result<()> {
    if request.content_length() != 1024 {
        return wire::write_response(stream, 400, "Bad Request", &[], b"Content-Length must be 1024");
    }

    if request.expects_continue() {
        wire::write_continue(stream)?;
    }

    let wire_body = wire::read_body(stream, leftover, 1024)?;
    let head = EntryHead::decode_from(&mut &wire_body[..crate::log::entry::HEAD_SIZE])?;
    let body = wire_body[crate::log::entry::HEAD_SIZE..].to_vec();

    let provided_secret = request
        .header("secret")
        .and_then(|raw| raw.split_once(','))
        .and_then(|(secret, view)| Some((Hash::from_hex(secret)?, Hash::from_hex(view)?)));

    let disk = head.disk;
    match host.accept_log_entry(head, body, provided_secret) {
        Ok(()) => {
            host.ensure_following(disk);
            wire::write_response(stream, 204, "No Content", &[], b"")
        }
        Err(error) => wire::write_response(stream, 400, "Bad Request", &[], error.to_string().as_bytes()),
    }
}

fn handle_get_stream(host: &Arc<Host>, request: &Request, leftover: Vec<u8>, stream: &mut TcpStream) -> Result<()> {
    let _ = wire::read_body(stream, leftover, request.content_length())?;

    let tokens = request.query_tokens();
    let [disk_token, lsn_token] = tokens.as_slice() else {
        return wire::write_response(stream, 400, "Bad Request", &[], b"expected <disk>&<lsn>");
    };
    let disk = parse_disk_token(disk_token)?;
    let from_lsn: u64 = lsn_token
        .parse()
        .map_err(|_| Error::ProtocolViolation("malformed lsn in query string"))?;

    let Some(vdisk) = host.disk(&disk) else {
        return wire::write_response(stream, 404, "Not Found", &[], b"unknown volume");
    };

    wire::write_stream_header(stream, 200, "OK")?;
    let streamer = Streamer::new(Arc::clone(host.metalog()));
    streamer.serve(&vdisk, stream, from_lsn)
}

fn handle_get_lsn(host: &Arc<Host>, request: &Request, leftover: Vec<u8>, stream: &mut TcpStream) -> Result<()> {
    let _ = wire::read_body(stream, leftover, request.content_length())?;

    let Some(token) = request.query_tokens().into_iter().next() else {
        return wire::write_response(stream, 400, "Bad Request", &[], b"missing disk id");
    };
    let disk = parse_disk_token(token)?;

    let Some(vdisk) = host.disk(&disk) else {
        return wire::write_response(stream, 404, "Not Found", &[], b"unknown volume");
    };

    wire::write_response(stream, 200, "OK", &[("Content-Type", "text/plain".to_string())], vdisk.lsn().to_string().as_bytes())
}

fn handle_get_heads(host: &Arc<Host>, stream: &mut TcpStream) -> Result<()> {
    let mut body = String::new();
    for (base_id, head) in host.all_heads() {
        body.push_str(&format!("{}:{}\n", base_id.to_hex(), head.to_hex()));
    }
    wire::write_response(stream, 200, "OK", &[("Content-Type", "text/plain".to_string())], body.as_bytes())
}

fn handle_get_peers(
    host: &Arc<Host>,
    request: &Request,
    peer_addr: Option<std::net::SocketAddr>,
    stream: &mut TcpStream,
) -> Result<()> {
    if let Some(token) = request.query_tokens().into_iter().next() {
        let host_id = parse_host_token(token)?;
        if let Some(addr) = peer_addr {
            host.peers().record_peer(host_id, addr);
        }
    }

    let mut body = String::new();
    for (host_id, addr) in host.peers().all() {
        body.push_str(&format!("{host_id:016x} @ {addr}\n"));
    }
    wire::write_response(stream, 200, "OK", &[("Content-Type", "text/plain".to_string())], body.as_bytes())
}
