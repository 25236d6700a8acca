//! The `cloudfs-host` binary: a thin wrapper over [`cloudfs::Host`].
//!
//! Per the specification, the control-plane CLI is deliberately out of the
//! core's scope — everything below is a minimal demo harness, not a
//! production operator tool. `serve` opens a disk and runs the §6 HTTP route
//! table forever; the other subcommands each open the disk, perform one
//! local operation, and exit, which is enough to drive the end-to-end
//! scenarios in §8 by hand from a shell.

use cloudfs::{Config, Host, InMemoryPeerDirectory};
use std::sync::Arc;

fn usage() -> ! {
    eprintln!(
        "usage:\n  \
         cloudfs-host serve <disk-path> <host-id-hex> <listen-addr>\n  \
         cloudfs-host newdisk <disk-path> <host-id-hex> [count]\n  \
         cloudfs-host force <disk-path> <host-id-hex> <disk-hex> <excluded-host-hex>\n  \
         cloudfs-host setsecret <disk-path> <host-id-hex> <disk-hex> <secret-hex> <secret-view-hex>"
    );
    std::process::exit(2);
}

fn parse_host_id(s: &str) -> u64 {
    u64::from_str_radix(s, 16).unwrap_or_else(|_| usage())
}

fn open_host(disk_path: &str, host_id_hex: &str) -> cloudfs::Result<Host> {
    let config = Config::new(disk_path);
    let peers = Arc::new(InMemoryPeerDirectory::new());
    Host::open(config, parse_host_id(host_id_hex), peers)
}

fn main() -> cloudfs::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else { usage() };

    match command.as_str() {
        "serve" => {
            let [_, _, disk_path, host_id_hex, addr] = args.as_slice() else {
                usage()
            };
            let host = Arc::new(open_host(disk_path, host_id_hex)?);
            cloudfs::server::serve(host, addr)
        }
        "newdisk" => {
            let (disk_path, host_id_hex, count) = match args.as_slice() {
                [_, _, disk_path, host_id_hex] => (disk_path, host_id_hex, 1usize),
                [_, _, disk_path, host_id_hex, count] => {
                    (disk_path, host_id_hex, count.parse().unwrap_or_else(|_| usage()))
                }
                _ => usage(),
            };
            let host = open_host(disk_path, host_id_hex)?;
            for (base_id, _secret) in host.new_disks(count)? {
                println!("{}", base_id.to_hex());
            }
            Ok(())
        }
        "force" => {
            let [_, _, disk_path, host_id_hex, disk_hex, excluded_host_hex] = args.as_slice() else {
                usage()
            };
            let host = open_host(disk_path, host_id_hex)?;
            let disk = cloudfs::Hash::from_hex(disk_hex).ok_or(cloudfs::Error::Validation("bad disk id"))?;
            host.force_view(&disk, parse_host_id(excluded_host_hex))
        }
        "setsecret" => {
            let [_, _, disk_path, host_id_hex, disk_hex, secret_hex, secret_view_hex] = args.as_slice() else {
                usage()
            };
            let host = open_host(disk_path, host_id_hex)?;
            let disk = cloudfs::Hash::from_hex(disk_hex).ok_or(cloudfs::Error::Validation("bad disk id"))?;
            let secret = cloudfs::Hash::from_hex(secret_hex).ok_or(cloudfs::Error::Validation("bad secret"))?;
            let secret_view =
                cloudfs::Hash::from_hex(secret_view_hex).ok_or(cloudfs::Error::Validation("bad secret view"))?;
            host.set_secret(&disk, secret, secret_view)
        }
        _ => usage(),
    }
}
