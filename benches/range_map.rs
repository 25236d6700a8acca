use cloudfs::{Config, Host, InMemoryPeerDirectory};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::RngCore;
use std::sync::Arc;

/// 32 KiB paged-tree nodes (§3), enough slots for a few thousand range-map
/// entries without forcing a node reuse mid-benchmark.
const BTREE_REGION_BYTES: u64 = 32 * 1024 * 4096;

fn open_host(dir: &tempfile::TempDir) -> Host {
    let config = Config::new(dir.path().join("disk"))
        .segment_size_bytes(16 * 1024 * 1024)
        .max_segments(64)
        .btree_region_bytes(BTREE_REGION_BYTES);

    Host::open(config, 1, Arc::new(InMemoryPeerDirectory::new())).unwrap()
}

fn sequential_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential write");

    let block_counts = [1u16, 8, 32, 128];

    for &nblk in &block_counts {
        let dir = tempfile::tempdir().unwrap();
        let host = open_host(&dir);
        let (base_id, _secret) = host.new_disks(1).unwrap()[0];

        let mut rng = rand::thread_rng();
        let mut data = vec![0u8; usize::from(nblk) * 512];
        rng.fill_bytes(&mut data);

        let mut lba = 0u64;
        group.bench_function(format!("{nblk} blocks"), |b| {
            b.iter(|| {
                host.write(&base_id, lba, &data).unwrap();
                lba += u64::from(nblk);
            });
        });
    }
}

fn range_map_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("range map lookup");

    let dir = tempfile::tempdir().unwrap();
    let host = open_host(&dir);
    let (base_id, _secret) = host.new_disks(1).unwrap()[0];

    let data = vec![0x7au8; 512];
    let extent = 4096u64;
    for lba in 0..extent {
        host.write(&base_id, lba, &data).unwrap();
    }

    group.bench_function("buffered (ring hit)", |b| {
        b.iter(|| host.read(&base_id, extent - 1, 1).unwrap());
    });

    host.checkpoint().unwrap();

    group.bench_function("flushed (tree hit)", |b| {
        b.iter(|| host.read(&base_id, extent / 2, 1).unwrap());
    });
}

criterion_group!(benches, sequential_write, range_map_lookup);
criterion_main!(benches);
