mod common;

use common::open_host_with;

/// Repeatedly overwriting one block piles up obsolete copies of it in every
/// segment the log rolls through; after enough segments, GC should find at
/// least [`cloudfs`]'s minimum candidate count, copy the surviving (most
/// recent) value forward, and free the drained segments.
#[test]
fn gc_pass_reclaims_segments_and_preserves_the_live_value() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    // Small enough that a few hundred single-block writes roll through
    // several segments.
    let host = open_host_with(dir.path(), 1, |c| c.segment_size_bytes(64 * 1024).max_segments(32))?;
    let (base_id, _secret) = host.new_disks(1)?[0];

    let writes = 900;
    for i in 0..writes {
        let byte = (i % 256) as u8;
        host.write(&base_id, 0, &[byte; 512])?;
    }
    let last_byte = ((writes - 1) % 256) as u8;

    let report = host.run_gc_pass()?.expect("enough segments should have rolled to find candidates");
    assert!(!report.drained_segments.is_empty());
    assert!(report.blocks_dropped > 0, "repeated overwrites of one block should leave stale copies behind");

    assert_eq!(host.read(&base_id, 0, 1)?, vec![last_byte; 512]);
    Ok(())
}

#[test]
fn gc_pass_is_a_noop_on_a_freshly_opened_volume() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host_with(dir.path(), 1, |c| c)?;
    let (base_id, _secret) = host.new_disks(1)?[0];
    host.write(&base_id, 0, &[0x01u8; 512])?;

    assert!(host.run_gc_pass()?.is_none());
    Ok(())
}
