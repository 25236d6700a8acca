mod common;

use common::open_host;

#[test]
fn write_then_read_round_trips() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host(dir.path(), 1)?;
    let (base_id, _secret) = host.new_disks(1)?[0];

    let data = vec![0x5au8; 4 * 512];
    host.write(&base_id, 100, &data)?;
    assert_eq!(host.read(&base_id, 100, 4)?, data);
    Ok(())
}

#[test]
fn overwrite_narrows_to_zero_elides_but_reads_as_zero() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host(dir.path(), 1)?;
    let (base_id, _secret) = host.new_disks(1)?[0];

    host.write(&base_id, 0, &[0x11u8; 512])?;
    host.write(&base_id, 0, &[0u8; 512])?;
    assert_eq!(host.read(&base_id, 0, 1)?, vec![0u8; 512]);
    Ok(())
}

#[test]
fn unwritten_extents_read_as_zero() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host(dir.path(), 1)?;
    let (base_id, _secret) = host.new_disks(1)?[0];

    assert_eq!(host.read(&base_id, 9_000, 3)?, vec![0u8; 3 * 512]);
    Ok(())
}

#[test]
fn two_volumes_on_one_host_do_not_interfere() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host(dir.path(), 1)?;
    let created = host.new_disks(2)?;
    let (first, _) = created[0];
    let (second, _) = created[1];

    host.write(&first, 0, &[0xAAu8; 512])?;
    host.write(&second, 0, &[0xBBu8; 512])?;

    assert_eq!(host.read(&first, 0, 1)?, vec![0xAAu8; 512]);
    assert_eq!(host.read(&second, 0, 1)?, vec![0xBBu8; 512]);
    Ok(())
}

#[test]
fn writes_partially_overlapping_an_existing_run_split_correctly() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;
    let host = open_host(dir.path(), 1)?;
    let (base_id, _secret) = host.new_disks(1)?[0];

    host.write(&base_id, 0, &[0x01u8; 4 * 512])?;
    host.write(&base_id, 1, &[0x02u8; 2 * 512])?;

    let result = host.read(&base_id, 0, 4)?;
    assert_eq!(&result[0..512], &[0x01u8; 512][..]);
    assert_eq!(&result[512..1536], &[0x02u8; 1024][..]);
    assert_eq!(&result[1536..2048], &[0x01u8; 512][..]);
    Ok(())
}
