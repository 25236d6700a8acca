mod common;

use common::open_host_with;

#[test]
fn checkpoint_then_reopen_recovers_every_volume() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;

    let (first, second) = {
        let host = open_host_with(dir.path(), 1, |c| c)?;
        let created = host.new_disks(2)?;
        let (first, _) = created[0];
        let (second, _) = created[1];

        host.write(&first, 0, &[0x42u8; 512])?;
        host.write(&second, 10, &[0x43u8; 512])?;
        host.checkpoint()?;
        (first, second)
    };

    let reopened = open_host_with(dir.path(), 1, |c| c)?;
    assert_eq!(reopened.read(&first, 0, 1)?, vec![0x42u8; 512]);
    assert_eq!(reopened.read(&second, 10, 1)?, vec![0x43u8; 512]);
    Ok(())
}

#[test]
fn writes_after_the_last_checkpoint_replay_from_the_log_tail() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;

    let base_id = {
        let host = open_host_with(dir.path(), 1, |c| c)?;
        let (base_id, _secret) = host.new_disks(1)?[0];
        host.write(&base_id, 0, &[0x01u8; 512])?;
        host.checkpoint()?;
        // Not checkpointed: recovery must replay this from the log tail.
        host.write(&base_id, 0, &[0x02u8; 512])?;
        base_id
    };

    let reopened = open_host_with(dir.path(), 1, |c| c)?;
    assert_eq!(reopened.read(&base_id, 0, 1)?, vec![0x02u8; 512]);
    Ok(())
}

#[test]
fn recovered_head_continues_the_same_chain() -> cloudfs::Result<()> {
    let dir = tempfile::tempdir()?;

    let (base_id, head_before) = {
        let host = open_host_with(dir.path(), 1, |c| c)?;
        let (base_id, _secret) = host.new_disks(1)?[0];
        host.write(&base_id, 0, &[0x09u8; 512])?;
        host.checkpoint()?;
        (base_id, host.all_heads().into_iter().find(|(id, _)| *id == base_id).expect("volume present").1)
    };

    let reopened = open_host_with(dir.path(), 1, |c| c)?;
    let head_after = reopened.all_heads().into_iter().find(|(id, _)| *id == base_id).expect("volume present").1;
    assert_eq!(head_before, head_after);

    // The chain must still accept a further write after recovery, proving
    // the recovered state is actually writable and not just read-only.
    reopened.write(&base_id, 1, &[0x0Au8; 512])?;
    assert_eq!(reopened.read(&base_id, 1, 1)?, vec![0x0Au8; 512]);
    Ok(())
}
