mod common;

use vmfsio::metadata::{metadata_lock, metadata_unlock, LOCK_EXCLUSIVE};
use vmfsio::{BlockAddr, BlockStatus, BlockType, VmfsError};

#[test]
fn concurrent_hosts_contend_on_one_entry() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs_a = common::open_fs(&paths);
    let fs_b = common::open_fs(&paths);
    assert_ne!(fs_a.host_uuid(), fs_b.host_uuid());

    let sb = BlockAddr::Sb { entry: 0, item: 0 }.encode();

    // Host A takes the lock on the entry governing the block.
    let mut entry = fs_a.sbc.get_entry(&fs_a, 0, 0).unwrap();
    metadata_lock(&fs_a, &mut entry.mdh).unwrap();

    // Host B cannot modify anything under that entry.
    assert!(matches!(
        fs_b.alloc_specified(sb),
        Err(VmfsError::LockContended)
    ));

    // Once A releases, B goes through.
    metadata_unlock(&fs_a, &mut entry.mdh).unwrap();
    fs_b.alloc_specified(sb).unwrap();
    assert_eq!(fs_a.get_status(sb).unwrap(), BlockStatus::Allocated);
}

#[test]
fn allocation_skips_entries_locked_by_other_hosts() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs_a = common::open_fs(&paths);
    let fs_b = common::open_fs(&paths);

    let mut entry = fs_a.sbc.get_entry(&fs_a, 0, 0).unwrap();
    metadata_lock(&fs_a, &mut entry.mdh).unwrap();

    // B's allocator walks past the contended entry.
    let id = fs_b.alloc(BlockType::Sb).unwrap();
    match id.decode().unwrap() {
        BlockAddr::Sb { entry, .. } => assert_eq!(entry, 1),
        other => panic!("expected a sub-block, got {other:?}"),
    }

    metadata_unlock(&fs_a, &mut entry.mdh).unwrap();
}

#[test]
fn lock_state_round_trips_on_disk() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs_a = common::open_fs(&paths);
    let fs_b = common::open_fs(&paths);

    let before = fs_b.sbc.get_entry(&fs_b, 0, 0).unwrap();

    let mut entry = fs_a.sbc.get_entry(&fs_a, 0, 0).unwrap();
    metadata_lock(&fs_a, &mut entry.mdh).unwrap();

    // Another host observes the held lock on disk.
    let held = fs_b.sbc.get_entry(&fs_b, 0, 0).unwrap();
    assert_eq!(held.mdh.lock_state, LOCK_EXCLUSIVE);
    assert_eq!(held.mdh.owner, Some(fs_a.host_uuid()));
    assert_eq!(held.mdh.gen, before.mdh.gen + 1);
    assert_eq!(held.mdh.lock_counter, before.mdh.lock_counter + 1);

    metadata_unlock(&fs_a, &mut entry.mdh).unwrap();

    let released = fs_b.sbc.get_entry(&fs_b, 0, 0).unwrap();
    assert!(!released.mdh.is_locked());
    assert_eq!(released.mdh.owner, None);
    assert_eq!(released.mdh.gen, before.mdh.gen + 2);
}

#[test]
fn the_owner_may_reacquire_its_own_lock() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let mut entry = fs.sbc.get_entry(&fs, 0, 0).unwrap();
    metadata_lock(&fs, &mut entry.mdh).unwrap();
    let first_counter = entry.mdh.lock_counter;

    metadata_lock(&fs, &mut entry.mdh).unwrap();
    assert_eq!(entry.mdh.lock_counter, first_counter + 1);

    metadata_unlock(&fs, &mut entry.mdh).unwrap();
}

#[test]
fn contention_leaves_the_entry_consistent() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs_a = common::open_fs(&paths);
    let fs_b = common::open_fs(&paths);

    let sb = BlockAddr::Sb { entry: 2, item: 4 }.encode();

    let mut entry = fs_a.sbc.get_entry(&fs_a, 2, 0).unwrap();
    metadata_lock(&fs_a, &mut entry.mdh).unwrap();

    assert!(matches!(
        fs_b.alloc_specified(sb),
        Err(VmfsError::LockContended)
    ));
    // The failed attempt changed nothing.
    assert_eq!(fs_a.get_status(sb).unwrap(), BlockStatus::Free);

    metadata_unlock(&fs_a, &mut entry.mdh).unwrap();
    assert_eq!(fs_b.get_status(sb).unwrap(), BlockStatus::Free);
}
