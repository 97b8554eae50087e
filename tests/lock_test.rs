//! Byte-range locks through the dispatch surface.

mod common;

use common::close;
use common::create_file;
use common::open_file;
use common::req;
use common::rw_access;
use common::volume;
use userfs::FsError;
use userfs::LockOwner;
use userfs::Operation;
use userfs::Reply;
use userfs::ShareMode;

fn lock_op(fh: userfs::FileHandle, owner: u64, offset: u64, length: u64, exclusive: bool) -> Operation<'static> {
    Operation::Lock {
        fh,
        owner: LockOwner(owner),
        offset,
        length,
        exclusive,
        wait: false,
    }
}

#[test]
fn exclusive_locks_exclude_and_unlock_releases() {
    let vol = volume();
    let (fh1, _) = create_file(&vol, "\\f").unwrap();
    let (fh2, _) = open_file(&vol, "\\f", rw_access(), ShareMode::all()).unwrap();
    let request = req();

    vol.dispatch(&request, lock_op(fh1, 1, 0, 100, true)).unwrap();
    assert_eq!(
        vol.dispatch(&request, lock_op(fh2, 2, 50, 100, true)).err(),
        Some(FsError::CantWait)
    );
    // disjoint range is fine
    vol.dispatch(&request, lock_op(fh2, 2, 100, 100, true)).unwrap();

    vol.dispatch(
        &request,
        Operation::Unlock {
            fh: fh1,
            owner: LockOwner(1),
            offset: 0,
            length: 100,
        },
    )
    .unwrap();
    vol.dispatch(&request, lock_op(fh2, 2, 50, 50, true)).unwrap();

    close(&vol, fh2);
    close(&vol, fh1);
}

#[test]
fn unlock_of_a_foreign_or_inexact_range_fails() {
    let vol = volume();
    let (fh, _) = create_file(&vol, "\\f").unwrap();
    let request = req();
    vol.dispatch(&request, lock_op(fh, 1, 10, 20, true)).unwrap();

    assert_eq!(
        vol.dispatch(
            &request,
            Operation::Unlock {
                fh,
                owner: LockOwner(2),
                offset: 10,
                length: 20,
            },
        )
        .err(),
        Some(FsError::RangeNotLocked)
    );
    assert_eq!(
        vol.dispatch(
            &request,
            Operation::Unlock {
                fh,
                owner: LockOwner(1),
                offset: 10,
                length: 21,
            },
        )
        .err(),
        Some(FsError::RangeNotLocked)
    );
    close(&vol, fh);
}

#[test]
fn locked_ranges_gate_read_and_write() {
    let vol = volume();
    let (fh1, _) = create_file(&vol, "\\f").unwrap();
    let (fh2, _) = open_file(&vol, "\\f", rw_access(), ShareMode::all()).unwrap();
    let request = req();
    vol.write(&request, fh1, Some(0), &[7u8; 128], false, LockOwner(1))
        .unwrap();

    vol.dispatch(&request, lock_op(fh1, 1, 0, 64, true)).unwrap();

    // the owner reads and writes its own exclusive range
    vol.read(&request, fh1, 0, 16, LockOwner(1)).unwrap();
    vol.write(&request, fh1, Some(0), b"x", false, LockOwner(1))
        .unwrap();

    // everyone else is locked out
    assert_eq!(
        vol.read(&request, fh2, 0, 16, LockOwner(2)),
        Err(FsError::LockConflict)
    );
    assert_eq!(
        vol.write(&request, fh2, Some(0), b"y", false, LockOwner(2)),
        Err(FsError::LockConflict)
    );
    // but the unlocked tail is accessible
    vol.read(&request, fh2, 64, 16, LockOwner(2)).unwrap();

    close(&vol, fh2);
    close(&vol, fh1);
}

#[test]
fn shared_locks_allow_readers_and_block_writers() {
    let vol = volume();
    let (fh1, _) = create_file(&vol, "\\f").unwrap();
    let (fh2, _) = open_file(&vol, "\\f", rw_access(), ShareMode::all()).unwrap();
    let request = req();
    vol.write(&request, fh1, Some(0), &[1u8; 32], false, LockOwner(1))
        .unwrap();

    vol.dispatch(&request, lock_op(fh1, 1, 0, 32, false)).unwrap();
    vol.dispatch(&request, lock_op(fh2, 2, 0, 32, false)).unwrap();

    vol.read(&request, fh2, 0, 8, LockOwner(2)).unwrap();
    assert_eq!(
        vol.write(&request, fh1, Some(0), b"z", false, LockOwner(1)),
        Err(FsError::LockConflict)
    );

    close(&vol, fh2);
    close(&vol, fh1);
}

#[test]
fn cleanup_drops_the_handles_locks() {
    let vol = volume();
    let (fh1, _) = create_file(&vol, "\\f").unwrap();
    let (fh2, _) = open_file(&vol, "\\f", rw_access(), ShareMode::all()).unwrap();
    let request = req();

    vol.dispatch(&request, lock_op(fh1, 1, 0, 100, true)).unwrap();
    assert_eq!(
        vol.dispatch(&request, lock_op(fh2, 2, 0, 100, true)).err(),
        Some(FsError::CantWait)
    );

    // retiring the locking handle frees the range
    close(&vol, fh1);
    vol.dispatch(&request, lock_op(fh2, 2, 0, 100, true)).unwrap();
    close(&vol, fh2);
}

#[test]
fn stream_locks_live_on_the_shared_identity() {
    // byte-range locks redirect to the main file, so a stream lock and a
    // main-file lock collide
    let vol = volume();
    let (main_fh, _) = create_file(&vol, "\\a").unwrap();
    let (s_fh, _) = create_file(&vol, "\\a:s").unwrap();
    let request = req();

    vol.dispatch(&request, lock_op(main_fh, 1, 0, 10, true)).unwrap();
    assert_eq!(
        vol.dispatch(&request, lock_op(s_fh, 2, 5, 10, true)).err(),
        Some(FsError::CantWait)
    );

    close(&vol, s_fh);
    close(&vol, main_fh);
}

#[test]
fn reply_shape() {
    let vol = volume();
    let (fh, _) = create_file(&vol, "\\f").unwrap();
    let request = req();
    assert!(matches!(
        vol.dispatch(&request, lock_op(fh, 1, 0, 10, true)),
        Ok(Reply::Empty)
    ));
    close(&vol, fh);
}
