//! Advisory byte-range locks.
//!
//! Each file node owns a [`RangeLockTable`] with the classic semantics: an
//! exclusive lock conflicts with any overlapping lock, a shared lock
//! conflicts with overlapping exclusive locks held by other owners, and
//! waiters may block indefinitely (cancellation is the only way out).
//! Ranges unlock exactly as they were locked.

use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::FsError;
use crate::FsResult;
use crate::Request;

/// Identifies the logical owner of byte-range locks (in kernel terms, the
/// process/key pair; the transport supplies it).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LockOwner(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct LockRange {
    owner: LockOwner,
    handle: u64,
    offset: u64,
    length: u64,
    exclusive: bool,
}

impl LockRange {
    fn overlaps(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return false;
        }
        let self_end = self.offset.saturating_add(self.length);
        let other_end = offset.saturating_add(length);
        self.offset < other_end && offset < self_end
    }
}

/// Byte-range lock table for one node.
#[derive(Debug, Default)]
pub struct RangeLockTable {
    locks: Mutex<Vec<LockRange>>,
    unlocked: Condvar,
}

/// How long a blocked locker sleeps between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(50);

impl RangeLockTable {
    /// Acquire a lock over `[offset, offset+length)` for `owner` via handle
    /// `handle`. With `wait` false a conflict reports
    /// [`FsError::CantWait`]; with `wait` true the caller blocks until the
    /// conflicting locks go away or the request is canceled.
    pub fn lock(
        &self,
        req: &Request,
        handle: u64,
        owner: LockOwner,
        offset: u64,
        length: u64,
        exclusive: bool,
        wait: bool,
    ) -> FsResult<()> {
        if length == 0 {
            return Err(FsError::InvalidParameter);
        }
        let mut locks = self.locks.lock();
        loop {
            if !conflicts(&locks, owner, offset, length, exclusive) {
                locks.push(LockRange {
                    owner,
                    handle,
                    offset,
                    length,
                    exclusive,
                });
                return Ok(());
            }
            if !wait {
                return Err(FsError::CantWait);
            }
            if req.is_canceled() {
                return Err(FsError::Canceled);
            }
            self.unlocked.wait_for(&mut locks, CANCEL_POLL);
        }
    }

    /// Release the lock previously taken over exactly `[offset,
    /// offset+length)` by `owner`.
    pub fn unlock(&self, owner: LockOwner, offset: u64, length: u64) -> FsResult<()> {
        let mut locks = self.locks.lock();
        let position = locks
            .iter()
            .position(|l| l.owner == owner && l.offset == offset && l.length == length);
        match position {
            Some(index) => {
                locks.swap_remove(index);
                drop(locks);
                self.unlocked.notify_all();
                Ok(())
            }
            None => Err(FsError::RangeNotLocked),
        }
    }

    /// Drop every lock taken through `handle`; cleanup calls this when the
    /// handle goes away.
    pub fn unlock_all_by_handle(&self, handle: u64) {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|l| l.handle != handle);
        if locks.len() != before {
            drop(locks);
            self.unlocked.notify_all();
        }
    }

    /// Drop every lock held by `owner`.
    pub fn unlock_all_by_owner(&self, owner: LockOwner) {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|l| l.owner != owner);
        if locks.len() != before {
            drop(locks);
            self.unlocked.notify_all();
        }
    }

    /// May `owner` read `[offset, offset+length)`? Fails only on an
    /// overlapping exclusive lock held by someone else.
    #[must_use]
    pub fn check_read(&self, owner: LockOwner, offset: u64, length: u64) -> bool {
        let locks = self.locks.lock();
        !locks
            .iter()
            .any(|l| l.exclusive && l.owner != owner && l.overlaps(offset, length))
    }

    /// May `owner` write `[offset, offset+length)`? Every overlapping lock
    /// must be an exclusive lock held by `owner` itself.
    #[must_use]
    pub fn check_write(&self, owner: LockOwner, offset: u64, length: u64) -> bool {
        let locks = self.locks.lock();
        !locks
            .iter()
            .any(|l| l.overlaps(offset, length) && !(l.exclusive && l.owner == owner))
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// True when no locks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn conflicts(
    locks: &[LockRange],
    owner: LockOwner,
    offset: u64,
    length: u64,
    exclusive: bool,
) -> bool {
    locks.iter().any(|l| {
        if !l.overlaps(offset, length) {
            return false;
        }
        if exclusive {
            // an exclusive request conflicts with any overlapping lock
            true
        } else {
            // a shared request conflicts with foreign exclusive locks
            l.exclusive && l.owner != owner
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const FH: u64 = 1;

    #[test]
    fn shared_locks_stack() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 0, 100, false, false)
            .unwrap();
        table
            .lock(&req, FH, LockOwner(2), 50, 100, false, false)
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn exclusive_conflicts_with_any_overlap() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 0, 100, false, false)
            .unwrap();
        assert_eq!(
            table.lock(&req, FH, LockOwner(1), 50, 100, true, false),
            Err(FsError::CantWait)
        );
        // non-overlapping exclusive is fine
        table
            .lock(&req, FH, LockOwner(1), 100, 100, true, false)
            .unwrap();
    }

    #[test]
    fn shared_over_own_exclusive_is_allowed() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 0, 100, true, false)
            .unwrap();
        table
            .lock(&req, FH, LockOwner(1), 0, 100, false, false)
            .unwrap();
        assert_eq!(
            table.lock(&req, FH, LockOwner(2), 0, 1, false, false),
            Err(FsError::CantWait)
        );
    }

    #[test]
    fn unlock_requires_exact_range() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 10, 20, true, false)
            .unwrap();
        assert_eq!(
            table.unlock(LockOwner(1), 10, 19),
            Err(FsError::RangeNotLocked)
        );
        assert_eq!(
            table.unlock(LockOwner(2), 10, 20),
            Err(FsError::RangeNotLocked)
        );
        table.unlock(LockOwner(1), 10, 20).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn read_write_checks() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 0, 100, true, false)
            .unwrap();
        assert!(table.check_read(LockOwner(1), 0, 10));
        assert!(!table.check_read(LockOwner(2), 0, 10));
        assert!(table.check_write(LockOwner(1), 0, 10));
        assert!(!table.check_write(LockOwner(2), 0, 10));
        assert!(table.check_write(LockOwner(2), 200, 10));

        table.unlock(LockOwner(1), 0, 100).unwrap();
        table
            .lock(&req, FH, LockOwner(1), 0, 100, false, false)
            .unwrap();
        // shared lock: anyone reads, nobody writes (not even the owner)
        assert!(table.check_read(LockOwner(2), 0, 10));
        assert!(!table.check_write(LockOwner(1), 0, 10));
    }

    #[test]
    fn blocked_locker_wakes_on_unlock() {
        let table = Arc::new(RangeLockTable::default());
        let req = Request::new(1);
        table
            .lock(&req, FH, LockOwner(1), 0, 100, true, false)
            .unwrap();

        let table2 = Arc::clone(&table);
        let waiter = thread::spawn(move || {
            let req = Request::new(2);
            table2.lock(&req, 2, LockOwner(2), 0, 100, true, true)
        });

        thread::sleep(Duration::from_millis(20));
        table.unlock(LockOwner(1), 0, 100).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn blocked_locker_observes_cancel() {
        let table = Arc::new(RangeLockTable::default());
        let setup = Request::new(1);
        table
            .lock(&setup, FH, LockOwner(1), 0, 100, true, false)
            .unwrap();

        let req = Arc::new(Request::new(2));
        let req2 = Arc::clone(&req);
        let table2 = Arc::clone(&table);
        let waiter =
            thread::spawn(move || table2.lock(&req2, 2, LockOwner(2), 0, 100, true, true));

        thread::sleep(Duration::from_millis(20));
        req.cancel();
        assert_eq!(waiter.join().unwrap(), Err(FsError::Canceled));
    }

    #[test]
    fn handle_cleanup_drops_locks() {
        let table = RangeLockTable::default();
        let req = Request::new(1);
        table
            .lock(&req, 7, LockOwner(1), 0, 10, true, false)
            .unwrap();
        table
            .lock(&req, 7, LockOwner(1), 20, 10, false, false)
            .unwrap();
        table
            .lock(&req, 8, LockOwner(2), 40, 10, true, false)
            .unwrap();
        table.unlock_all_by_handle(7);
        assert_eq!(table.len(), 1);
        assert!(!table.check_write(LockOwner(1), 40, 5));
    }
}
