//! Opportunistic lock state.
//!
//! Each node owns one [`Oplock`]; stream nodes additionally consult their
//! main file's oplock on create paths. The engine's job is routing: create
//! checks that may suspend while a break completes, break fan-out on
//! rename/overwrite descendants, and handle-gone notification on cleanup.
//! The grant/break protocol below follows the classic model: exclusive
//! levels (Level1, Batch, Filter, ReadWrite, ReadWriteHandle) break to a
//! shared level or to none and require acknowledgment; Level2/Read break
//! immediately without one.

use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::FsError;
use crate::FsResult;
use crate::Request;

/// Oplock levels, legacy and cache-flavored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OplockLevel {
    /// No oplock granted.
    #[default]
    None,
    /// Shared read caching (legacy level 2).
    Level2,
    /// Exclusive read/write caching (legacy level 1).
    Level1,
    /// Exclusive caching including handle caching (legacy batch).
    Batch,
    /// Filter oplock.
    Filter,
    /// Read cache.
    Read,
    /// Read + handle cache.
    ReadHandle,
    /// Read + write cache.
    ReadWrite,
    /// Read + write + handle cache.
    ReadWriteHandle,
}

impl OplockLevel {
    /// Levels that grant exclusive caching and therefore require a broken
    /// acknowledgment before conflicting operations proceed.
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            OplockLevel::Level1
                | OplockLevel::Batch
                | OplockLevel::Filter
                | OplockLevel::ReadWrite
                | OplockLevel::ReadWriteHandle
        )
    }

    /// Levels that cache the handle itself (closes are deferred by the
    /// holder).
    #[must_use]
    pub fn caches_handle(self) -> bool {
        matches!(
            self,
            OplockLevel::Batch | OplockLevel::ReadHandle | OplockLevel::ReadWriteHandle
        )
    }

    /// The level an exclusive grant breaks down to when another opener
    /// arrives.
    #[must_use]
    fn break_target(self) -> OplockLevel {
        match self {
            OplockLevel::Level1 => OplockLevel::Level2,
            OplockLevel::ReadWrite | OplockLevel::ReadWriteHandle => OplockLevel::Read,
            _ => OplockLevel::None,
        }
    }

    /// The level a handle break leaves behind.
    fn handle_break_target(self) -> OplockLevel {
        match self {
            OplockLevel::ReadHandle => OplockLevel::Read,
            OplockLevel::ReadWriteHandle => OplockLevel::ReadWrite,
            _ => OplockLevel::None,
        }
    }
}

#[derive(Debug, Default)]
struct OplockState {
    level: OplockLevel,
    holders: Vec<u64>,
    breaking_to: Option<OplockLevel>,
}

/// Oplock bookkeeping for one node.
#[derive(Debug, Default)]
pub struct Oplock {
    state: Mutex<OplockState>,
    acked: Condvar,
}

const CANCEL_POLL: Duration = Duration::from_millis(50);

impl Oplock {
    /// Request an oplock at `level` on behalf of handle `handle`.
    /// `open_handles` is the node's current handle count; exclusive levels
    /// are refused while other handles exist.
    pub fn request(&self, handle: u64, level: OplockLevel, open_handles: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.breaking_to.is_some() {
            return Err(FsError::OplockNotGranted);
        }
        match level {
            OplockLevel::None => Err(FsError::InvalidParameter),
            OplockLevel::Level2 | OplockLevel::Read | OplockLevel::ReadHandle => {
                if state.level.is_exclusive() && state.holders != [handle] {
                    return Err(FsError::OplockNotGranted);
                }
                if !state.holders.contains(&handle) {
                    state.holders.push(handle);
                }
                state.level = level;
                Ok(())
            }
            _ => {
                debug_assert!(level.is_exclusive());
                if open_handles > 1 || !(state.holders.is_empty() || state.holders == [handle]) {
                    return Err(FsError::OplockNotGranted);
                }
                state.holders = vec![handle];
                state.level = level;
                Ok(())
            }
        }
    }

    /// Route an operation that conflicts with exclusive caching through the
    /// oplock. With `complete_if_oplocked` the call initiates the break (if
    /// any) and reports [`FsError::OplockBreakInProgress`] without waiting;
    /// otherwise it blocks until the holder acknowledges or the request is
    /// canceled.
    pub fn check(&self, req: &Request, complete_if_oplocked: bool) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.breaking_to.is_none() {
            if !state.level.is_exclusive() {
                return Ok(());
            }
            state.breaking_to = Some(state.level.break_target());
        }
        if complete_if_oplocked {
            return Err(FsError::OplockBreakInProgress);
        }
        while state.breaking_to.is_some() {
            if req.is_canceled() {
                return Err(FsError::Canceled);
            }
            self.acked.wait_for(&mut state, CANCEL_POLL);
        }
        Ok(())
    }

    /// Break handle caching (ReadHandle/ReadWriteHandle); same completion
    /// contract as [`Oplock::check`].
    pub fn break_handle(&self, req: &Request, complete_if_oplocked: bool) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.breaking_to.is_none() {
            if !state.level.caches_handle() {
                return Ok(());
            }
            state.breaking_to = Some(state.level.handle_break_target());
        }
        if complete_if_oplocked {
            return Err(FsError::OplockBreakInProgress);
        }
        while state.breaking_to.is_some() {
            if req.is_canceled() {
                return Err(FsError::Canceled);
            }
            self.acked.wait_for(&mut state, CANCEL_POLL);
        }
        Ok(())
    }

    /// Break a shared (Level2/Read) grant; no acknowledgment needed.
    pub fn break_shared(&self) {
        let mut state = self.state.lock();
        if matches!(state.level, OplockLevel::Level2 | OplockLevel::Read)
            && state.breaking_to.is_none()
        {
            state.level = OplockLevel::None;
            state.holders.clear();
        }
    }

    /// The holder acknowledges an in-progress break, optionally refusing
    /// the offered level down to none.
    pub fn acknowledge(&self, handle: u64, accept_level: bool) -> FsResult<()> {
        let mut state = self.state.lock();
        let Some(target) = state.breaking_to.take() else {
            return Err(FsError::InvalidParameter);
        };
        if !state.holders.contains(&handle) {
            state.breaking_to = Some(target);
            return Err(FsError::InvalidParameter);
        }
        state.level = if accept_level { target } else { OplockLevel::None };
        if state.level == OplockLevel::None {
            state.holders.clear();
        }
        drop(state);
        self.acked.notify_all();
        Ok(())
    }

    /// A handle is going away; drop its grants and complete any break it
    /// was holding up.
    pub fn on_cleanup(&self, handle: u64) {
        let mut state = self.state.lock();
        state.holders.retain(|&h| h != handle);
        if state.holders.is_empty() {
            state.level = OplockLevel::None;
            state.breaking_to = None;
            drop(state);
            self.acked.notify_all();
        }
    }

    /// Current level.
    #[must_use]
    pub fn level(&self) -> OplockLevel {
        self.state.lock().level
    }

    /// Is a Batch oplock in force?
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.state.lock().level == OplockLevel::Batch
    }

    /// Is a handle-caching (non-batch) oplock in force?
    #[must_use]
    pub fn is_handle(&self) -> bool {
        matches!(
            self.state.lock().level,
            OplockLevel::ReadHandle | OplockLevel::ReadWriteHandle
        )
    }

    /// Is a break waiting for acknowledgment?
    #[must_use]
    pub fn break_in_progress(&self) -> bool {
        self.state.lock().breaking_to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn grant_and_refuse() {
        let oplock = Oplock::default();
        oplock.request(1, OplockLevel::Batch, 1).unwrap();
        assert!(oplock.is_batch());
        // a second handle cannot take an exclusive grant
        assert_eq!(
            oplock.request(2, OplockLevel::Level1, 2),
            Err(FsError::OplockNotGranted)
        );
    }

    #[test]
    fn check_initiates_break_and_ack_completes_it() {
        let oplock = Oplock::default();
        let req = Request::new(1);
        oplock.request(1, OplockLevel::Level1, 1).unwrap();

        assert_eq!(
            oplock.check(&req, true),
            Err(FsError::OplockBreakInProgress)
        );
        assert!(oplock.break_in_progress());

        oplock.acknowledge(1, true).unwrap();
        assert!(!oplock.break_in_progress());
        assert_eq!(oplock.level(), OplockLevel::Level2);
        assert_eq!(oplock.check(&req, true), Ok(()));
    }

    #[test]
    fn waiting_check_unblocks_on_ack() {
        let oplock = Arc::new(Oplock::default());
        oplock.request(1, OplockLevel::ReadWrite, 1).unwrap();

        let oplock2 = Arc::clone(&oplock);
        let waiter = thread::spawn(move || {
            let req = Request::new(2);
            oplock2.check(&req, false)
        });

        thread::sleep(Duration::from_millis(20));
        assert!(oplock.break_in_progress());
        oplock.acknowledge(1, true).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(oplock.level(), OplockLevel::Read);
    }

    #[test]
    fn handle_break() {
        let oplock = Oplock::default();
        let req = Request::new(1);
        oplock.request(1, OplockLevel::ReadWriteHandle, 1).unwrap();
        assert!(oplock.is_handle());

        assert_eq!(
            oplock.break_handle(&req, true),
            Err(FsError::OplockBreakInProgress)
        );
        oplock.acknowledge(1, true).unwrap();
        assert_eq!(oplock.level(), OplockLevel::ReadWrite);
        assert!(!oplock.is_handle());
    }

    #[test]
    fn cleanup_completes_pending_break() {
        let oplock = Arc::new(Oplock::default());
        oplock.request(1, OplockLevel::Batch, 1).unwrap();

        let oplock2 = Arc::clone(&oplock);
        let waiter = thread::spawn(move || {
            let req = Request::new(2);
            oplock2.check(&req, false)
        });

        thread::sleep(Duration::from_millis(20));
        // the holder closes instead of acknowledging
        oplock.on_cleanup(1);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(oplock.level(), OplockLevel::None);
    }

    #[test]
    fn shared_break_needs_no_ack() {
        let oplock = Oplock::default();
        oplock.request(1, OplockLevel::Level2, 1).unwrap();
        oplock.request(2, OplockLevel::Level2, 2).unwrap();
        oplock.break_shared();
        assert_eq!(oplock.level(), OplockLevel::None);
        assert!(!oplock.break_in_progress());
    }

    #[test]
    fn ack_without_break_is_a_protocol_error() {
        let oplock = Oplock::default();
        oplock.request(1, OplockLevel::Level1, 1).unwrap();
        assert_eq!(oplock.acknowledge(1, true), Err(FsError::InvalidParameter));
    }
}
