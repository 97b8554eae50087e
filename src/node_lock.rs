//! Two-level node locking.
//!
//! Every file node carries a *main* resource (metadata, name, attributes)
//! and a *paging-I/O* resource (data below the caching layer). Lock order is
//! always Main before Pgio; acquisitions on a stream node transparently
//! redirect to its main file, so the protocol is per-identity rather than
//! per-stream.
//!
//! The resources are built over raw reader/writer locks rather than guard
//! types because the engine needs two things guards cannot express: release
//! of an exclusive hold by a *different* thread than the acquirer (ownership
//! is transferred to a completion routine via an [`OwnerTag`]), and
//! release-before-wait sequences where a failure path unwinds locks in
//! reverse order mid-function.

use bitflags::bitflags;
use parking_lot::Mutex;
use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::lock_api::RawRwLockDowngrade as _;

bitflags! {
    /// Which of the two node resources an operation holds or wants.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Acquire: u8 {
        /// The main resource.
        const MAIN = 1;
        /// The paging-I/O resource.
        const PGIO = 2;
        /// Both, acquired Main first.
        const FULL = 3;
    }
}

/// Opaque tag identifying the logical owner of an exclusive hold, so a
/// completion routine on another thread can release a lock the request
/// thread acquired. Derived from the request id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OwnerTag(pub u64);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Mode {
    #[default]
    Unlocked,
    Shared(u32),
    Exclusive,
}

#[derive(Debug, Default)]
struct ResourceState {
    mode: Mode,
    owner: Option<OwnerTag>,
}

/// One reader/writer resource of a node.
///
/// All acquire/release traffic flows through these methods, which maintain
/// the mode book-keeping that makes the raw unlock calls sound.
pub(crate) struct NodeResource {
    raw: RawRwLock,
    state: Mutex<ResourceState>,
}

impl std::fmt::Debug for NodeResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeResource")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Default for NodeResource {
    fn default() -> Self {
        NodeResource {
            raw: RawRwLock::INIT,
            state: Mutex::new(ResourceState::default()),
        }
    }
}

impl NodeResource {
    pub(crate) fn acquire_shared(&self) {
        self.raw.lock_shared();
        self.note_shared();
    }

    pub(crate) fn try_acquire_shared(&self) -> bool {
        if self.raw.try_lock_shared() {
            self.note_shared();
            true
        } else {
            false
        }
    }

    pub(crate) fn acquire_exclusive(&self) {
        self.raw.lock_exclusive();
        self.note_exclusive();
    }

    pub(crate) fn try_acquire_exclusive(&self) -> bool {
        if self.raw.try_lock_exclusive() {
            self.note_exclusive();
            true
        } else {
            false
        }
    }

    /// Downgrade an exclusive hold to shared without releasing.
    pub(crate) fn downgrade(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Exclusive);
        state.mode = Mode::Shared(1);
        state.owner = None;
        // SAFETY: the state book-keeping above witnessed an exclusive hold
        unsafe { self.raw.downgrade() };
    }

    /// Release one hold, whichever mode it was taken in.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        match state.mode {
            Mode::Shared(1) => {
                state.mode = Mode::Unlocked;
                // SAFETY: mode witnessed a shared hold
                unsafe { self.raw.unlock_shared() };
            }
            Mode::Shared(n) => {
                state.mode = Mode::Shared(n - 1);
                // SAFETY: mode witnessed a shared hold
                unsafe { self.raw.unlock_shared() };
            }
            Mode::Exclusive => {
                state.mode = Mode::Unlocked;
                state.owner = None;
                // SAFETY: mode witnessed the exclusive hold
                unsafe { self.raw.unlock_exclusive() };
            }
            Mode::Unlocked => unreachable!("release of an unheld node resource"),
        }
    }

    /// Tag the current exclusive hold so another thread may release it.
    pub(crate) fn set_owner(&self, tag: OwnerTag) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Exclusive);
        state.owner = Some(tag);
    }

    /// Release a hold on behalf of `tag`. Falls back to a plain release
    /// when the hold was never tagged (the completion ran on the acquiring
    /// thread after all).
    pub(crate) fn release_owner(&self, tag: OwnerTag) {
        {
            let state = self.state.lock();
            if state.owner.is_some() {
                assert_eq!(state.owner, Some(tag), "foreign release with wrong owner tag");
            }
        }
        self.release();
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().mode != Mode::Unlocked
    }

    fn note_shared(&self) {
        let mut state = self.state.lock();
        state.mode = match state.mode {
            Mode::Unlocked => Mode::Shared(1),
            Mode::Shared(n) => Mode::Shared(n + 1),
            Mode::Exclusive => unreachable!("shared acquire while exclusive"),
        };
    }

    fn note_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Unlocked);
        state.mode = Mode::Exclusive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_excludes_exclusive() {
        let res = NodeResource::default();
        res.acquire_shared();
        assert!(res.try_acquire_shared());
        assert!(!res.try_acquire_exclusive());
        res.release();
        assert!(!res.try_acquire_exclusive());
        res.release();
        assert!(res.try_acquire_exclusive());
        res.release();
        assert!(!res.is_locked());
    }

    #[test]
    fn downgrade_admits_readers() {
        let res = NodeResource::default();
        res.acquire_exclusive();
        assert!(!res.try_acquire_shared());
        res.downgrade();
        assert!(res.try_acquire_shared());
        res.release();
        res.release();
    }

    #[test]
    fn owner_transfer_releases_on_another_thread() {
        let res = Arc::new(NodeResource::default());
        let tag = OwnerTag(42);
        res.acquire_exclusive();
        res.set_owner(tag);

        let res2 = Arc::clone(&res);
        thread::spawn(move || res2.release_owner(tag))
            .join()
            .unwrap();

        assert!(res.try_acquire_exclusive());
        res.release();
    }
}
