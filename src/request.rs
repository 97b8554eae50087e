//! Per-request call context.
//!
//! Every engine entry takes a [`Request`]: it identifies the operation for
//! lock-ownership transfer, records which node resources the request
//! currently holds (so re-entry from the back-end does not re-acquire them),
//! and carries the cancellation flag that every suspension point observes.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crate::node_lock::Acquire;
use crate::node_lock::OwnerTag;

/// Call context for one in-flight request.
#[derive(Debug)]
pub struct Request {
    id: u64,
    /// Resource flags this request holds right now.
    held: AtomicU8,
    /// Resource flags held at the point the engine called into the
    /// back-end; a re-entrant engine call must not re-acquire these.
    top: AtomicU8,
    canceled: AtomicBool,
}

impl Request {
    /// Create a context for request `id`.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Request {
            id,
            held: AtomicU8::new(0),
            top: AtomicU8::new(0),
            canceled: AtomicBool::new(false),
        }
    }

    /// The request id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The tag used for foreign lock release on this request's behalf.
    #[must_use]
    pub fn owner_tag(&self) -> OwnerTag {
        OwnerTag(self.id)
    }

    /// Mark the request canceled; blocked suspension points return
    /// [`crate::FsError::Canceled`] once they observe this.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Has the request been canceled?
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Resource flags this request currently holds.
    #[must_use]
    pub fn held(&self) -> Acquire {
        Acquire::from_bits_truncate(self.held.load(Ordering::Relaxed))
    }

    /// Reduce `wanted` to the flags this request still needs to acquire,
    /// masking off anything it already held when it last entered the
    /// engine from the back-end.
    pub(crate) fn wanted(&self, wanted: Acquire) -> Acquire {
        wanted - Acquire::from_bits_truncate(self.top.load(Ordering::Relaxed))
    }

    pub(crate) fn note_acquired(&self, flags: Acquire) {
        debug_assert!(
            (self.held() & flags).is_empty(),
            "request re-acquired node resources it already holds"
        );
        self.held.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn note_released(&self, flags: Acquire) {
        debug_assert!(
            self.held().contains(flags),
            "request released node resources it does not hold"
        );
        self.held.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    /// Mark the boundary of a back-end call: while the guard lives,
    /// re-entrant engine calls see the currently held flags as already
    /// owned and skip them.
    pub(crate) fn enter_backend(&self) -> BackendScope<'_> {
        let prev = self
            .top
            .swap(self.held.load(Ordering::Relaxed), Ordering::Relaxed);
        BackendScope { request: self, prev }
    }
}

/// Restores the re-entrancy mask when a back-end call returns.
pub(crate) struct BackendScope<'a> {
    request: &'a Request,
    prev: u8,
}

impl Drop for BackendScope<'_> {
    fn drop(&mut self) {
        self.request.top.store(self.prev, Ordering::Relaxed);
    }
}
