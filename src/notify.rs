//! Directory-change watchers.
//!
//! A watcher subscribes against a directory with a filter mask and
//! optionally the whole subtree. Reported changes are matched by parent
//! directory, intersected with the filter, and queued per watcher; the
//! transport drains the queues and delivers them in batches. A bounded
//! queue that overflows degrades to a single "re-enumerate" signal, the
//! way kernel change notification does.

use std::collections::VecDeque;

use log::debug;
use parking_lot::Mutex;

use crate::FsError;
use crate::FsResult;
use crate::NotifyAction;
use crate::NotifyFilter;
use crate::path;

/// Queued events per watcher before degradation to overflow.
const QUEUE_LIMIT: usize = 1024;

/// One reported change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeEvent {
    /// Full canonical name of the changed file.
    pub name: String,
    /// Byte offset of the changed file's name within `name` (the part
    /// relative to the watched directory's child).
    pub name_offset: usize,
    /// Which filter bits fired.
    pub filter: NotifyFilter,
    /// What happened.
    pub action: NotifyAction,
}

/// What a drain hands back to the transport.
#[derive(Debug, Eq, PartialEq)]
pub enum NotifyBatch {
    /// Nothing happened since the last drain.
    Empty,
    /// The queued events, oldest first.
    Events(Vec<ChangeEvent>),
    /// Too many events were dropped; the subscriber must re-enumerate.
    Overflow,
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    dir_key: String,
    filter: NotifyFilter,
    watch_tree: bool,
    queue: VecDeque<ChangeEvent>,
    overflowed: bool,
}

/// The per-volume watcher set.
#[derive(Debug, Default)]
pub struct NotifyList {
    watchers: Mutex<Vec<Watcher>>,
    case_sensitive: bool,
}

impl NotifyList {
    /// Create a watcher set following the volume's case policy.
    #[must_use]
    pub fn new(case_sensitive: bool) -> Self {
        NotifyList {
            watchers: Mutex::new(Vec::new()),
            case_sensitive,
        }
    }

    /// Subscribe watcher `id` to `dir` with `filter`; `watch_tree` extends
    /// the match to the whole subtree. Re-subscribing an id replaces its
    /// subscription.
    pub fn subscribe(
        &self,
        id: u64,
        dir: &str,
        filter: NotifyFilter,
        watch_tree: bool,
    ) -> FsResult<()> {
        if filter.is_empty() {
            return Err(FsError::InvalidParameter);
        }
        let dir_key = path::fold(dir, self.case_sensitive).into_owned();
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| w.id != id);
        watchers.push(Watcher {
            id,
            dir_key,
            filter,
            watch_tree,
            queue: VecDeque::new(),
            overflowed: false,
        });
        debug!("notify: watcher {id} subscribed to {dir:?} (tree: {watch_tree})");
        Ok(())
    }

    /// Drop watcher `id`'s subscription, returning any final batch.
    pub fn unsubscribe(&self, id: u64) -> NotifyBatch {
        let mut watchers = self.watchers.lock();
        let Some(index) = watchers.iter().position(|w| w.id == id) else {
            return NotifyBatch::Empty;
        };
        let watcher = watchers.swap_remove(index);
        drop(watchers);
        debug!("notify: watcher {id} unsubscribed");
        if watcher.overflowed {
            NotifyBatch::Overflow
        } else if watcher.queue.is_empty() {
            NotifyBatch::Empty
        } else {
            NotifyBatch::Events(watcher.queue.into())
        }
    }

    /// Drain watcher `id`'s queue.
    pub fn drain(&self, id: u64) -> FsResult<NotifyBatch> {
        let mut watchers = self.watchers.lock();
        let watcher = watchers
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(FsError::NotFound)?;
        if watcher.overflowed {
            watcher.overflowed = false;
            watcher.queue.clear();
            return Ok(NotifyBatch::Overflow);
        }
        if watcher.queue.is_empty() {
            return Ok(NotifyBatch::Empty);
        }
        Ok(NotifyBatch::Events(watcher.queue.drain(..).collect()))
    }

    /// Fan a change out to every matching watcher. `name` is the full
    /// canonical name; `name_offset` locates the child-name suffix the
    /// subscriber reports.
    pub fn report(
        &self,
        name: &str,
        name_offset: usize,
        filter: NotifyFilter,
        action: NotifyAction,
    ) {
        if filter.is_empty() {
            return;
        }
        let folded = path::fold(name, self.case_sensitive);
        let parent_end = name_offset.saturating_sub(1).max(1);
        let parent = &folded[..parent_end];

        let mut watchers = self.watchers.lock();
        for watcher in watchers.iter_mut() {
            if !watcher.filter.intersects(filter) {
                continue;
            }
            let matches = parent == watcher.dir_key
                || (watcher.watch_tree && path::is_path_descendant(&watcher.dir_key, parent));
            if !matches {
                continue;
            }
            if watcher.queue.len() >= QUEUE_LIMIT {
                watcher.overflowed = true;
                watcher.queue.clear();
                continue;
            }
            watcher.queue.push_back(ChangeEvent {
                name: name.to_string(),
                name_offset,
                filter,
                action,
            });
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    /// True when nobody is watching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
