//! Rename and overwrite.
//!
//! Rename is the one operation that moves names under live nodes. The
//! volume rename resource serializes it against opens (create paths hold it
//! shared, rename holds it exclusive), the checks below reject or break
//! everything that could observe torn state, and the fan-out rewrites every
//! descendant name inside a single context-table lock hold so no
//! intermediate mix of old and new prefixes is ever visible.

use std::sync::Arc;

use log::debug;

use crate::Backend;
use crate::FileNode;
use crate::FsError;
use crate::FsResult;
use crate::NotifyAction;
use crate::NotifyFilter;
use crate::Request;
use crate::Volume;
use crate::descendants::DescendantFlags;
use crate::descendants::Gathered;
use crate::descendants::Visit;
use crate::node_lock::Acquire;
use crate::path;

/// Outcome of a rename precondition check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RenameCheck {
    /// All clear; the node and rename locks are still held.
    Clear,
    /// Oplock breaks were awaited; the node and rename locks were
    /// released, so the caller must reacquire and re-verify.
    Retry,
}

impl<B: Backend> Volume<B> {
    /// Break any Batch or Handle oplock on the streams of `node` (or just
    /// `stream_name`). Create paths run this before overwrite/supersede.
    ///
    /// Always releases the node resources in `acquired` before waiting, so
    /// holders can acknowledge without deadlocking; the caller reacquires.
    /// A holder that cannot be broken reports as a sharing violation.
    pub(crate) fn check_batch_oplocks_on_all_streams(
        &self,
        req: &Request,
        node: &Arc<FileNode>,
        acquired: Acquire,
        stream_name: Option<&str>,
    ) -> FsResult<()> {
        debug_assert!(!node.is_stream());

        let name = node.name();
        let mut gathered = {
            let table = self.table.lock();
            Gathered::gather(&table, &name, |candidate| {
                candidate.with_name(|candidate_name| {
                    if path::is_path_descendant(&name, candidate_name) {
                        return Visit::Stop;
                    }
                    if candidate.handle_count() == 0 {
                        return Visit::Skip;
                    }
                    if let Some(stream_name) = stream_name {
                        let case_sensitive = self.params.case_sensitive();
                        if candidate_name != name
                            && path::fold(candidate_name, case_sensitive)
                                != path::fold(stream_name, case_sensitive)
                        {
                            return Visit::Skip;
                        }
                    }
                    Visit::Keep(DescendantFlags::empty())
                })
            })
        };

        // initiate breaks without waiting
        for (candidate, flags) in gathered.iter_mut() {
            if candidate.oplock.is_batch() {
                if candidate.oplock.check(req, true) == Err(FsError::OplockBreakInProgress) {
                    *flags |= DescendantFlags::BATCH_BREAK;
                }
            } else if candidate.oplock.is_handle()
                && candidate.oplock.break_handle(req, true)
                    == Err(FsError::OplockBreakInProgress)
            {
                *flags |= DescendantFlags::HANDLE_BREAK;
            }
        }

        // release the node so holders can make progress while we wait
        node.release(acquired, req);

        let mut result = Ok(());
        for (candidate, flags) in gathered.iter() {
            if flags.contains(DescendantFlags::BATCH_BREAK) {
                if candidate.oplock.check(req, false).is_err() {
                    result = Err(FsError::sharing_violation());
                }
            } else if flags.contains(DescendantFlags::HANDLE_BREAK)
                && candidate.oplock.break_handle(req, false).is_err()
            {
                result = Err(FsError::sharing_violation());
            }
        }

        result
    }

    /// Rename precondition check over the subtree of `file_name`.
    ///
    /// With `checking_old_name` the subtree is the one being renamed away:
    /// open handles below the node forbid the rename (POSIX renames
    /// tolerate them when every opener shares delete and no stream denies
    /// it). Without it the subtree is the replacement target: open
    /// handles, directories with children and mapped images refuse with
    /// access-denied.
    ///
    /// On [`RenameCheck::Clear`] the caller still holds everything; on any
    /// error and on [`RenameCheck::Retry`] both the node resources in
    /// `acquired` and the rename lock have been released.
    pub(crate) fn rename_check(
        &self,
        req: &Request,
        node: &Arc<FileNode>,
        acquired: Acquire,
        file_name: &str,
        checking_old_name: bool,
        posix_rename: bool,
    ) -> FsResult<RenameCheck> {
        let mut gathered = {
            let table = self.table.lock();

            if checking_old_name && !node.is_directory() && node.handle_count() == 1 {
                return Ok(RenameCheck::Clear);
            }

            Gathered::gather(&table, file_name, |candidate| {
                let mut flags = DescendantFlags::empty();
                if candidate.handle_count() > 0 {
                    flags |= DescendantFlags::HAS_HANDLES;
                }
                Visit::Keep(flags)
            })
        };

        if gathered.is_empty() {
            return Ok(RenameCheck::Clear);
        }

        // with the rename lock held exclusive there can be no new opens;
        // the snapshot is authoritative

        if !checking_old_name {
            // the replaced file may not be a non-empty directory or a
            // mapped image
            for (candidate, _) in gathered.iter() {
                let blocked = candidate.with_name(|candidate_name| {
                    path::is_path_descendant(file_name, candidate_name)
                }) || (candidate.section.has_image_section()
                    && !candidate.section.force_close());
                if blocked {
                    node.release(acquired, req);
                    self.rename_lock.release();
                    return Err(FsError::AccessDenied);
                }
            }
        }

        // flush cleaned-up but still-open files affected by the rename,
        // files before their containing directories
        for (candidate, flags) in gathered.iter().rev() {
            if flags.contains(DescendantFlags::HAS_HANDLES) {
                continue;
            }
            if checking_old_name
                && !candidate
                    .with_name(|candidate_name| path::is_path_descendant(file_name, candidate_name))
            {
                continue;
            }
            if candidate.section.has_user_writable_refs() {
                continue;
            }
            candidate.section.force_close();
        }

        // break Batch and Handle oplocks on everything with handles
        let mut break_pending = false;
        for (candidate, flags) in gathered.iter_mut() {
            if !flags.contains(DescendantFlags::HAS_HANDLES) {
                continue;
            }
            if candidate.oplock.is_batch() {
                match candidate.oplock.check(req, true) {
                    Ok(()) => {}
                    Err(FsError::OplockBreakInProgress) => {
                        *flags |= DescendantFlags::BATCH_BREAK;
                        break_pending = true;
                    }
                    Err(_) => {
                        node.release(acquired, req);
                        self.rename_lock.release();
                        return Err(FsError::AccessDenied);
                    }
                }
            } else if candidate.oplock.is_handle() {
                match candidate.oplock.break_handle(req, true) {
                    Ok(()) => {}
                    Err(FsError::OplockBreakInProgress) => {
                        *flags |= DescendantFlags::HANDLE_BREAK;
                        break_pending = true;
                    }
                    Err(_) => {
                        node.release(acquired, req);
                        self.rename_lock.release();
                        return Err(FsError::AccessDenied);
                    }
                }
            }
        }

        if break_pending {
            // drop every lock, wait the breaks out, then have the caller
            // reacquire and re-verify
            node.release(acquired, req);
            self.rename_lock.release();

            let mut result = Ok(RenameCheck::Retry);
            for (candidate, flags) in gathered.iter() {
                if flags.contains(DescendantFlags::BATCH_BREAK) {
                    if candidate.oplock.check(req, false).is_err() {
                        result = Err(FsError::AccessDenied);
                    }
                } else if flags.contains(DescendantFlags::HANDLE_BREAK)
                    && candidate.oplock.break_handle(req, false).is_err()
                {
                    result = Err(FsError::AccessDenied);
                }
            }
            return result;
        }

        // recheck open handles under the table lock
        {
            let table = self.table.lock();
            let mut restart = crate::name_table::RestartKey::default();
            while let Some(candidate) = table.enumerate_prefix(file_name, &mut restart) {
                if Arc::ptr_eq(&candidate, node) || candidate.handle_count() == 0 {
                    continue;
                }
                // a POSIX rename tolerates open handles when every opener
                // shares delete and no stream denies it
                if posix_rename
                    && candidate.share_access.lock().all_share_delete()
                    && candidate.stream_deny_delete() == 0
                {
                    continue;
                }
                drop(table);
                node.release(acquired, req);
                self.rename_lock.release();
                return Err(if posix_rename {
                    FsError::sharing_violation()
                } else {
                    FsError::AccessDenied
                });
            }
        }

        Ok(RenameCheck::Clear)
    }

    /// Rewrite `node` and every descendant from the node's current name to
    /// `new_name`, atomically with respect to the name table. Collisions
    /// under the new prefix (possible after a POSIX rename raced a mapped
    /// or batch-oplocked file) evict the occupant.
    pub(crate) fn node_rename(&self, req: &Request, node: &Arc<FileNode>, new_name: &str) {
        let old_name = node.name();
        let old_len = old_name.len();
        let tag = req.owner_tag();

        let gathered = {
            let table = self.table.lock();
            Gathered::gather(&table, &old_name, |_| Visit::Keep(DescendantFlags::empty()))
        };

        // lock path descendants as foreign holds before touching the
        // table; the rename resource keeps the snapshot stable
        let mut foreign: Vec<&Arc<FileNode>> = Vec::new();
        for (descendant, _) in gathered.iter() {
            let is_path_child = descendant
                .with_name(|descendant_name| path::is_path_descendant(&old_name, descendant_name));
            if is_path_child {
                descendant.acquire_exclusive_foreign(tag);
                foreign.push(descendant);
            }
        }

        let mut evicted: Vec<Arc<FileNode>> = Vec::new();
        {
            let mut table = self.table.lock();
            for (descendant, _) in gathered.iter() {
                let descendant_name = descendant.name();
                let removed = table.remove(&descendant_name);
                debug_assert!(removed.is_some());

                let rewritten = path::replace_prefix(&descendant_name, old_len, new_name);
                descendant.set_name(rewritten);

                let (occupant, inserted) = table.insert_if_absent(descendant);
                if !inserted {
                    // the new name was occupied (mapped-and-closed file,
                    // fresh batch-oplock break, POSIX rename target):
                    // evict the occupant and take its place
                    debug_assert!(!Arc::ptr_eq(&occupant, descendant));
                    debug_assert!(occupant.open_count() > 0);
                    occupant.open_count_zero();
                    if let Some(removed) = table.remove(&occupant.name()) {
                        evicted.push(removed);
                    }
                    let (_, inserted) = table.insert_if_absent(descendant);
                    debug_assert!(inserted);
                }
            }
        }

        for descendant in foreign.into_iter().rev() {
            descendant.release_foreign(tag);
        }
        drop(evicted);

        debug!("rename: {old_name:?} -> {new_name:?}");
    }

    /// Overwrite/supersede hit a main file with open named streams: mark
    /// them all delete-pending so their own lifecycle paths tear them
    /// down. Runs under the create path's shared rename hold.
    pub(crate) fn overwrite_streams(&self, node: &Arc<FileNode>) {
        debug_assert!(!node.is_stream());

        let name = node.name();
        let table = self.table.lock();
        let streams = Gathered::gather(&table, &name, |candidate| {
            candidate.with_name(|candidate_name| {
                if path::is_path_descendant(&name, candidate_name) {
                    Visit::Stop
                } else if candidate_name != name && candidate.handle_count() > 0 {
                    Visit::Keep(DescendantFlags::empty())
                } else {
                    Visit::Skip
                }
            })
        });
        for (stream, _) in streams.iter() {
            stream.set_delete_pending();
        }
    }

    /// The RENAME operation: precondition checks (with oplock-break
    /// retry), the back-end call, the subtree fan-out, and the rename
    /// notifications.
    pub(crate) fn rename_file(
        &self,
        req: &Request,
        node: &Arc<FileNode>,
        backend_fh: u64,
        new_name: &str,
        replace_if_exists: bool,
        posix_rename: bool,
    ) -> FsResult<()> {
        if node.is_stream() {
            // stream rename is not supported through this path
            return Err(FsError::InvalidParameter);
        }
        path::validate(
            new_name,
            self.params.named_streams(),
            self.params.max_component_length() as usize,
        )?;

        let old_name = loop {
            self.rename_lock.acquire_exclusive();
            node.acquire_exclusive(Acquire::FULL, req);
            let old_name = node.name();

            if req.is_canceled() {
                node.release(Acquire::FULL, req);
                self.rename_lock.release();
                return Err(FsError::Canceled);
            }

            // the subtree being renamed away
            match self.rename_check(req, node, Acquire::FULL, &old_name, true, posix_rename)? {
                RenameCheck::Clear => {}
                RenameCheck::Retry => continue,
            }

            // the subtree being replaced, if the target name is live
            let target_exists = self.lookup(new_name).is_some_and(|t| !Arc::ptr_eq(&t, node));
            if target_exists {
                if !replace_if_exists && !posix_rename {
                    node.release(Acquire::FULL, req);
                    self.rename_lock.release();
                    return Err(FsError::Exists);
                }
                match self.rename_check(req, node, Acquire::FULL, new_name, false, posix_rename)?
                {
                    RenameCheck::Clear => {}
                    RenameCheck::Retry => continue,
                }
            }

            break old_name;
        };

        let result = self.call_backend(req, |b| {
            b.rename(req, backend_fh, &old_name, new_name, replace_if_exists || posix_rename)
        });

        if result.is_ok() {
            let filter = if node.is_directory() {
                NotifyFilter::DIR_NAME
            } else {
                NotifyFilter::FILE_NAME
            };
            self.notify_change(node, filter, NotifyAction::RenamedOldName, true);

            self.node_rename(req, node, new_name);

            self.notify_change(node, filter, NotifyAction::RenamedNewName, true);
        }

        node.release(Acquire::FULL, req);
        self.rename_lock.release();
        result
    }
}
