//! Request dispatch.
//!
//! The transport hands the engine one [`Operation`] per kernel request and
//! posts back the [`Reply`] (or error). The engine entries below implement
//! the §per-operation orchestration: resolve the handle, take the right
//! node resources, consult the caches, call the back-end, and put the
//! world back. The transport itself (wire format, queues, completion) is
//! out of scope; this enum boundary is its whole contract.

use log::warn;

use crate::Backend;
use crate::BasicInfo;
use crate::DirEntry;
use crate::FileAttributes;
use crate::FileHandle;
use crate::FileInfo;
use crate::FsError;
use crate::FsResult;
use crate::NotifyFilter;
use crate::Request;
use crate::StreamEntry;
use crate::Volume;
use crate::VolumeInfo;
use crate::create::CreateArgs;
use crate::dir_buf;
use crate::file_desc::pattern_matches;
use crate::node_lock::Acquire;
use crate::notify::NotifyBatch;
use crate::notify_filter::NotifyAction;
use crate::oplock::OplockLevel;
use crate::range_lock::LockOwner;

/// One inbound request, transport-decoded.
#[derive(Debug)]
pub enum Operation<'a> {
    /// CREATE: open or create `name`.
    Create {
        /// Canonical name to open.
        name: &'a str,
        /// Open parameters.
        args: CreateArgs<'a>,
    },
    /// CLEANUP: the last user handle of a file object went away.
    Cleanup {
        /// The handle being cleaned up.
        fh: FileHandle,
    },
    /// CLOSE: the file object itself is gone.
    Close {
        /// The handle being closed.
        fh: FileHandle,
    },
    /// READ file data.
    Read {
        /// Source handle.
        fh: FileHandle,
        /// Byte offset.
        offset: u64,
        /// Byte count.
        length: usize,
        /// Byte-range-lock owner of the caller.
        lock_owner: LockOwner,
    },
    /// WRITE file data.
    Write {
        /// Target handle.
        fh: FileHandle,
        /// Byte offset; `None` appends at end of file.
        offset: Option<u64>,
        /// The bytes.
        data: &'a [u8],
        /// Do not extend the file; truncate the transfer instead.
        constrained: bool,
        /// Byte-range-lock owner of the caller.
        lock_owner: LockOwner,
    },
    /// Flush dirty data.
    Flush {
        /// Target handle.
        fh: FileHandle,
    },
    /// QUERY_INFO: file metadata.
    QueryInfo {
        /// Source handle.
        fh: FileHandle,
    },
    /// SET_INFO(basic): attributes and times.
    SetBasicInfo {
        /// Target handle.
        fh: FileHandle,
        /// The new basics.
        basic: BasicInfo,
    },
    /// SET_INFO(allocation): reserve space, possibly truncating.
    SetAllocationSize {
        /// Target handle.
        fh: FileHandle,
        /// New allocation size.
        allocation_size: u64,
    },
    /// SET_INFO(eof): set the file size.
    SetFileSize {
        /// Target handle.
        fh: FileHandle,
        /// New file size.
        file_size: u64,
    },
    /// SET_INFO(disposition): arm or keep delete-on-close.
    SetDisposition {
        /// Target handle.
        fh: FileHandle,
        /// Delete when the last handle closes.
        delete: bool,
        /// POSIX unlink semantics.
        posix: bool,
    },
    /// RENAME the file or directory subtree.
    Rename {
        /// Handle of the file being renamed.
        fh: FileHandle,
        /// New canonical name.
        new_name: &'a str,
        /// Replace an existing target.
        replace_if_exists: bool,
        /// POSIX rename semantics.
        posix: bool,
    },
    /// QUERY_DIR: list directory children.
    QueryDirectory {
        /// Directory handle.
        fh: FileHandle,
        /// Search pattern (first call fixes it).
        pattern: Option<&'a str>,
        /// Resume after this child name.
        marker: Option<&'a str>,
        /// Restart the scan.
        restart: bool,
        /// Response byte budget.
        max_bytes: usize,
    },
    /// Query the named streams of a file.
    QueryStreams {
        /// Source handle.
        fh: FileHandle,
    },
    /// Read the extended attributes blob.
    QueryEa {
        /// Source handle.
        fh: FileHandle,
    },
    /// Write the extended attributes blob.
    SetEa {
        /// Target handle.
        fh: FileHandle,
        /// Encoded extended attributes.
        ea: &'a [u8],
    },
    /// LOCK a byte range.
    Lock {
        /// Target handle.
        fh: FileHandle,
        /// Lock owner.
        owner: LockOwner,
        /// Range start.
        offset: u64,
        /// Range length.
        length: u64,
        /// Exclusive lock?
        exclusive: bool,
        /// Block until available?
        wait: bool,
    },
    /// UNLOCK a byte range.
    Unlock {
        /// Target handle.
        fh: FileHandle,
        /// Lock owner.
        owner: LockOwner,
        /// Range start.
        offset: u64,
        /// Range length.
        length: u64,
    },
    /// Request an oplock.
    OplockRequest {
        /// Requesting handle.
        fh: FileHandle,
        /// Desired level.
        level: OplockLevel,
    },
    /// Acknowledge an oplock break.
    OplockAcknowledge {
        /// Acknowledging handle.
        fh: FileHandle,
        /// Accept the offered level (false breaks to none).
        accept_level: bool,
    },
    /// FSCTL: read a reparse point.
    GetReparsePoint {
        /// Source handle.
        fh: FileHandle,
    },
    /// FSCTL: attach a reparse point.
    SetReparsePoint {
        /// Target handle.
        fh: FileHandle,
        /// Reparse tag.
        tag: u32,
        /// Opaque reparse data.
        data: &'a [u8],
    },
    /// FSCTL: remove a reparse point.
    DeleteReparsePoint {
        /// Target handle.
        fh: FileHandle,
        /// Tag the caller believes is attached.
        tag: u32,
    },
    /// Query volume statistics.
    QueryVolumeInfo,
    /// Security descriptor by name.
    GetSecurityByName {
        /// Canonical name.
        name: &'a str,
    },
    /// NOTIFY_BEGIN: subscribe a directory watcher.
    NotifyBegin {
        /// Watching directory handle (also the watcher id).
        fh: FileHandle,
        /// Which changes to report.
        filter: NotifyFilter,
        /// Watch the whole subtree.
        watch_tree: bool,
    },
    /// NOTIFY: drain the watcher's queue.
    Notify {
        /// Watcher handle.
        fh: FileHandle,
    },
    /// NOTIFY_END: drop the subscription.
    NotifyEnd {
        /// Watcher handle.
        fh: FileHandle,
    },
}

/// The transport-visible result of an [`Operation`].
#[derive(Debug)]
pub enum Reply {
    /// Nothing beyond the status.
    Empty,
    /// A fresh handle and the opened file's metadata.
    Opened(FileHandle, FileInfo),
    /// File data.
    Data(Vec<u8>),
    /// Bytes accepted and the resulting metadata.
    Written(usize, FileInfo),
    /// File metadata.
    Info(FileInfo),
    /// Directory listing batch.
    Directory(Vec<DirEntry>),
    /// Stream listing.
    Streams(Vec<StreamEntry>),
    /// Extended attributes blob.
    Ea(Vec<u8>),
    /// Reparse tag and data.
    Reparse(u32, Vec<u8>),
    /// Volume statistics.
    VolumeInfo(VolumeInfo),
    /// Security descriptor bytes.
    Security(Vec<u8>),
    /// Change-notification batch.
    Notify(NotifyBatch),
}

impl<B: Backend> Volume<B> {
    /// Single dispatch entry: run `op` under `req` and produce its reply.
    pub fn dispatch(&self, req: &Request, op: Operation<'_>) -> FsResult<Reply> {
        if req.is_canceled() {
            return Err(FsError::Canceled);
        }
        match op {
            Operation::Create { name, args } => self
                .create(req, name, &args)
                .map(|(fh, info)| Reply::Opened(fh, info)),
            Operation::Cleanup { fh } => self.cleanup(req, fh).map(|()| Reply::Empty),
            Operation::Close { fh } => self.close(req, fh).map(|()| Reply::Empty),
            Operation::Read {
                fh,
                offset,
                length,
                lock_owner,
            } => self.read(req, fh, offset, length, lock_owner).map(Reply::Data),
            Operation::Write {
                fh,
                offset,
                data,
                constrained,
                lock_owner,
            } => self
                .write(req, fh, offset, data, constrained, lock_owner)
                .map(|(n, info)| Reply::Written(n, info)),
            Operation::Flush { fh } => self.flush(req, fh).map(Reply::Info),
            Operation::QueryInfo { fh } => self.query_info(req, fh).map(Reply::Info),
            Operation::SetBasicInfo { fh, basic } => {
                self.set_basic_info(req, fh, &basic).map(Reply::Info)
            }
            Operation::SetAllocationSize {
                fh,
                allocation_size,
            } => self
                .set_allocation_size(req, fh, allocation_size)
                .map(Reply::Info),
            Operation::SetFileSize { fh, file_size } => {
                self.set_file_size(req, fh, file_size).map(Reply::Info)
            }
            Operation::SetDisposition { fh, delete, posix } => self
                .set_disposition(req, fh, delete, posix)
                .map(|()| Reply::Empty),
            Operation::Rename {
                fh,
                new_name,
                replace_if_exists,
                posix,
            } => {
                let entry = self.handle(fh)?;
                self.rename_file(req, &entry.node, entry.backend_fh, new_name, replace_if_exists, posix)
                    .map(|()| Reply::Empty)
            }
            Operation::QueryDirectory {
                fh,
                pattern,
                marker,
                restart,
                max_bytes,
            } => self
                .query_directory(req, fh, pattern, marker, restart, max_bytes)
                .map(Reply::Directory),
            Operation::QueryStreams { fh } => self.query_streams(req, fh).map(Reply::Streams),
            Operation::QueryEa { fh } => self.query_ea(req, fh).map(Reply::Ea),
            Operation::SetEa { fh, ea } => self.set_ea_blob(req, fh, ea).map(Reply::Info),
            Operation::Lock {
                fh,
                owner,
                offset,
                length,
                exclusive,
                wait,
            } => {
                let entry = self.handle(fh)?;
                entry
                    .node
                    .range_locks()
                    .lock(req, fh.0, owner, offset, length, exclusive, wait)
                    .map(|()| Reply::Empty)
            }
            Operation::Unlock {
                fh,
                owner,
                offset,
                length,
            } => {
                let entry = self.handle(fh)?;
                entry
                    .node
                    .range_locks()
                    .unlock(owner, offset, length)
                    .map(|()| Reply::Empty)
            }
            Operation::OplockRequest { fh, level } => {
                let entry = self.handle(fh)?;
                let open_handles = entry.node.main_or_self().handle_count();
                entry
                    .node
                    .main_or_self()
                    .oplock
                    .request(fh.0, level, open_handles)
                    .map(|()| Reply::Empty)
            }
            Operation::OplockAcknowledge { fh, accept_level } => {
                let entry = self.handle(fh)?;
                entry
                    .node
                    .main_or_self()
                    .oplock
                    .acknowledge(fh.0, accept_level)
                    .map(|()| Reply::Empty)
            }
            Operation::GetReparsePoint { fh } => self
                .get_reparse_point(req, fh)
                .map(|(tag, data)| Reply::Reparse(tag, data)),
            Operation::SetReparsePoint { fh, tag, data } => {
                self.set_reparse_point(req, fh, tag, data).map(|()| Reply::Empty)
            }
            Operation::DeleteReparsePoint { fh, tag } => self
                .delete_reparse_point(req, fh, tag)
                .map(|()| Reply::Empty),
            Operation::QueryVolumeInfo => self.get_volume_info(req).map(Reply::VolumeInfo),
            Operation::GetSecurityByName { name } => {
                self.get_security_by_name(req, name).map(Reply::Security)
            }
            Operation::NotifyBegin {
                fh,
                filter,
                watch_tree,
            } => self
                .notify_begin(req, fh, filter, watch_tree)
                .map(|()| Reply::Empty),
            Operation::Notify { fh } => self.notify.drain(fh.0).map(Reply::Notify),
            Operation::NotifyEnd { fh } => {
                let batch = self.notify.unsubscribe(fh.0);
                Ok(Reply::Notify(batch))
            }
        }
    }

    /// CLEANUP: runs the delete decision, tells the back-end, and
    /// finalizes share accounting and (on delete) table removal.
    pub fn cleanup(&self, req: &Request, fh: FileHandle) -> FsResult<()> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        let desc = entry.desc.lock().clone();

        node.acquire_exclusive(Acquire::FULL, req);

        let decision = self.node_cleanup(node, &desc);

        // the handle is going away: drop its byte-range locks and oplock
        // grants
        node.range_locks().unlock_all_by_handle(fh.0);
        node.main_or_self().oplock.on_cleanup(fh.0);

        self.call_backend(req, |b| {
            b.cleanup(req, entry.backend_fh, &node.name(), decision.backend_flags());
        });

        if decision.delete {
            let filter = if node.is_directory() {
                NotifyFilter::DIR_NAME
            } else {
                NotifyFilter::FILE_NAME
            };
            self.notify_change(node, filter, NotifyAction::Removed, true);
        }

        self.node_cleanup_complete(node, &desc, decision.delete);

        if decision.flush_and_purge {
            // cached data of a just-cleaned-up file is dropped, not kept
            // for mapped reuse
            node.section.set_data_section(false);
        }

        node.release(Acquire::FULL, req);
        Ok(())
    }

    /// CLOSE: releases the transport handle and the node's open count.
    pub fn close(&self, req: &Request, fh: FileHandle) -> FsResult<()> {
        let entry = self
            .unregister_handle(fh)
            .ok_or(FsError::InvalidParameter)?;
        self.call_backend(req, |b| b.close(req, entry.backend_fh));
        // share access and the handle count were settled at CLEANUP
        self.node_close(&entry.node, None, false);
        Ok(())
    }

    /// READ file data.
    pub fn read(
        &self,
        req: &Request,
        fh: FileHandle,
        offset: u64,
        length: usize,
        lock_owner: LockOwner,
    ) -> FsResult<Vec<u8>> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if node.is_directory() {
            return Err(FsError::IsADirectory);
        }
        if !entry.desc.lock().granted.wants_read() {
            return Err(FsError::AccessDenied);
        }

        node.acquire_shared(Acquire::FULL, req);
        let result = (|| {
            if !node.range_locks().check_read(lock_owner, offset, length as u64) {
                return Err(FsError::LockConflict);
            }
            let (_, file_size) = node.file_sizes();
            if offset >= file_size {
                return Err(FsError::EndOfFile);
            }
            let length = length.min((file_size - offset) as usize);
            self.call_backend(req, |b| b.read(req, entry.backend_fh, offset, length))
        })();
        node.release(Acquire::FULL, req);
        result
    }

    /// WRITE file data; `offset: None` appends. Writes hold the node
    /// exclusive (Main then Pgio), which is what makes concurrent appends
    /// land whole.
    pub fn write(
        &self,
        req: &Request,
        fh: FileHandle,
        offset: Option<u64>,
        data: &[u8],
        constrained: bool,
        lock_owner: LockOwner,
    ) -> FsResult<(usize, FileInfo)> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if node.is_directory() {
            return Err(FsError::IsADirectory);
        }
        if !entry.desc.lock().granted.wants_write() {
            return Err(FsError::AccessDenied);
        }

        node.acquire_exclusive(Acquire::FULL, req);
        // writes break shared (Level2/Read) grants; no acknowledgment
        node.main_or_self().oplock.break_shared();
        let result = (|| {
            let (_, file_size) = node.file_sizes();
            let offset = offset.unwrap_or(file_size);
            let mut data = data;
            if constrained {
                if offset >= file_size {
                    return Err(FsError::EndOfFile);
                }
                let room = (file_size - offset) as usize;
                if data.len() > room {
                    data = &data[..room];
                }
            }
            if !node
                .range_locks()
                .check_write(lock_owner, offset, data.len() as u64)
            {
                return Err(FsError::LockConflict);
            }
            let (transferred, info) =
                self.call_backend(req, |b| b.write(req, entry.backend_fh, offset, data))?;
            node.set_file_info(&self.params, &info, false);
            self.notify_change(
                node,
                NotifyFilter::SIZE | NotifyFilter::LAST_WRITE,
                NotifyAction::Modified,
                false,
            );
            Ok((transferred, info))
        })();
        node.release(Acquire::FULL, req);
        result
    }

    /// Flush dirty data for a handle.
    pub fn flush(&self, req: &Request, fh: FileHandle) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        node.acquire_exclusive(Acquire::FULL, req);
        let result = self
            .call_backend(req, |b| b.flush(req, entry.backend_fh))
            .inspect(|info| node.set_file_info(&self.params, info, false));
        node.release(Acquire::FULL, req);
        result
    }

    /// QUERY_INFO, answered from the node cache while it is fresh.
    pub fn query_info(&self, req: &Request, fh: FileHandle) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;

        node.acquire_shared(Acquire::MAIN, req);
        let cached = node.try_file_info();
        node.release(Acquire::MAIN, req);
        if let Some(info) = cached {
            return Ok(info);
        }

        let info = self.call_backend(req, |b| b.get_file_info(req, entry.backend_fh))?;
        node.acquire_exclusive(Acquire::MAIN, req);
        node.set_file_info(&self.params, &info, false);
        node.release(Acquire::MAIN, req);
        Ok(info)
    }

    /// SET_INFO(basic).
    pub fn set_basic_info(
        &self,
        req: &Request,
        fh: FileHandle,
        basic: &BasicInfo,
    ) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if !entry
            .desc
            .lock()
            .granted
            .contains(crate::FileAccess::WRITE_ATTRIBUTES)
        {
            return Err(FsError::AccessDenied);
        }

        node.acquire_exclusive(Acquire::MAIN, req);
        let result = self
            .call_backend(req, |b| b.set_basic_info(req, entry.backend_fh, basic))
            .inspect(|info| {
                node.set_file_info(&self.params, info, false);
                self.notify_change(
                    node,
                    NotifyFilter::ATTRIBUTES | NotifyFilter::LAST_WRITE | NotifyFilter::CREATION,
                    NotifyAction::Modified,
                    true,
                );
            });
        node.release(Acquire::MAIN, req);
        result
    }

    /// SET_INFO(allocation).
    pub fn set_allocation_size(
        &self,
        req: &Request,
        fh: FileHandle,
        allocation_size: u64,
    ) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        node.acquire_exclusive(Acquire::FULL, req);
        let result = self
            .call_backend(req, |b| {
                b.set_allocation_size(req, entry.backend_fh, allocation_size)
            })
            .inspect(|info| {
                node.set_file_info(&self.params, info, false);
                self.notify_change(
                    node,
                    NotifyFilter::SIZE,
                    NotifyAction::Modified,
                    true,
                );
            });
        node.release(Acquire::FULL, req);
        result
    }

    /// SET_INFO(eof).
    pub fn set_file_size(
        &self,
        req: &Request,
        fh: FileHandle,
        file_size: u64,
    ) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        node.acquire_exclusive(Acquire::FULL, req);
        let result = self
            .call_backend(req, |b| b.set_file_size(req, entry.backend_fh, file_size))
            .inspect(|info| {
                node.set_file_info(&self.params, info, false);
                self.notify_change(
                    node,
                    NotifyFilter::SIZE | NotifyFilter::LAST_WRITE,
                    NotifyAction::Modified,
                    true,
                );
            });
        node.release(Acquire::FULL, req);
        result
    }

    /// SET_INFO(disposition): arm delete-on-close. Delete-pending is
    /// monotonic per node instance: arming sticks, disarming after an arm
    /// is a no-op.
    pub fn set_disposition(
        &self,
        req: &Request,
        fh: FileHandle,
        delete: bool,
        posix: bool,
    ) -> FsResult<()> {
        let entry = self.handle(fh)?;
        let node = &entry.node;

        if !delete {
            if node.delete_pending() {
                warn!(
                    "set_disposition: ignoring un-delete of {:?}; delete-pending is sticky",
                    node.name()
                );
            }
            return Ok(());
        }

        node.acquire_exclusive(Acquire::MAIN, req);
        let result = (|| {
            if node.file_info().attributes.contains(FileAttributes::READONLY) {
                return Err(FsError::AccessDenied);
            }
            self.call_backend(req, |b| b.can_delete(req, entry.backend_fh, &node.name()))?;
            node.set_delete_pending();
            let mut desc = entry.desc.lock();
            desc.delete_on_close = true;
            if posix {
                desc.posix_delete = true;
            }
            Ok(())
        })();
        node.release(Acquire::MAIN, req);
        result
    }

    /// QUERY_DIR with pattern, marker and restart semantics; the listing
    /// itself is cached per directory node.
    pub fn query_directory(
        &self,
        req: &Request,
        fh: FileHandle,
        pattern: Option<&str>,
        marker: Option<&str>,
        restart: bool,
        max_bytes: usize,
    ) -> FsResult<Vec<DirEntry>> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if !node.is_directory() {
            return Err(FsError::NotADirectory);
        }

        let (effective_pattern, effective_marker, first_scan) = {
            let mut desc = entry.desc.lock();
            let first_scan = desc.dir_marker().is_none() && !restart;
            desc.reset_directory(pattern, restart);
            // an explicit marker always wins; otherwise resume from the
            // handle's cursor unless the caller restarted
            let marker = marker.map(str::to_string).or_else(|| {
                if restart {
                    None
                } else {
                    desc.dir_marker().map(str::to_string)
                }
            });
            (
                desc.dir_pattern().unwrap_or("*").to_string(),
                marker,
                first_scan || restart,
            )
        };

        let mut entries = self.directory_listing(req, &entry.node, entry.backend_fh)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut batch = Vec::new();
        let mut used = 0usize;
        for dir_entry in entries {
            if !pattern_matches(&effective_pattern, &dir_entry.name) {
                continue;
            }
            if let Some(marker) = effective_marker.as_deref() {
                if dir_entry.name.as_str() <= marker {
                    continue;
                }
            }
            let size = dir_buf::dir_entry_size(&dir_entry);
            if used + size > max_bytes && !batch.is_empty() {
                break;
            }
            used += size;
            batch.push(dir_entry);
        }

        if batch.is_empty() {
            return Err(if effective_marker.is_none() && first_scan {
                FsError::NotFound
            } else {
                FsError::NoMoreEntries
            });
        }

        let mut desc = entry.desc.lock();
        let last = batch.last().map(|e| e.name.clone());
        if let Some(last) = last {
            desc.set_directory_marker(&last)?;
        }
        Ok(batch)
    }

    fn directory_listing(
        &self,
        req: &Request,
        node: &crate::FileNode,
        backend_fh: u64,
    ) -> FsResult<Vec<DirEntry>> {
        node.acquire_shared(Acquire::MAIN, req);
        let cached = self
            .reference_dir_info(node)
            .and_then(|buf| dir_buf::decode_dir_entries(&buf));
        let change_number = node.dir_info_change_number();
        node.release(Acquire::MAIN, req);
        if let Some(entries) = cached {
            return Ok(entries);
        }

        let entries =
            self.call_backend(req, |b| b.read_directory(req, backend_fh, None, None))?;

        node.acquire_exclusive(Acquire::MAIN, req);
        let encoded = dir_buf::encode_dir_entries(&entries);
        // a mutator may have advanced the listing while the back-end ran
        self.try_set_dir_info(node, Some(&encoded), change_number);
        node.release(Acquire::MAIN, req);
        Ok(entries)
    }

    /// Query the named streams of a file, cached per identity.
    pub fn query_streams(&self, req: &Request, fh: FileHandle) -> FsResult<Vec<StreamEntry>> {
        let entry = self.handle(fh)?;
        let node = &entry.node;

        node.acquire_shared(Acquire::MAIN, req);
        let cached = self
            .reference_stream_info(node)
            .and_then(|buf| dir_buf::decode_stream_entries(&buf));
        let change_number = node.stream_info_change_number();
        node.release(Acquire::MAIN, req);
        if let Some(entries) = cached {
            return Ok(entries);
        }

        let entries = self.call_backend(req, |b| b.get_stream_info(req, entry.backend_fh))?;

        node.acquire_exclusive(Acquire::MAIN, req);
        let encoded = dir_buf::encode_stream_entries(&entries);
        self.try_set_stream_info(node, Some(&encoded), change_number);
        node.release(Acquire::MAIN, req);
        Ok(entries)
    }

    /// Read the extended-attributes blob, cached per identity.
    pub fn query_ea(&self, req: &Request, fh: FileHandle) -> FsResult<Vec<u8>> {
        let entry = self.handle(fh)?;
        let node = &entry.node;

        node.acquire_shared(Acquire::MAIN, req);
        let cached = self.reference_ea(node).map(|buf| buf.to_vec());
        let change_number = node.ea_change_number();
        node.release(Acquire::MAIN, req);
        if let Some(blob) = cached {
            return Ok(blob);
        }

        let blob = self.call_backend(req, |b| b.read_ea(req, entry.backend_fh))?;

        node.acquire_exclusive(Acquire::MAIN, req);
        self.try_set_ea(node, Some(&blob), change_number);
        node.release(Acquire::MAIN, req);
        Ok(blob)
    }

    /// Write the extended-attributes blob.
    pub fn set_ea_blob(&self, req: &Request, fh: FileHandle, ea: &[u8]) -> FsResult<FileInfo> {
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if !entry.desc.lock().granted.contains(crate::FileAccess::WRITE_EA) {
            return Err(FsError::AccessDenied);
        }

        node.acquire_exclusive(Acquire::MAIN, req);
        let result = self
            .call_backend(req, |b| b.write_ea(req, entry.backend_fh, ea))
            .inspect(|info| {
                self.set_ea(node, Some(ea));
                node.set_file_info(&self.params, info, false);
                self.notify_change(node, NotifyFilter::EA, NotifyAction::Modified, true);
            });
        node.release(Acquire::MAIN, req);
        result
    }

    /// FSCTL: read the reparse point.
    pub fn get_reparse_point(&self, req: &Request, fh: FileHandle) -> FsResult<(u32, Vec<u8>)> {
        if !self.params.reparse_points() {
            return Err(FsError::Unsupported);
        }
        let entry = self.handle(fh)?;
        let node = &entry.node;

        node.acquire_shared(Acquire::MAIN, req);
        let result = (|| {
            if !node
                .file_info()
                .attributes
                .contains(FileAttributes::REPARSE_POINT)
            {
                return Err(FsError::NotAReparsePoint);
            }
            self.call_backend(req, |b| b.get_reparse_point(req, entry.backend_fh))
        })();
        node.release(Acquire::MAIN, req);
        result
    }

    /// FSCTL: attach a reparse point.
    pub fn set_reparse_point(
        &self,
        req: &Request,
        fh: FileHandle,
        tag: u32,
        data: &[u8],
    ) -> FsResult<()> {
        if !self.params.reparse_points() {
            return Err(FsError::Unsupported);
        }
        if tag == 0 || data.is_empty() {
            return Err(FsError::ReparseDataInvalid);
        }
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if self.params.reparse_points_access_check() {
            let granted = entry.desc.lock().granted;
            if !granted.wants_write() && !granted.contains(crate::FileAccess::WRITE_DAC) {
                return Err(FsError::AccessDenied);
            }
        }

        node.acquire_exclusive(Acquire::FULL, req);
        let result = self
            .call_backend(req, |b| b.set_reparse_point(req, entry.backend_fh, tag, data))
            .inspect(|()| {
                node.invalidate_file_info();
                self.notify_change(
                    node,
                    NotifyFilter::ATTRIBUTES,
                    NotifyAction::Modified,
                    true,
                );
            });
        node.release(Acquire::FULL, req);
        result
    }

    /// FSCTL: remove a reparse point.
    pub fn delete_reparse_point(&self, req: &Request, fh: FileHandle, tag: u32) -> FsResult<()> {
        if !self.params.reparse_points() {
            return Err(FsError::Unsupported);
        }
        let entry = self.handle(fh)?;
        let node = &entry.node;
        if self.params.reparse_points_access_check() {
            let granted = entry.desc.lock().granted;
            if !granted.wants_write() && !granted.contains(crate::FileAccess::WRITE_DAC) {
                return Err(FsError::AccessDenied);
            }
        }

        node.acquire_exclusive(Acquire::FULL, req);
        let result = (|| {
            let info = self.call_backend(req, |b| b.get_file_info(req, entry.backend_fh))?;
            if !info.attributes.contains(FileAttributes::REPARSE_POINT) {
                return Err(FsError::NotAReparsePoint);
            }
            if info.reparse_tag != tag {
                return Err(FsError::ReparseTagInvalid);
            }
            self.call_backend(req, |b| b.delete_reparse_point(req, entry.backend_fh, tag))
        })()
        .inspect(|()| {
            node.invalidate_file_info();
            self.notify_change(
                node,
                NotifyFilter::ATTRIBUTES,
                NotifyAction::Modified,
                true,
            );
        });
        node.release(Acquire::FULL, req);
        result
    }

    /// NOTIFY_BEGIN: subscribe the handle as a watcher of its directory.
    pub fn notify_begin(
        &self,
        _req: &Request,
        fh: FileHandle,
        filter: NotifyFilter,
        watch_tree: bool,
    ) -> FsResult<()> {
        let entry = self.handle(fh)?;
        if !entry.node.is_directory() {
            return Err(FsError::NotADirectory);
        }
        self.notify
            .subscribe(fh.0, &entry.node.name(), filter, watch_tree)
    }
}
