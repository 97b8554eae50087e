//! The volume engine.
//!
//! A [`Volume`] owns all per-volume shared state — the name table and
//! active list (under the single context-table lock), the four metadata
//! caches, the watcher set, the rename resource and the handle registry —
//! and implements the open/cleanup/close lifecycle over them. The request
//! dispatch surface lives in [`crate::dispatch`]; rename and create flows
//! in their own modules.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;

use crate::Backend;
use crate::FileAccess;
use crate::FileDesc;
use crate::FileInfo;
use crate::FileNode;
use crate::FsError;
use crate::FsResult;
use crate::NotifyAction;
use crate::NotifyFilter;
use crate::Request;
use crate::ShareMode;
use crate::VolumeInfo;
use crate::VolumeParams;
use crate::descendants::DescendantFlags;
use crate::descendants::Gathered;
use crate::descendants::Visit;
use crate::meta_cache::CachedBuf;
use crate::meta_cache::MetaCache;
use crate::name_table::NameTable;
use crate::node::Expiry;
use crate::node_lock::NodeResource;
use crate::notify::NotifyList;
use crate::notify_filter::translate_for_stream;
use crate::path;

/// Entries per metadata cache.
const META_CACHE_CAPACITY: usize = 4096;

bitflags! {
    /// What the back-end must do during its `cleanup` callback.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CleanupFlags: u32 {
        /// Remove the file.
        const DELETE = 1;
        /// Commit the in-memory allocation size.
        const SET_ALLOCATION_SIZE = 2;
        /// Flush dirty data and drop cached pages.
        const FLUSH_AND_PURGE = 4;
    }
}

/// A transport-facing open-file handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileHandle(pub u64);

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Registry entry behind a [`FileHandle`].
#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub(crate) node: Arc<FileNode>,
    pub(crate) backend_fh: u64,
    pub(crate) desc: Mutex<FileDesc>,
}

/// What the cleanup decision told the dispatch path to do.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CleanupDecision {
    pub(crate) delete: bool,
    pub(crate) set_allocation_size: bool,
    pub(crate) flush_and_purge: bool,
}

impl CleanupDecision {
    pub(crate) fn backend_flags(self) -> CleanupFlags {
        let mut flags = CleanupFlags::empty();
        if self.delete {
            flags |= CleanupFlags::DELETE;
        }
        if self.set_allocation_size {
            flags |= CleanupFlags::SET_ALLOCATION_SIZE;
        }
        if self.flush_and_purge {
            flags |= CleanupFlags::FLUSH_AND_PURGE;
        }
        flags
    }
}

/// The in-process engine for one mounted volume.
#[derive(Debug)]
pub struct Volume<B: Backend> {
    pub(crate) params: VolumeParams,
    pub(crate) backend: B,
    pub(crate) table: Mutex<NameTable>,
    pub(crate) security_cache: MetaCache,
    pub(crate) dir_cache: MetaCache,
    pub(crate) stream_cache: MetaCache,
    pub(crate) ea_cache: MetaCache,
    pub(crate) notify: NotifyList,
    /// Create paths hold this shared; rename holds it exclusive, so no
    /// open can observe a half-moved subtree. A raw resource rather than a
    /// guard type because the rename check paths release it mid-call
    /// before waiting on oplock breaks.
    pub(crate) rename_lock: NodeResource,
    pub(crate) handles: Mutex<HashMap<u64, Arc<HandleEntry>>>,
    next_handle: AtomicU64,
    volume_info: Mutex<Option<(VolumeInfo, Expiry)>>,
}

impl<B: Backend> Volume<B> {
    /// Bring up a volume over `backend` with the given parameters.
    pub fn new(params: VolumeParams, backend: B) -> Self {
        let meta_ttl = match params.file_info_timeout() {
            0 => Some(Duration::ZERO),
            u32::MAX => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        };
        Volume {
            table: Mutex::new(NameTable::new(params.case_sensitive())),
            security_cache: MetaCache::new(META_CACHE_CAPACITY, meta_ttl),
            dir_cache: MetaCache::new(META_CACHE_CAPACITY, meta_ttl),
            stream_cache: MetaCache::new(META_CACHE_CAPACITY, meta_ttl),
            ea_cache: MetaCache::new(META_CACHE_CAPACITY, meta_ttl),
            notify: NotifyList::new(params.case_sensitive()),
            rename_lock: NodeResource::default(),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            volume_info: Mutex::new(None),
            params,
            backend,
        }
    }

    /// The volume parameters.
    pub fn params(&self) -> &VolumeParams {
        &self.params
    }

    /// The user back-end.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The watcher set (transport drains notify batches through it).
    pub fn notify_list(&self) -> &NotifyList {
        &self.notify
    }

    /// Run a back-end call with the request's re-entrancy mask in place.
    pub(crate) fn call_backend<R>(&self, req: &Request, f: impl FnOnce(&B) -> R) -> R {
        let _scope = req.enter_backend();
        f(&self.backend)
    }

    // ----- handle registry -----

    pub(crate) fn register_handle(
        &self,
        node: Arc<FileNode>,
        backend_fh: u64,
        desc: FileDesc,
    ) -> FileHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(
            id,
            Arc::new(HandleEntry {
                node,
                backend_fh,
                desc: Mutex::new(desc),
            }),
        );
        FileHandle(id)
    }

    pub(crate) fn handle(&self, fh: FileHandle) -> FsResult<Arc<HandleEntry>> {
        self.handles
            .lock()
            .get(&fh.0)
            .cloned()
            .ok_or(FsError::InvalidParameter)
    }

    pub(crate) fn unregister_handle(&self, fh: FileHandle) -> Option<Arc<HandleEntry>> {
        self.handles.lock().remove(&fh.0)
    }

    // ----- open / cleanup / close (lifecycle core) -----

    /// Register an open of `node` (a candidate created by the caller, or
    /// the occupant of its name if one exists). On success the node's
    /// counters, share access and cross-stream deny-delete state reflect
    /// the new opener, and the returned node is the one actually opened.
    pub(crate) fn node_open(
        &self,
        node: &Arc<FileNode>,
        granted: FileAccess,
        additional: FileAccess,
        share: ShareMode,
    ) -> FsResult<(Arc<FileNode>, bool)> {
        use crate::error::SharingViolationReason;

        let mut table = self.table.lock();

        // a named stream must also clear checks against its main file
        if let Some(main) = node.main_file() {
            if main.delete_pending() {
                return Err(FsError::DeletePending);
            }
            // Sharing violations between main file and streams were
            // determined through experimentation with NTFS. They may be
            // wrong!
            if main.main_file_deny_delete() > 0
                && !share.contains(ShareMode::DELETE)
                && granted.intersects(FileAccess::DATA_CLASS)
            {
                return Err(FsError::SharingViolation(
                    SharingViolationReason::MainFile,
                ));
            }
        }

        let (opened, inserted) = table.insert_if_absent(node);

        if inserted {
            opened.share_access.lock().set(granted, share);
        } else {
            debug_assert!(!Arc::ptr_eq(&opened, node));
            if opened.delete_pending() {
                return Err(FsError::DeletePending);
            }
            if !opened.is_stream() && opened.stream_deny_delete() > 0 && granted.wants_delete() {
                return Err(FsError::SharingViolation(SharingViolationReason::Stream));
            }
            // a writable section may exist with no handles open against
            // the file; refuse data access that does not share write
            if !share.contains(ShareMode::WRITE)
                && granted.intersects(FileAccess::DATA_CLASS)
                && opened.section.has_user_writable_refs()
            {
                return Err(FsError::sharing_violation());
            }
            let mut share_access = opened.share_access.lock();
            if !additional.is_empty() {
                // overwrite dispositions must pass as if they asked for
                // the implied write/delete access
                share_access.check(granted | additional, share)?;
            }
            share_access.check_update(granted, share)?;
        }

        // no more failures allowed: the table and share state are updated

        match opened.main_file() {
            None => {
                if granted.wants_delete() {
                    opened.main_file_deny_delete_add(1);
                }
            }
            Some(main) => {
                if granted.shares_object() && !share.contains(ShareMode::DELETE) {
                    main.stream_deny_delete_add(1);
                }
            }
        }

        if opened.active_count_add(1) == 1 {
            table.active_insert(&opened);
        }
        opened.open_count_add(1);
        opened.handle_count_add(1);

        Ok((opened, inserted))
    }

    /// First half of CLEANUP: record delete intent and decide what this
    /// cleanup must do. The caller holds the node exclusive (Main).
    pub(crate) fn node_cleanup(&self, node: &FileNode, desc: &FileDesc) -> CleanupDecision {
        let delete_pending;
        let single_handle;
        {
            let _table = self.table.lock();
            if desc.delete_on_close {
                node.set_delete_pending();
            }
            delete_pending = node.delete_pending();
            single_handle = node.handle_count() == 1;
        }

        let mut delete = false;
        if !node.posix_delete() {
            if desc.posix_delete {
                node.set_posix_delete();
                delete = true;
            } else if single_handle {
                delete = delete_pending;
            }
        }

        CleanupDecision {
            delete,
            set_allocation_size: single_handle && !delete_pending && node.truncate_on_close(),
            flush_and_purge: single_handle
                && !delete_pending
                && self.params.flush_and_purge_on_cleanup(),
        }
    }

    /// Second half of CLEANUP: undo the opener's share contribution, and
    /// on delete unlink the node (and, for a main file, every cleaned-up
    /// stream still in the table). The node stays in the table for
    /// non-delete cleanups until CLOSE, so reopens while mappings or
    /// write-behind are pending find the same identity.
    pub(crate) fn node_cleanup_complete(
        &self,
        node: &Arc<FileNode>,
        desc: &FileDesc,
        delete: bool,
    ) {
        let mut dropped: Vec<Arc<FileNode>> = Vec::new();
        {
            let mut table = self.table.lock();

            match node.main_file() {
                None => {
                    if desc.granted.wants_delete() {
                        node.main_file_deny_delete_add(-1);
                    }
                }
                Some(main) => {
                    if desc.granted.shares_object() && !desc.share.contains(ShareMode::DELETE) {
                        main.stream_deny_delete_add(-1);
                    }
                }
            }

            node.share_access.lock().remove(desc.granted, desc.share);

            if delete {
                let name = node.name();
                if let Some(removed) = table.remove(&name) {
                    dropped.push(removed);
                }
                node.open_count_zero();

                // cleaned up but unclosed streams of this file are still
                // in the table; unlink them with it
                if self.params.named_streams() && !node.is_stream() {
                    let streams = Gathered::gather(&table, &name, |candidate| {
                        candidate.with_name(|candidate_name| {
                            if path::is_path_descendant(&name, candidate_name) {
                                Visit::Stop
                            } else if path::is_stream_descendant(&name, candidate_name) {
                                Visit::Keep(DescendantFlags::empty())
                            } else {
                                Visit::Skip
                            }
                        })
                    });
                    for (stream, _) in streams.iter() {
                        if let Some(removed) = table.remove(&stream.name()) {
                            stream.open_count_zero();
                            dropped.push(removed);
                        }
                    }
                }
            }

            if node.handle_count_add(-1) == 0 {
                let delete_pending = node.delete_pending();
                if delete_pending {
                    node.zero_file_size();
                }
                if delete_pending || node.truncate_on_close() {
                    node.truncate_allocation_to_size(&self.params);
                }
                node.set_truncate_on_close(false);
            }
        }
        drop(dropped);
    }

    /// CLOSE: drop the opener's counters; unlink from the name table when
    /// the open count reaches zero and from the active list when the
    /// active count does.
    pub(crate) fn node_close(
        &self,
        node: &Arc<FileNode>,
        desc: Option<&FileDesc>,
        handle_cleanup: bool,
    ) {
        let mut removed = None;
        {
            let mut table = self.table.lock();

            if let Some(desc) = desc {
                match node.main_file() {
                    None => {
                        if desc.granted.wants_delete() {
                            node.main_file_deny_delete_add(-1);
                        }
                    }
                    Some(main) => {
                        if desc.granted.shares_object()
                            && !desc.share.contains(ShareMode::DELETE)
                        {
                            main.stream_deny_delete_add(-1);
                        }
                    }
                }
                node.share_access.lock().remove(desc.granted, desc.share);
            }

            if handle_cleanup {
                node.handle_count_add(-1);
            }

            if node.open_count() > 0 && node.open_count_add(-1) == 0 {
                let name = node.name();
                if let Some(existing) = table.lookup(&name) {
                    if Arc::ptr_eq(&existing, node) {
                        removed = table.remove(&name);
                    }
                }
            }

            if node.active_count_add(-1) == 0 {
                table.active_remove(node);
            }
        }
        drop(removed);
    }

    /// Snapshot the nodes with in-flight activity.
    #[must_use]
    pub fn copy_active_list(&self) -> Vec<Arc<FileNode>> {
        self.table.lock().active_nodes()
    }

    /// Snapshot every node currently named in the table.
    #[must_use]
    pub fn copy_open_list(&self) -> Vec<Arc<FileNode>> {
        self.table.lock().open_nodes()
    }

    /// Look up a live node by canonical name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.table.lock().lookup(name)
    }

    /// Answer a by-name metadata query purely from cache; `None` means the
    /// caller must open the file and ask the back-end.
    #[must_use]
    pub fn try_get_file_info_by_name(&self, name: &str) -> Option<FileInfo> {
        let node = self.lookup(name)?;
        node.try_file_info()
    }

    // ----- metadata cache slots -----
    //
    // Security, stream listings and extended attributes are identity-level
    // state and live on the main file; directory listings are per-node.
    // The caller holds the node's main resource for set/reference; the
    // slot mutex additionally orders racing invalidations.

    /// Pin the cached security descriptor.
    #[must_use]
    pub fn reference_security(&self, node: &FileNode) -> Option<CachedBuf> {
        let handle = node.main_or_self().slots.lock().security;
        self.security_cache.reference(handle)
    }

    /// Replace the cached security descriptor (`None` just drops it).
    pub fn set_security(&self, node: &FileNode, buf: Option<&[u8]>) {
        let target = node.main_or_self();
        let old = target.slots.lock().security;
        self.security_cache.invalidate(old);
        let new = buf.map_or(0, |b| self.security_cache.add(b));
        node.bump_security_change_number();
        target.slots.lock().security = new;
    }

    /// Optimistically replace the cached security descriptor.
    pub fn try_set_security(&self, node: &FileNode, buf: Option<&[u8]>, change_number: u32) -> bool {
        if node.security_change_number() != change_number {
            return false;
        }
        self.set_security(node, buf);
        true
    }

    /// Drop the cached security descriptor.
    pub fn invalidate_security(&self, node: &FileNode) {
        let handle = node.main_or_self().slots.lock().security;
        self.security_cache.invalidate(handle);
    }

    /// Pin the cached directory listing.
    #[must_use]
    pub fn reference_dir_info(&self, node: &FileNode) -> Option<CachedBuf> {
        let handle = node.slots.lock().dir_info;
        self.dir_cache.reference(handle)
    }

    /// Replace the cached directory listing.
    pub fn set_dir_info(&self, node: &FileNode, buf: Option<&[u8]>) {
        let old = node.slots.lock().dir_info;
        self.dir_cache.invalidate(old);
        let new = buf.map_or(0, |b| self.dir_cache.add(b));
        node.bump_dir_info_change_number();
        node.slots.lock().dir_info = new;
    }

    /// Optimistically replace the cached directory listing.
    pub fn try_set_dir_info(&self, node: &FileNode, buf: Option<&[u8]>, change_number: u32) -> bool {
        if node.dir_info_change_number() != change_number {
            return false;
        }
        self.set_dir_info(node, buf);
        true
    }

    /// Drop the cached directory listing.
    pub fn invalidate_dir_info(&self, node: &FileNode) {
        let handle = node.slots.lock().dir_info;
        self.dir_cache.invalidate(handle);
    }

    /// Drop the cached listing of the directory named `name`, if open.
    pub fn invalidate_dir_info_by_name(&self, name: &str) {
        let node = self.lookup(name);
        if let Some(node) = node {
            self.invalidate_dir_info(&node);
        }
    }

    /// Drop the cached listing of the node's parent directory.
    pub fn invalidate_parent_dir_info(&self, node: &FileNode) {
        let name = node.name();
        if name == path::ROOT {
            return;
        }
        let (parent, _) = path::split_parent(&name);
        self.invalidate_dir_info_by_name(parent);
    }

    /// Pin the cached stream listing.
    #[must_use]
    pub fn reference_stream_info(&self, node: &FileNode) -> Option<CachedBuf> {
        let handle = node.main_or_self().slots.lock().stream_info;
        self.stream_cache.reference(handle)
    }

    /// Replace the cached stream listing.
    pub fn set_stream_info(&self, node: &FileNode, buf: Option<&[u8]>) {
        let target = node.main_or_self();
        let old = target.slots.lock().stream_info;
        self.stream_cache.invalidate(old);
        let new = buf.map_or(0, |b| self.stream_cache.add(b));
        node.bump_stream_info_change_number();
        target.slots.lock().stream_info = new;
    }

    /// Optimistically replace the cached stream listing.
    pub fn try_set_stream_info(
        &self,
        node: &FileNode,
        buf: Option<&[u8]>,
        change_number: u32,
    ) -> bool {
        if node.stream_info_change_number() != change_number {
            return false;
        }
        self.set_stream_info(node, buf);
        true
    }

    /// Drop the cached stream listing.
    pub fn invalidate_stream_info(&self, node: &FileNode) {
        let handle = node.main_or_self().slots.lock().stream_info;
        self.stream_cache.invalidate(handle);
    }

    /// Pin the cached extended attributes.
    #[must_use]
    pub fn reference_ea(&self, node: &FileNode) -> Option<CachedBuf> {
        let handle = node.main_or_self().slots.lock().ea;
        self.ea_cache.reference(handle)
    }

    /// Replace the cached extended attributes.
    pub fn set_ea(&self, node: &FileNode, buf: Option<&[u8]>) {
        let target = node.main_or_self();
        let old = target.slots.lock().ea;
        self.ea_cache.invalidate(old);
        let new = buf.map_or(0, |b| self.ea_cache.add(b));
        node.bump_ea_change_number();
        target.slots.lock().ea = new;
    }

    /// Optimistically replace the cached extended attributes.
    pub fn try_set_ea(&self, node: &FileNode, buf: Option<&[u8]>, change_number: u32) -> bool {
        if node.ea_change_number() != change_number {
            return false;
        }
        self.set_ea(node, buf);
        true
    }

    /// Drop the cached extended attributes.
    pub fn invalidate_ea(&self, node: &FileNode) {
        let handle = node.main_or_self().slots.lock().ea;
        self.ea_cache.invalidate(handle);
    }

    /// Drop every cached item attached to `node`.
    pub fn invalidate_all_meta(&self, node: &FileNode) {
        node.invalidate_file_info();
        self.invalidate_security(node);
        self.invalidate_dir_info(node);
        self.invalidate_stream_info(node);
        self.invalidate_ea(node);
    }

    // ----- volume info -----

    /// Volume statistics, cached under the file-info timeout.
    pub fn get_volume_info(&self, req: &Request) -> FsResult<VolumeInfo> {
        let now = Instant::now();
        {
            let cached = self.volume_info.lock();
            if let Some((info, expiry)) = cached.as_ref() {
                if expiry.valid_at(now) {
                    return Ok(info.clone());
                }
            }
        }
        let info = self.call_backend(req, |b| b.get_volume_info())?;
        *self.volume_info.lock() = Some((
            info.clone(),
            Expiry::from_timeout(self.params.file_info_timeout(), now),
        ));
        Ok(info)
    }

    /// Drop the cached volume statistics.
    pub fn invalidate_volume_info(&self) {
        *self.volume_info.lock() = None;
    }

    // ----- change notification -----

    /// Report a change against an open node. The caller holds the node's
    /// main resource. Stream nodes report the stream-flavored filter and
    /// action codes; `invalidate_caches` additionally drops the volume
    /// info and the parent listing (or the stream listing, for streams).
    pub fn notify_change(
        &self,
        node: &FileNode,
        filter: NotifyFilter,
        action: NotifyAction,
        invalidate_caches: bool,
    ) {
        let (filter, action) = if node.is_stream() {
            translate_for_stream(filter, action)
        } else {
            (filter, action)
        };
        if filter.is_empty() {
            return;
        }

        let name = node.name();
        if invalidate_caches {
            self.invalidate_volume_info();
            if node.is_stream() {
                self.invalidate_stream_info(node);
            } else if name != path::ROOT {
                let (parent, _) = path::split_parent(&name);
                self.invalidate_dir_info_by_name(parent);
            }
        }

        self.notify
            .report(&name, path::suffix_offset(&name), filter, action);
    }

    /// Out-of-band change report by name, for back-ends that mutate the
    /// tree behind the engine's back: flushes and purges the node's data
    /// (if open), invalidates every cache, then dispatches the
    /// notification. With no live node the notification alone goes out
    /// against the name.
    pub fn notify_change_by_name(
        &self,
        req: &Request,
        name: &str,
        filter: NotifyFilter,
        action: NotifyAction,
        invalidate_parent_caches: bool,
    ) {
        use crate::node_lock::Acquire;

        debug!("notify_change_by_name: {name:?} {filter:?} {action:?}");

        let node = self.lookup(name);
        match node {
            Some(node) => {
                node.acquire_exclusive(Acquire::FULL, req);

                if node.section.has_data_section() {
                    node.section.set_data_section(false);
                }
                self.invalidate_all_meta(&node);
                self.notify_change(&node, filter, action, invalidate_parent_caches);

                node.release(Acquire::FULL, req);
            }
            None => {
                let (filter, action) = if path::is_stream_name(name) {
                    translate_for_stream(filter, action)
                } else {
                    (filter, action)
                };
                if filter.is_empty() {
                    return;
                }
                self.invalidate_volume_info();
                if invalidate_parent_caches && name != path::ROOT {
                    let (main, _) = path::split_stream(name);
                    let (parent, _) = path::split_parent(main);
                    self.invalidate_dir_info_by_name(parent);
                }
                self.notify
                    .report(name, path::suffix_offset(name), filter, action);
            }
        }
    }
}
