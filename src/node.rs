//! File nodes.
//!
//! A [`FileNode`] is the identity of one opened file or named stream. Nodes
//! are shared as `Arc<FileNode>`: the name table holds one strong reference
//! per inserted node, requests and enumerations take temporary ones, and the
//! node is destroyed on the final drop. A stream node keeps a strong
//! back-reference to its main file for its whole lifetime, so lock
//! redirection and cross-stream accounting never dangle.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::FileAttributes;
use crate::Request;
use crate::ShareAccess;
use crate::node_lock::Acquire;
use crate::node_lock::NodeResource;
use crate::node_lock::OwnerTag;
use crate::oplock::Oplock;
use crate::range_lock::RangeLockTable;
use crate::volume_params::VolumeParams;

/// The externally visible metadata of a file or stream.
///
/// Timestamps are opaque transport-defined units; the engine only stores
/// and compares them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    /// Basic attributes.
    pub attributes: FileAttributes,
    /// Reparse tag, or 0 when no reparse point is attached.
    pub reparse_tag: u32,
    /// Allocated size in bytes.
    pub allocation_size: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Creation time.
    pub creation_time: u64,
    /// Last-access time.
    pub last_access_time: u64,
    /// Last-write time.
    pub last_write_time: u64,
    /// Last metadata change time.
    pub change_time: u64,
    /// Serial number of the file within the volume.
    pub index_number: u64,
    /// Size of the extended attributes blob.
    pub ea_size: u32,
}

/// The subset of [`FileInfo`] settable through `SET_INFO(basic)`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BasicInfo {
    /// New attributes, or `None` to leave unchanged.
    pub attributes: Option<FileAttributes>,
    /// New creation time, or 0 to leave unchanged.
    pub creation_time: u64,
    /// New last-access time, or 0 to leave unchanged.
    pub last_access_time: u64,
    /// New last-write time, or 0 to leave unchanged.
    pub last_write_time: u64,
    /// New change time, or 0 to leave unchanged.
    pub change_time: u64,
}

/// Validity window of cached file info.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum Expiry {
    /// Not cached (or explicitly invalidated).
    #[default]
    Invalid,
    /// Valid until the deadline.
    At(Instant),
    /// Never expires (infinite file-info timeout).
    Never,
}

impl Expiry {
    pub(crate) fn valid_at(self, now: Instant) -> bool {
        match self {
            Expiry::Invalid => false,
            Expiry::At(deadline) => now <= deadline,
            Expiry::Never => true,
        }
    }

    pub(crate) fn from_timeout(timeout_millis: u32, now: Instant) -> Expiry {
        match timeout_millis {
            0 => Expiry::Invalid,
            u32::MAX => Expiry::Never,
            ms => Expiry::At(now + Duration::from_millis(u64::from(ms))),
        }
    }
}

#[derive(Debug, Default)]
struct NodeInfo {
    attributes: FileAttributes,
    reparse_tag: u32,
    ea_size: u32,
    creation_time: u64,
    last_access_time: u64,
    last_write_time: u64,
    change_time: u64,
    index_number: u64,
    allocation_size: u64,
    file_size: u64,
    file_info_expiry: Expiry,
    basic_info_expiry: Expiry,
}

/// Handles into the volume metadata caches. The slot words are written
/// under this mutex because `invalidate` may race a concurrent `set` that
/// holds only the node's main resource.
#[derive(Debug, Default)]
pub(crate) struct MetaSlots {
    pub(crate) security: u64,
    pub(crate) dir_info: u64,
    pub(crate) stream_info: u64,
    pub(crate) ea: u64,
}

/// Memory-section facts the engine must answer without a real memory
/// manager: the transport maintains these via `Volume` entry points, and
/// the share-access and rename checks consume them.
#[derive(Debug, Default)]
pub struct SectionState {
    user_writable: AtomicU32,
    image_section: AtomicBool,
    data_section: AtomicBool,
}

impl SectionState {
    /// Are there outstanding user-writable section references?
    #[must_use]
    pub fn has_user_writable_refs(&self) -> bool {
        self.user_writable.load(Ordering::Acquire) != 0
    }

    /// Record a writable mapping of the node.
    pub fn add_user_writable_ref(&self) {
        self.user_writable.fetch_add(1, Ordering::AcqRel);
        self.data_section.store(true, Ordering::Release);
    }

    /// Drop a writable mapping of the node.
    pub fn remove_user_writable_ref(&self) {
        self.user_writable.fetch_sub(1, Ordering::AcqRel);
    }

    /// Is the node mapped as an executable image?
    #[must_use]
    pub fn has_image_section(&self) -> bool {
        self.image_section.load(Ordering::Acquire)
    }

    /// Mark or clear the image-section fact.
    pub fn set_image_section(&self, mapped: bool) {
        self.image_section.store(mapped, Ordering::Release);
    }

    /// Is a data section (cached mapping) present?
    #[must_use]
    pub fn has_data_section(&self) -> bool {
        self.data_section.load(Ordering::Acquire)
    }

    /// Mark or clear the data-section fact.
    pub fn set_data_section(&self, mapped: bool) {
        self.data_section.store(mapped, Ordering::Release);
    }

    /// Force-close the node's sections (rename flush path). Fails when
    /// writable references are still outstanding.
    pub fn force_close(&self) -> bool {
        if self.has_user_writable_refs() {
            return false;
        }
        self.image_section.store(false, Ordering::Release);
        self.data_section.store(false, Ordering::Release);
        true
    }
}

/// One opened file or named stream.
#[derive(Debug)]
pub struct FileNode {
    name: RwLock<String>,
    main_file: Option<Arc<FileNode>>,
    is_directory: AtomicBool,

    // counters; mutated only under the name-table lock
    open_count: AtomicU32,
    handle_count: AtomicU32,
    active_count: AtomicU32,

    pub(crate) share_access: Mutex<ShareAccess>,
    delete_pending: AtomicBool,
    posix_delete: AtomicBool,
    truncate_on_close: AtomicBool,
    main_file_deny_delete: AtomicU32,
    stream_deny_delete: AtomicU32,

    info: Mutex<NodeInfo>,
    file_info_change_number: AtomicU32,
    security_change_number: AtomicU32,
    dir_info_change_number: AtomicU32,
    stream_info_change_number: AtomicU32,
    ea_change_number: AtomicU32,
    pub(crate) slots: Mutex<MetaSlots>,

    main_resource: NodeResource,
    pgio_resource: NodeResource,

    /// Byte-range locks; per-identity, so stream nodes redirect.
    range_locks: RangeLockTable,
    /// Oplock state for this node itself.
    pub(crate) oplock: Oplock,
    /// Section facts for this node.
    pub section: SectionState,
}

impl FileNode {
    /// Create a detached node; the open path inserts it into the name
    /// table. `main_file` wires a stream to its main file.
    #[must_use]
    pub(crate) fn new(
        name: String,
        main_file: Option<Arc<FileNode>>,
    ) -> Arc<FileNode> {
        Arc::new(FileNode {
            name: RwLock::new(name),
            main_file,
            is_directory: AtomicBool::new(false),
            open_count: AtomicU32::new(0),
            handle_count: AtomicU32::new(0),
            active_count: AtomicU32::new(0),
            share_access: Mutex::new(ShareAccess::default()),
            delete_pending: AtomicBool::new(false),
            posix_delete: AtomicBool::new(false),
            truncate_on_close: AtomicBool::new(false),
            main_file_deny_delete: AtomicU32::new(0),
            stream_deny_delete: AtomicU32::new(0),
            info: Mutex::new(NodeInfo::default()),
            file_info_change_number: AtomicU32::new(0),
            security_change_number: AtomicU32::new(0),
            dir_info_change_number: AtomicU32::new(0),
            stream_info_change_number: AtomicU32::new(0),
            ea_change_number: AtomicU32::new(0),
            slots: Mutex::new(MetaSlots::default()),
            main_resource: NodeResource::default(),
            pgio_resource: NodeResource::default(),
            range_locks: RangeLockTable::default(),
            oplock: Oplock::default(),
            section: SectionState::default(),
        })
    }

    /// Canonical name, as of now; rename rewrites it.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub(crate) fn with_name<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.name.read())
    }

    /// The stream's main file, or `None` for a main file.
    #[must_use]
    pub fn main_file(&self) -> Option<&Arc<FileNode>> {
        self.main_file.as_ref()
    }

    /// Is this node a named stream?
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.main_file.is_some()
    }

    /// The node that owns per-identity state: the main file for streams,
    /// the node itself otherwise.
    #[must_use]
    pub fn main_or_self(&self) -> &FileNode {
        self.main_file.as_deref().unwrap_or(self)
    }

    /// Is the node a directory? (False until the first info set.)
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.is_directory.load(Ordering::Acquire)
    }

    // counter accessors; callers mutate only under the name-table lock

    pub(crate) fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Acquire)
    }

    pub(crate) fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::Acquire)
    }

    pub(crate) fn counter_add(counter: &AtomicU32, delta: i32) -> u32 {
        if delta >= 0 {
            counter.fetch_add(delta as u32, Ordering::AcqRel) + delta as u32
        } else {
            let sub = delta.unsigned_abs();
            let prev = counter.fetch_sub(sub, Ordering::AcqRel);
            debug_assert!(prev >= sub, "node counter underflow");
            prev - sub
        }
    }

    pub(crate) fn open_count_add(&self, delta: i32) -> u32 {
        Self::counter_add(&self.open_count, delta)
    }

    pub(crate) fn open_count_zero(&self) {
        self.open_count.store(0, Ordering::Release);
    }

    pub(crate) fn handle_count_add(&self, delta: i32) -> u32 {
        Self::counter_add(&self.handle_count, delta)
    }

    pub(crate) fn active_count_add(&self, delta: i32) -> u32 {
        Self::counter_add(&self.active_count, delta)
    }

    /// Has the node been marked for deletion? Monotonic: set once, never
    /// cleared for this node instance.
    #[must_use]
    pub fn delete_pending(&self) -> bool {
        self.delete_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_delete_pending(&self) {
        self.delete_pending.store(true, Ordering::Release);
    }

    pub(crate) fn posix_delete(&self) -> bool {
        self.posix_delete.load(Ordering::Acquire)
    }

    pub(crate) fn set_posix_delete(&self) {
        self.posix_delete.store(true, Ordering::Release);
    }

    pub(crate) fn truncate_on_close(&self) -> bool {
        self.truncate_on_close.load(Ordering::Acquire)
    }

    pub(crate) fn set_truncate_on_close(&self, value: bool) {
        self.truncate_on_close.store(value, Ordering::Release);
    }

    pub(crate) fn main_file_deny_delete(&self) -> u32 {
        self.main_file_deny_delete.load(Ordering::Acquire)
    }

    pub(crate) fn main_file_deny_delete_add(&self, delta: i32) {
        Self::counter_add(&self.main_file_deny_delete, delta);
    }

    pub(crate) fn stream_deny_delete(&self) -> u32 {
        self.stream_deny_delete.load(Ordering::Acquire)
    }

    pub(crate) fn stream_deny_delete_add(&self, delta: i32) {
        Self::counter_add(&self.stream_deny_delete, delta);
    }

    /// Byte-range locks; redirected to the main file so locks are
    /// per-identity.
    #[must_use]
    pub fn range_locks(&self) -> &RangeLockTable {
        &self.main_or_self().range_locks
    }

    /// Current oplock level on the node's identity.
    #[must_use]
    pub fn oplock_level(&self) -> crate::oplock::OplockLevel {
        self.main_or_self().oplock.level()
    }

    // ----- two-level locking (§ locking protocol) -----
    //
    // All acquisitions on a stream redirect to the main file. Main is
    // acquired before Pgio; releases run in the opposite order. The
    // request context masks re-entrant acquisitions and catches
    // double-acquires.

    /// Acquire the flagged resources shared, blocking.
    pub fn acquire_shared(&self, flags: Acquire, req: &Request) {
        let target = self.main_or_self();
        let flags = req.wanted(flags);
        if flags.contains(Acquire::MAIN) {
            target.main_resource.acquire_shared();
        }
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.acquire_shared();
        }
        req.note_acquired(flags);
    }

    /// Try to acquire the flagged resources shared; on failure nothing is
    /// held.
    pub fn try_acquire_shared(&self, flags: Acquire, req: &Request) -> bool {
        let target = self.main_or_self();
        let flags = req.wanted(flags);
        if flags.contains(Acquire::MAIN) && !target.main_resource.try_acquire_shared() {
            return false;
        }
        if flags.contains(Acquire::PGIO) && !target.pgio_resource.try_acquire_shared() {
            if flags.contains(Acquire::MAIN) {
                target.main_resource.release();
            }
            return false;
        }
        req.note_acquired(flags);
        true
    }

    /// Acquire the flagged resources exclusive, blocking.
    pub fn acquire_exclusive(&self, flags: Acquire, req: &Request) {
        let target = self.main_or_self();
        let flags = req.wanted(flags);
        if flags.contains(Acquire::MAIN) {
            target.main_resource.acquire_exclusive();
        }
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.acquire_exclusive();
        }
        req.note_acquired(flags);
    }

    /// Try to acquire the flagged resources exclusive; on failure nothing
    /// is held.
    pub fn try_acquire_exclusive(&self, flags: Acquire, req: &Request) -> bool {
        let target = self.main_or_self();
        let flags = req.wanted(flags);
        if flags.contains(Acquire::MAIN) && !target.main_resource.try_acquire_exclusive() {
            return false;
        }
        if flags.contains(Acquire::PGIO) && !target.pgio_resource.try_acquire_exclusive() {
            if flags.contains(Acquire::MAIN) {
                target.main_resource.release();
            }
            return false;
        }
        req.note_acquired(flags);
        true
    }

    /// Downgrade exclusive holds to shared without releasing (Pgio first,
    /// then Main, mirroring release order).
    pub fn convert_exclusive_to_shared(&self, flags: Acquire, req: &Request) {
        let target = self.main_or_self();
        debug_assert!(req.held().contains(flags));
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.downgrade();
        }
        if flags.contains(Acquire::MAIN) {
            target.main_resource.downgrade();
        }
    }

    /// Transfer the flagged exclusive holds to `tag`: a completion routine
    /// on another thread may release them with
    /// [`FileNode::release_owner`]. The request stops tracking them.
    pub fn set_owner(&self, flags: Acquire, req: &Request) -> OwnerTag {
        let target = self.main_or_self();
        let tag = req.owner_tag();
        if flags.contains(Acquire::MAIN) {
            target.main_resource.set_owner(tag);
        }
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.set_owner(tag);
        }
        req.note_released(flags);
        tag
    }

    /// Release the flagged resources (Pgio before Main).
    pub fn release(&self, flags: Acquire, req: &Request) {
        let target = self.main_or_self();
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.release();
        }
        if flags.contains(Acquire::MAIN) {
            target.main_resource.release();
        }
        req.note_released(flags);
    }

    /// Release resources previously transferred with
    /// [`FileNode::set_owner`], presenting the tag.
    pub fn release_owner(&self, flags: Acquire, tag: OwnerTag) {
        let target = self.main_or_self();
        if flags.contains(Acquire::PGIO) {
            target.pgio_resource.release_owner(tag);
        }
        if flags.contains(Acquire::MAIN) {
            target.main_resource.release_owner(tag);
        }
    }

    /// Acquire the main resource exclusive on behalf of a *different*
    /// logical owner than the calling request (rename fan-out locks every
    /// descendant this way). Bypasses request accounting; pair with
    /// [`FileNode::release_foreign`].
    pub(crate) fn acquire_exclusive_foreign(&self, tag: OwnerTag) {
        let target = self.main_or_self();
        target.main_resource.acquire_exclusive();
        target.main_resource.set_owner(tag);
    }

    /// Release a hold taken with [`FileNode::acquire_exclusive_foreign`].
    pub(crate) fn release_foreign(&self, tag: OwnerTag) {
        self.main_or_self().main_resource.release_owner(tag);
    }

    // ----- file info -----

    /// Read the node's metadata, merging a stream's identity attributes
    /// from its main file (minus the directory bit).
    #[must_use]
    pub fn file_info(&self) -> FileInfo {
        let own = self.info.lock();
        let mut out = FileInfo {
            allocation_size: own.allocation_size,
            file_size: own.file_size,
            index_number: own.index_number,
            ..FileInfo::default()
        };
        match self.main_file.as_deref() {
            Some(main) => {
                let main_info = main.info.lock();
                out.attributes = main_info.attributes & FileAttributes::STREAM_MASK;
                out.reparse_tag = main_info.reparse_tag;
                out.creation_time = main_info.creation_time;
                out.last_access_time = main_info.last_access_time;
                out.last_write_time = main_info.last_write_time;
                out.change_time = main_info.change_time;
                out.ea_size = main_info.ea_size;
            }
            None => {
                out.attributes = own.attributes;
                out.reparse_tag = own.reparse_tag;
                out.creation_time = own.creation_time;
                out.last_access_time = own.last_access_time;
                out.last_write_time = own.last_write_time;
                out.change_time = own.change_time;
                out.ea_size = own.ea_size;
            }
        }
        out
    }

    /// Read the node's metadata only if the cached info is still valid;
    /// for a stream the main file's basic info must also be unexpired.
    #[must_use]
    pub fn try_file_info(&self) -> Option<FileInfo> {
        let now = Instant::now();
        if let Some(main) = self.main_file.as_deref() {
            if !main.info.lock().basic_info_expiry.valid_at(now) {
                return None;
            }
        }
        if !self.info.lock().file_info_expiry.valid_at(now) {
            return None;
        }
        Some(self.file_info())
    }

    /// Install fresh metadata from the back-end. With `truncate_on_close`
    /// a size change arms the truncate-on-close intent. Expirations restart
    /// from the volume's file-info timeout; change numbers advance.
    pub fn set_file_info(&self, params: &VolumeParams, info: &FileInfo, truncate_on_close: bool) {
        let allocation_unit = params.allocation_unit();
        let mut allocation_size = info.allocation_size.max(info.file_size);
        allocation_size = allocation_size.div_ceil(allocation_unit) * allocation_unit;

        let expiry = Expiry::from_timeout(params.file_info_timeout(), Instant::now());

        {
            let mut own = self.info.lock();
            if truncate_on_close
                && (own.allocation_size != allocation_size || own.file_size != info.file_size)
            {
                self.set_truncate_on_close(true);
            }
            own.allocation_size = allocation_size;
            own.file_size = info.file_size;
            own.index_number = info.index_number;
            own.file_info_expiry = expiry;
            own.basic_info_expiry = expiry;
        }
        self.file_info_change_number.fetch_add(1, Ordering::AcqRel);

        let (target, attributes_mask) = match self.main_file.as_deref() {
            Some(main) => {
                {
                    let mut main_info = main.info.lock();
                    main_info.basic_info_expiry = expiry;
                }
                main.file_info_change_number.fetch_add(1, Ordering::AcqRel);
                (main, FileAttributes::STREAM_MASK)
            }
            None => (self, FileAttributes::all()),
        };

        let mut target_info = target.info.lock();
        target_info.attributes = (target_info.attributes & !attributes_mask)
            | (info.attributes & attributes_mask);
        target_info.reparse_tag = info.reparse_tag;
        target_info.creation_time = info.creation_time;
        target_info.last_access_time = info.last_access_time;
        target_info.last_write_time = info.last_write_time;
        target_info.change_time = info.change_time;
        target_info.ea_size = info.ea_size;
        let is_directory = target_info.attributes.is_directory();
        drop(target_info);
        target
            .is_directory
            .store(is_directory, Ordering::Release);
    }

    /// Optimistic metadata install: fails when a mutator advanced the
    /// change number since the caller's snapshot.
    pub fn try_set_file_info(
        &self,
        params: &VolumeParams,
        info: &FileInfo,
        truncate_on_close: bool,
        change_number: u32,
    ) -> bool {
        if self.file_info_change_number() != change_number {
            return false;
        }
        self.set_file_info(params, info, truncate_on_close);
        true
    }

    /// Drop cached metadata; the next query refetches from the back-end.
    pub fn invalidate_file_info(&self) {
        {
            let mut own = self.info.lock();
            own.file_info_expiry = Expiry::Invalid;
            own.basic_info_expiry = Expiry::Invalid;
        }
        if let Some(main) = self.main_file.as_deref() {
            main.info.lock().basic_info_expiry = Expiry::Invalid;
        }
    }

    /// Update only the size fields (write/truncate fast path); does not
    /// touch expirations of identity metadata.
    pub fn set_file_sizes(&self, params: &VolumeParams, allocation_size: u64, file_size: u64) {
        let allocation_unit = params.allocation_unit();
        let allocation_size =
            allocation_size.max(file_size).div_ceil(allocation_unit) * allocation_unit;
        let mut own = self.info.lock();
        own.allocation_size = allocation_size;
        own.file_size = file_size;
    }

    /// Current sizes `(allocation, file)`.
    #[must_use]
    pub fn file_sizes(&self) -> (u64, u64) {
        let own = self.info.lock();
        (own.allocation_size, own.file_size)
    }

    pub(crate) fn zero_file_size(&self) {
        self.info.lock().file_size = 0;
    }

    pub(crate) fn truncate_allocation_to_size(&self, params: &VolumeParams) -> u64 {
        let allocation_unit = params.allocation_unit();
        let mut own = self.info.lock();
        own.allocation_size = own.file_size.div_ceil(allocation_unit) * allocation_unit;
        own.file_size
    }

    // ----- change numbers (stream nodes share identity-level numbers
    // with their main file) -----

    /// Change number guarding `try_set_file_info`.
    #[must_use]
    pub fn file_info_change_number(&self) -> u32 {
        self.file_info_change_number.load(Ordering::Acquire)
    }

    /// Change number of the security slot.
    #[must_use]
    pub fn security_change_number(&self) -> u32 {
        self.main_or_self().security_change_number.load(Ordering::Acquire)
    }

    /// Change number of the directory-listing slot.
    #[must_use]
    pub fn dir_info_change_number(&self) -> u32 {
        self.dir_info_change_number.load(Ordering::Acquire)
    }

    /// Change number of the stream-listing slot.
    #[must_use]
    pub fn stream_info_change_number(&self) -> u32 {
        self.main_or_self().stream_info_change_number.load(Ordering::Acquire)
    }

    /// Change number of the extended-attributes slot.
    #[must_use]
    pub fn ea_change_number(&self) -> u32 {
        self.main_or_self().ea_change_number.load(Ordering::Acquire)
    }

    pub(crate) fn bump_security_change_number(&self) {
        self.main_or_self()
            .security_change_number
            .fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_dir_info_change_number(&self) {
        self.dir_info_change_number.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_stream_info_change_number(&self) {
        self.main_or_self()
            .stream_info_change_number
            .fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_ea_change_number(&self) {
        self.main_or_self().ea_change_number.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_lock::Acquire;

    fn params() -> VolumeParams {
        let mut p = VolumeParams::default();
        p.set_sector_size(512).unwrap();
        p.set_sectors_per_allocation_unit(8).unwrap();
        p.set_file_info_timeout(u32::MAX).unwrap();
        p
    }

    fn info(size: u64) -> FileInfo {
        FileInfo {
            attributes: FileAttributes::ARCHIVE,
            file_size: size,
            allocation_size: size,
            creation_time: 100,
            last_write_time: 200,
            ..FileInfo::default()
        }
    }

    #[test]
    fn set_rounds_allocation_to_the_allocation_unit() {
        let node = FileNode::new("\\f".into(), None);
        node.set_file_info(&params(), &info(1000), false);
        let (allocation, size) = node.file_sizes();
        assert_eq!(size, 1000);
        assert_eq!(allocation, 4096);
    }

    #[test]
    fn try_get_respects_expiry() {
        let node = FileNode::new("\\f".into(), None);
        assert!(node.try_file_info().is_none());
        node.set_file_info(&params(), &info(10), false);
        assert_eq!(node.try_file_info().unwrap().file_size, 10);
        node.invalidate_file_info();
        assert!(node.try_file_info().is_none());
        // the plain getter still answers from the stale copy
        assert_eq!(node.file_info().file_size, 10);
    }

    #[test]
    fn try_set_detects_concurrent_mutation() {
        let node = FileNode::new("\\f".into(), None);
        let snapshot = node.file_info_change_number();
        node.set_file_info(&params(), &info(10), false);
        assert!(!node.try_set_file_info(&params(), &info(20), false, snapshot));
        let snapshot = node.file_info_change_number();
        assert!(node.try_set_file_info(&params(), &info(20), false, snapshot));
        assert_eq!(node.file_info().file_size, 20);
    }

    #[test]
    fn truncate_intent_arms_on_size_change_only() {
        let node = FileNode::new("\\f".into(), None);
        node.set_file_info(&params(), &info(10), true);
        assert!(node.truncate_on_close());

        let node = FileNode::new("\\g".into(), None);
        node.set_file_info(&params(), &info(10), false);
        node.set_file_info(&params(), &info(10), true);
        assert!(!node.truncate_on_close());
    }

    #[test]
    fn stream_nodes_merge_identity_from_the_main_file() {
        let main = FileNode::new("\\f".into(), None);
        main.set_file_info(
            &params(),
            &FileInfo {
                attributes: FileAttributes::DIRECTORY | FileAttributes::ARCHIVE,
                creation_time: 42,
                ..FileInfo::default()
            },
            false,
        );
        let stream = FileNode::new("\\f:s".into(), Some(main.clone()));
        stream.set_file_info(&params(), &info(7), false);

        let merged = stream.file_info();
        assert_eq!(merged.file_size, 7);
        assert_eq!(merged.creation_time, 100);
        assert!(!merged.attributes.is_directory());
        // the main file keeps its directory bit
        assert!(main.file_info().attributes.is_directory());
    }

    #[test]
    fn stream_expiry_depends_on_the_main_file() {
        let main = FileNode::new("\\f".into(), None);
        main.set_file_info(&params(), &info(1), false);
        let stream = FileNode::new("\\f:s".into(), Some(main.clone()));
        stream.set_file_info(&params(), &info(2), false);
        assert!(stream.try_file_info().is_some());

        main.invalidate_file_info();
        assert!(stream.try_file_info().is_none());
    }

    #[test]
    fn stream_locks_redirect_to_the_main_file() {
        let main = FileNode::new("\\f".into(), None);
        let stream = FileNode::new("\\f:s".into(), Some(main.clone()));
        let req = Request::new(1);
        let req2 = Request::new(2);

        stream.acquire_exclusive(Acquire::FULL, &req);
        assert!(!main.try_acquire_shared(Acquire::MAIN, &req2));
        stream.release(Acquire::FULL, &req);
        assert!(main.try_acquire_shared(Acquire::MAIN, &req2));
        main.release(Acquire::MAIN, &req2);
    }

    #[test]
    fn owner_transfer_round_trip() {
        let node = FileNode::new("\\f".into(), None);
        let req = Request::new(9);
        node.acquire_exclusive(Acquire::FULL, &req);
        let tag = node.set_owner(Acquire::FULL, &req);
        assert!(req.held().is_empty());

        let node2 = Arc::clone(&node);
        std::thread::spawn(move || node2.release_owner(Acquire::FULL, tag))
            .join()
            .unwrap();

        let req3 = Request::new(10);
        assert!(node.try_acquire_exclusive(Acquire::FULL, &req3));
        node.release(Acquire::FULL, &req3);
    }
}
