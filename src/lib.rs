//! User-mode file system engine.
//!
//! This crate is the in-process core that sits between a kernel-style
//! file-system request stream and a user-supplied back-end implementing the
//! actual file system. The engine owns everything that makes concurrent
//! kernel semantics work — the file-node table with share-access and
//! delete-pending accounting, two-level node locking, expiring metadata
//! caches, the open/cleanup/close lifecycle, atomic subtree rename and
//! directory change notification — while the [`Backend`] trait supplies the
//! business logic.
//!
//! The transport that decodes kernel requests and posts replies is out of
//! scope; its entire contract is the [`Operation`]/[`Reply`] pair accepted
//! by [`Volume::dispatch`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use log::warn;

pub use crate::access::FileAccess;
pub use crate::access::ShareMode;
pub use crate::attributes::FileAttributes;
pub use crate::create::CreateArgs;
pub use crate::create::CreateDisposition;
pub use crate::dir_buf::DirEntry;
pub use crate::dir_buf::StreamEntry;
pub use crate::dispatch::Operation;
pub use crate::dispatch::Reply;
pub use crate::error::FsError;
pub use crate::error::FsResult;
pub use crate::error::SharingViolationReason;
pub use crate::file_desc::FileDesc;
pub use crate::meta_cache::CachedBuf;
pub use crate::meta_cache::MetaCache;
pub use crate::name_table::NameTable;
pub use crate::name_table::RestartKey;
pub use crate::node::BasicInfo;
pub use crate::node::FileInfo;
pub use crate::node::FileNode;
pub use crate::node::SectionState;
pub use crate::node_lock::Acquire;
pub use crate::node_lock::OwnerTag;
pub use crate::notify::ChangeEvent;
pub use crate::notify::NotifyBatch;
pub use crate::notify::NotifyList;
pub use crate::notify_filter::NotifyAction;
pub use crate::notify_filter::NotifyFilter;
pub use crate::oplock::Oplock;
pub use crate::oplock::OplockLevel;
pub use crate::range_lock::LockOwner;
pub use crate::range_lock::RangeLockTable;
pub use crate::request::Request;
pub use crate::share_access::ShareAccess;
pub use crate::volume::CleanupFlags;
pub use crate::volume::FileHandle;
pub use crate::volume::Volume;
pub use crate::volume_params::VolumeParams;

mod access;
mod attributes;
mod create;
mod descendants;
mod dir_buf;
mod dispatch;
mod error;
mod file_desc;
mod meta_cache;
mod name_table;
mod node;
mod node_lock;
mod notify;
mod notify_filter;
mod oplock;
pub mod path;
mod range_lock;
mod rename;
mod request;
mod share_access;
mod volume;
mod volume_params;

/// Volume statistics reported through `QUERY_VOLUME_INFO`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeInfo {
    /// Total volume size in bytes.
    pub total_size: u64,
    /// Free space in bytes.
    pub free_size: u64,
    /// Volume label.
    pub volume_label: String,
}

/// What a back-end `create`/`open` hands back.
#[derive(Clone, Debug, Default)]
pub struct OpenOutcome {
    /// The back-end's own handle for the opened file.
    pub fh: u64,
    /// Metadata of the opened file.
    pub info: FileInfo,
}

/// The user-supplied file system.
///
/// The engine calls these from its worker threads; implementations must be
/// re-entrant. The engine never calls in while holding a node lock in a
/// pattern that would deadlock a second concurrent call on the same node,
/// and re-entrant engine calls made from inside a callback see the locks
/// their request already holds.
///
/// Only the lifecycle callbacks are required; everything else defaults to
/// failing with [`FsError::Unsupported`].
#[allow(clippy::too_many_arguments)]
pub trait Backend: Send + Sync + 'static {
    /// Volume statistics.
    fn get_volume_info(&self) -> FsResult<VolumeInfo> {
        warn!("[Not Implemented] get_volume_info()");
        Err(FsError::Unsupported)
    }

    /// Security descriptor of `name`, without opening it.
    fn get_security_by_name(&self, _req: &Request, name: &str) -> FsResult<Vec<u8>> {
        warn!("[Not Implemented] get_security_by_name(name: {name:?})");
        Err(FsError::Unsupported)
    }

    /// Create a new file or directory and open it.
    fn create(&self, _req: &Request, name: &str, args: &CreateArgs<'_>) -> FsResult<OpenOutcome> {
        warn!(
            "[Not Implemented] create(name: {name:?}, disposition: {:?})",
            args.disposition
        );
        Err(FsError::Unsupported)
    }

    /// Open an existing file or directory.
    fn open(
        &self,
        _req: &Request,
        name: &str,
        access: FileAccess,
        _share: ShareMode,
    ) -> FsResult<OpenOutcome> {
        warn!("[Not Implemented] open(name: {name:?}, access: {access:?})");
        Err(FsError::Unsupported)
    }

    /// Overwrite or supersede an open file: truncate it, replace or merge
    /// its attributes, and return the fresh metadata.
    fn overwrite(
        &self,
        _req: &Request,
        fh: u64,
        attributes: FileAttributes,
        replace_attributes: bool,
        _allocation_size: u64,
        _ea: Option<&[u8]>,
    ) -> FsResult<FileInfo> {
        warn!(
            "[Not Implemented] overwrite(fh: {fh:#x}, attributes: {attributes:?}, \
            replace_attributes: {replace_attributes})"
        );
        Err(FsError::Unsupported)
    }

    /// The last user handle of a file object went away. `flags` carries
    /// the engine's delete/truncate/purge decision; there is no error to
    /// return.
    fn cleanup(&self, _req: &Request, _fh: u64, _name: &str, _flags: CleanupFlags) {}

    /// The file object itself is gone; release the back-end handle.
    fn close(&self, _req: &Request, _fh: u64);

    /// Fresh metadata for an open file.
    fn get_file_info(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        warn!("[Not Implemented] get_file_info(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Set attributes and times.
    fn set_basic_info(&self, _req: &Request, fh: u64, basic: &BasicInfo) -> FsResult<FileInfo> {
        warn!("[Not Implemented] set_basic_info(fh: {fh:#x}, basic: {basic:?})");
        Err(FsError::Unsupported)
    }

    /// Reserve allocation, truncating data beyond it.
    fn set_allocation_size(
        &self,
        _req: &Request,
        fh: u64,
        allocation_size: u64,
    ) -> FsResult<FileInfo> {
        warn!(
            "[Not Implemented] set_allocation_size(fh: {fh:#x}, allocation_size: {allocation_size})"
        );
        Err(FsError::Unsupported)
    }

    /// Set the file size.
    fn set_file_size(&self, _req: &Request, fh: u64, file_size: u64) -> FsResult<FileInfo> {
        warn!("[Not Implemented] set_file_size(fh: {fh:#x}, file_size: {file_size})");
        Err(FsError::Unsupported)
    }

    /// May this file be deleted right now? (Non-empty directories say
    /// [`FsError::DirNotEmpty`].)
    fn can_delete(&self, _req: &Request, fh: u64, name: &str) -> FsResult<()> {
        warn!("[Not Implemented] can_delete(fh: {fh:#x}, name: {name:?})");
        Err(FsError::Unsupported)
    }

    /// Rename a file or directory. The engine has already verified the
    /// target is replaceable and holds every affected node locked.
    fn rename(
        &self,
        _req: &Request,
        fh: u64,
        name: &str,
        new_name: &str,
        _replace_if_exists: bool,
    ) -> FsResult<()> {
        warn!("[Not Implemented] rename(fh: {fh:#x}, name: {name:?}, new_name: {new_name:?})");
        Err(FsError::Unsupported)
    }

    /// Read file data.
    fn read(&self, _req: &Request, fh: u64, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        warn!("[Not Implemented] read(fh: {fh:#x}, offset: {offset}, length: {length})");
        Err(FsError::Unsupported)
    }

    /// Write file data; returns the bytes accepted and the resulting
    /// metadata.
    fn write(
        &self,
        _req: &Request,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> FsResult<(usize, FileInfo)> {
        warn!(
            "[Not Implemented] write(fh: {fh:#x}, offset: {offset}, data.len(): {})",
            data.len()
        );
        Err(FsError::Unsupported)
    }

    /// Flush dirty data; returns the resulting metadata.
    fn flush(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        warn!("[Not Implemented] flush(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Full child listing of an open directory. `pattern` and `marker`
    /// are hints; the engine filters and pages either way.
    fn read_directory(
        &self,
        _req: &Request,
        fh: u64,
        _pattern: Option<&str>,
        _marker: Option<&str>,
    ) -> FsResult<Vec<DirEntry>> {
        warn!("[Not Implemented] read_directory(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Read the extended-attributes blob.
    fn read_ea(&self, _req: &Request, fh: u64) -> FsResult<Vec<u8>> {
        warn!("[Not Implemented] read_ea(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Replace the extended-attributes blob.
    fn write_ea(&self, _req: &Request, fh: u64, ea: &[u8]) -> FsResult<FileInfo> {
        warn!("[Not Implemented] write_ea(fh: {fh:#x}, ea.len(): {})", ea.len());
        Err(FsError::Unsupported)
    }

    /// Read the reparse point attached to an open file.
    fn get_reparse_point(&self, _req: &Request, fh: u64) -> FsResult<(u32, Vec<u8>)> {
        warn!("[Not Implemented] get_reparse_point(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Attach a reparse point.
    fn set_reparse_point(&self, _req: &Request, fh: u64, tag: u32, data: &[u8]) -> FsResult<()> {
        warn!(
            "[Not Implemented] set_reparse_point(fh: {fh:#x}, tag: {tag:#x}, data.len(): {})",
            data.len()
        );
        Err(FsError::Unsupported)
    }

    /// Remove a reparse point.
    fn delete_reparse_point(&self, _req: &Request, fh: u64, tag: u32) -> FsResult<()> {
        warn!("[Not Implemented] delete_reparse_point(fh: {fh:#x}, tag: {tag:#x})");
        Err(FsError::Unsupported)
    }

    /// List the named streams of an open file.
    fn get_stream_info(&self, _req: &Request, fh: u64) -> FsResult<Vec<StreamEntry>> {
        warn!("[Not Implemented] get_stream_info(fh: {fh:#x})");
        Err(FsError::Unsupported)
    }

    /// Resolve reparse points along `name`; `None` when the path has no
    /// reparse point to follow.
    fn resolve_reparse_points(&self, _req: &Request, _name: &str) -> FsResult<Option<String>> {
        Ok(None)
    }
}
