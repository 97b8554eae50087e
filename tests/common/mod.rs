//! Shared fixtures for the engine test suites.

#![allow(dead_code)]

pub mod memfs;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use self::memfs::MemFs;
use userfs::CreateArgs;
use userfs::CreateDisposition;
use userfs::FileAccess;
use userfs::FileHandle;
use userfs::FileInfo;
use userfs::FsResult;
use userfs::Request;
use userfs::ShareMode;
use userfs::Volume;
use userfs::VolumeParams;

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// A fresh request context with a unique id.
pub fn req() -> Request {
    Request::new(NEXT_REQUEST.fetch_add(1, Ordering::Relaxed))
}

/// Volume parameters the suites run with: named streams on, reparse
/// points on, case sensitive, metadata cached forever.
pub fn default_params() -> VolumeParams {
    let mut params = VolumeParams::default();
    params.set_sector_size(512).unwrap();
    params.set_sectors_per_allocation_unit(8).unwrap();
    params.set_file_info_timeout(u32::MAX).unwrap();
    params.set_named_streams(true);
    params.set_reparse_points(true);
    params
}

/// A fresh volume over a fresh memfs.
pub fn volume() -> Volume<MemFs> {
    Volume::new(default_params(), MemFs::new())
}

/// A fresh volume with custom parameters.
pub fn volume_with(params: VolumeParams) -> Volume<MemFs> {
    Volume::new(params, MemFs::new())
}

/// Read/write access plus the attribute rights every opener gets.
pub fn rw_access() -> FileAccess {
    FileAccess::READ_DATA
        | FileAccess::WRITE_DATA
        | FileAccess::READ_ATTRIBUTES
        | FileAccess::WRITE_ATTRIBUTES
}

/// Create arguments with sane defaults for the suites.
pub fn args(
    access: FileAccess,
    share: ShareMode,
    disposition: CreateDisposition,
) -> CreateArgs<'static> {
    CreateArgs {
        access,
        share,
        disposition,
        ..CreateArgs::default()
    }
}

/// Create a file with read/write access sharing everything.
pub fn create_file(vol: &Volume<MemFs>, name: &str) -> FsResult<(FileHandle, FileInfo)> {
    vol.create(
        &req(),
        name,
        &args(rw_access(), ShareMode::all(), CreateDisposition::Create),
    )
}

/// Create a directory with read access sharing everything.
pub fn create_dir(vol: &Volume<MemFs>, name: &str) -> FsResult<(FileHandle, FileInfo)> {
    let mut create_args = args(
        FileAccess::READ_DATA | FileAccess::READ_ATTRIBUTES,
        ShareMode::all(),
        CreateDisposition::Create,
    );
    create_args.directory = true;
    vol.create(&req(), name, &create_args)
}

/// Open an existing file with the given access/share.
pub fn open_file(
    vol: &Volume<MemFs>,
    name: &str,
    access: FileAccess,
    share: ShareMode,
) -> FsResult<(FileHandle, FileInfo)> {
    vol.create(&req(), name, &args(access, share, CreateDisposition::Open))
}

/// Cleanup plus close, the way the transport retires a handle.
pub fn close(vol: &Volume<MemFs>, fh: FileHandle) {
    vol.cleanup(&req(), fh).unwrap();
    vol.close(&req(), fh).unwrap();
}
