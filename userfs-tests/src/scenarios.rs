//! End-to-end scenarios run against the engine with the in-memory
//! file system behind it.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use anyhow::ensure;
use log::info;
use userfs::CreateArgs;
use userfs::CreateDisposition;
use userfs::FileAccess;
use userfs::FileHandle;
use userfs::FsError;
use userfs::LockOwner;
use userfs::Operation;
use userfs::Request;
use userfs::ShareMode;
use userfs::SharingViolationReason;
use userfs::Volume;
use userfs::VolumeParams;

use crate::memfs::MemFs;

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

fn req() -> Request {
    Request::new(NEXT_REQUEST.fetch_add(1, Ordering::Relaxed))
}

fn volume() -> Volume<MemFs> {
    let mut params = VolumeParams::default();
    params.set_sector_size(512).expect("sector size");
    params
        .set_sectors_per_allocation_unit(8)
        .expect("allocation unit");
    params.set_file_info_timeout(u32::MAX).expect("timeout");
    params.set_named_streams(true);
    Volume::new(params, MemFs::new())
}

fn rw() -> FileAccess {
    FileAccess::READ_DATA
        | FileAccess::WRITE_DATA
        | FileAccess::READ_ATTRIBUTES
        | FileAccess::WRITE_ATTRIBUTES
}

fn open_with(
    vol: &Volume<MemFs>,
    name: &str,
    access: FileAccess,
    share: ShareMode,
    disposition: CreateDisposition,
) -> Result<FileHandle, FsError> {
    vol.create(
        &req(),
        name,
        &CreateArgs {
            access,
            share,
            disposition,
            ..CreateArgs::default()
        },
    )
    .map(|(fh, _)| fh)
}

fn make(
    vol: &Volume<MemFs>,
    name: &str,
    access: FileAccess,
    share: ShareMode,
    disposition: CreateDisposition,
) -> Result<FileHandle> {
    open_with(vol, name, access, share, disposition)
        .map_err(|err| anyhow::anyhow!("create {name:?}: {err}"))
}

fn make_dir(vol: &Volume<MemFs>, name: &str) -> Result<FileHandle> {
    vol.create(
        &req(),
        name,
        &CreateArgs {
            access: FileAccess::READ_ATTRIBUTES,
            share: ShareMode::all(),
            disposition: CreateDisposition::Create,
            directory: true,
            ..CreateArgs::default()
        },
    )
    .map(|(fh, _)| fh)
    .map_err(|err| anyhow::anyhow!("create dir {name:?}: {err}"))
}

fn retire(vol: &Volume<MemFs>, fh: FileHandle) -> Result<()> {
    vol.cleanup(&req(), fh).context("cleanup")?;
    vol.close(&req(), fh).context("close")?;
    Ok(())
}

/// Streams outlive their main file's handles and keep working.
pub fn streams() -> Result<()> {
    let vol = volume();
    let main = make(&vol, "\\a", rw(), ShareMode::all(), CreateDisposition::Create)?;
    let s1 = make(&vol, "\\a:s1", rw(), ShareMode::all(), CreateDisposition::Create)?;
    let s2 = make(&vol, "\\a:s2", rw(), ShareMode::all(), CreateDisposition::Create)?;

    let streams = vol.query_streams(&req(), main).context("query streams")?;
    ensure!(streams.len() == 3, "expected 3 streams, got {}", streams.len());

    retire(&vol, main)?;

    vol.write(&req(), s1, Some(0), b"payload", false, LockOwner(1))
        .context("write stream after main close")?;
    let back = vol
        .read(&req(), s1, 0, 16, LockOwner(1))
        .context("read stream back")?;
    ensure!(back == b"payload", "stream payload mismatch");

    retire(&vol, s1)?;
    retire(&vol, s2)?;

    let fresh = make(&vol, "\\a", rw(), ShareMode::all(), CreateDisposition::Open)?;
    retire(&vol, fresh)?;
    info!("streams scenario passed");
    Ok(())
}

/// Cross-stream deny-delete: delete-holding main opens block streams.
pub fn cross_stream_sharing() -> Result<()> {
    let vol = volume();
    let main = make(&vol, "\\a", rw(), ShareMode::all(), CreateDisposition::Create)?;
    let s1 = make(&vol, "\\a:s1", rw(), ShareMode::all(), CreateDisposition::Create)?;
    retire(&vol, s1)?;
    retire(&vol, main)?;

    let holder = make(
        &vol,
        "\\a",
        rw() | FileAccess::DELETE,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
    )?;

    match open_with(
        &vol,
        "\\a:s1",
        FileAccess::READ_DATA,
        ShareMode::READ | ShareMode::WRITE,
        CreateDisposition::Open,
    ) {
        Err(FsError::SharingViolation(SharingViolationReason::MainFile)) => {}
        Err(err) => bail!("wrong failure for denied stream open: {err}"),
        Ok(_) => bail!("stream open should have failed with a sharing violation"),
    }

    let shared = make(
        &vol,
        "\\a:s1",
        FileAccess::READ_DATA,
        ShareMode::all(),
        CreateDisposition::Open,
    )?;
    retire(&vol, shared)?;
    retire(&vol, holder)?;
    info!("cross-stream sharing scenario passed");
    Ok(())
}

/// Renaming a directory carries the whole subtree, identities intact.
pub fn rename_subtree() -> Result<()> {
    let vol = volume();
    let d1 = make_dir(&vol, "\\d1")?;
    let f = make(&vol, "\\d1\\f", rw(), ShareMode::all(), CreateDisposition::Create)?;
    let node = vol.lookup("\\d1\\f").context("node for \\d1\\f")?;
    // cleaned up but still open, the mapped-view pattern
    vol.cleanup(&req(), f).context("cleanup inner file")?;

    vol.dispatch(
        &req(),
        Operation::Rename {
            fh: d1,
            new_name: "\\d2",
            replace_if_exists: false,
            posix: false,
        },
    )
    .map_err(|err| anyhow::anyhow!("rename \\d1 -> \\d2: {err}"))?;

    ensure!(vol.lookup("\\d1\\f").is_none(), "old name still resolves");
    let moved = vol.lookup("\\d2\\f").context("new name must resolve")?;
    ensure!(Arc::ptr_eq(&moved, &node), "node identity changed");

    vol.close(&req(), f).context("close inner file")?;
    retire(&vol, d1)?;
    info!("rename scenario passed");
    Ok(())
}

/// Two concurrent appenders each land a whole 1KiB record.
pub fn concurrent_append() -> Result<()> {
    let vol = Arc::new(volume());
    let fh1 = make(
        &vol,
        "\\log",
        rw() | FileAccess::APPEND_DATA,
        ShareMode::all(),
        CreateDisposition::Create,
    )?;
    let fh2 = make(
        &vol,
        "\\log",
        rw() | FileAccess::APPEND_DATA,
        ShareMode::all(),
        CreateDisposition::Open,
    )?;

    let mut writers = Vec::new();
    for (fh, fill) in [(fh1, b'a'), (fh2, b'b')] {
        let vol = Arc::clone(&vol);
        writers.push(thread::spawn(move || {
            vol.write(&req(), fh, None, &[fill; 1024], false, LockOwner(u64::from(fill)))
                .map(|(n, _)| n)
        }));
    }
    for writer in writers {
        let written = writer
            .join()
            .map_err(|_| anyhow::anyhow!("appender panicked"))?
            .map_err(|err| anyhow::anyhow!("append: {err}"))?;
        ensure!(written == 1024, "short append: {written}");
    }

    let content = vol.backend().content("\\log").context("log content")?;
    ensure!(content.len() == 2048, "lost bytes: {}", content.len());
    ensure!(
        content[..1024].iter().all(|&b| b == content[0])
            && content[1024..].iter().all(|&b| b == content[1024]),
        "interleaved appends"
    );

    retire(&vol, fh1)?;
    retire(&vol, fh2)?;
    info!("append scenario passed");
    Ok(())
}

/// Delete-on-close unlinks the name and lets it be recreated.
pub fn lifecycle() -> Result<()> {
    let vol = volume();
    let (fh, _) = vol
        .create(
            &req(),
            "\\victim",
            &CreateArgs {
                access: rw() | FileAccess::DELETE,
                share: ShareMode::all(),
                disposition: CreateDisposition::Create,
                delete_on_close: true,
                ..CreateArgs::default()
            },
        )
        .map_err(|err| anyhow::anyhow!("create \\victim: {err}"))?;
    retire(&vol, fh)?;
    ensure!(vol.lookup("\\victim").is_none(), "node lingered");
    ensure!(!vol.backend().exists("\\victim"), "file lingered");

    let again = make(&vol, "\\victim", rw(), ShareMode::all(), CreateDisposition::Create)?;
    retire(&vol, again)?;
    info!("lifecycle scenario passed");
    Ok(())
}
