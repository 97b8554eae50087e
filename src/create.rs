//! The CREATE path.
//!
//! CREATE is the widest entry point: name validation, reparse resolution,
//! the back-end create/open per disposition, the share-access and
//! delete-pending gate, overwrite/supersede processing (stream teardown,
//! batch-oplock breaks), and the main-file open assist for stream opens.
//! The whole flow runs under a shared hold of the volume rename resource so
//! it can never observe a half-renamed subtree.

use std::sync::Arc;

use log::debug;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::Backend;
use crate::FileAccess;
use crate::FileAttributes;
use crate::FileDesc;
use crate::FileHandle;
use crate::FileInfo;
use crate::FileNode;
use crate::FsError;
use crate::FsResult;
use crate::NotifyAction;
use crate::NotifyFilter;
use crate::Request;
use crate::ShareMode;
use crate::Volume;
use crate::node_lock::Acquire;
use crate::path;

/// What a CREATE wants done about existence.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum CreateDisposition {
    /// Replace the file if it exists, create it otherwise.
    Supersede = 0,
    /// Open the file; fail if it does not exist.
    Open = 1,
    /// Create the file; fail if it exists.
    Create = 2,
    /// Open the file, creating it if necessary.
    OpenIf = 3,
    /// Open and truncate the file; fail if it does not exist.
    Overwrite = 4,
    /// Open and truncate the file, creating it if necessary.
    OverwriteIf = 5,
}

impl CreateDisposition {
    fn overwrites(self) -> bool {
        matches!(
            self,
            CreateDisposition::Supersede
                | CreateDisposition::Overwrite
                | CreateDisposition::OverwriteIf
        )
    }

    /// Access the disposition implies beyond what the caller asked for;
    /// the share check must pass as if it had been requested.
    fn additional_access(self) -> FileAccess {
        match self {
            CreateDisposition::Supersede => FileAccess::DELETE,
            CreateDisposition::Overwrite | CreateDisposition::OverwriteIf => {
                FileAccess::WRITE_DATA
            }
            _ => FileAccess::empty(),
        }
    }
}

/// Parameters of one CREATE.
#[derive(Clone, Copy, Debug)]
pub struct CreateArgs<'a> {
    /// Access to grant the new handle.
    pub access: FileAccess,
    /// Share mode declared for the new handle.
    pub share: ShareMode,
    /// Existence policy.
    pub disposition: CreateDisposition,
    /// Attributes for a created file.
    pub attributes: FileAttributes,
    /// Security descriptor for a created file.
    pub security: Option<&'a [u8]>,
    /// Initial allocation size hint.
    pub allocation_size: u64,
    /// Initial extended attributes for a created file.
    pub ea: Option<&'a [u8]>,
    /// Delete when the last handle closes.
    pub delete_on_close: bool,
    /// Unlink at cleanup regardless of other handles.
    pub posix_delete: bool,
    /// The caller requires a directory.
    pub directory: bool,
    /// The caller requires a non-directory.
    pub non_directory: bool,
}

impl Default for CreateArgs<'_> {
    fn default() -> Self {
        CreateArgs {
            access: FileAccess::empty(),
            share: ShareMode::empty(),
            disposition: CreateDisposition::Open,
            attributes: FileAttributes::empty(),
            security: None,
            allocation_size: 0,
            ea: None,
            delete_on_close: false,
            posix_delete: false,
            directory: false,
            non_directory: false,
        }
    }
}

/// A main file opened on a stream opener's behalf; closed when the stream
/// open completes either way.
struct MainFileAssist {
    node: Arc<FileNode>,
    backend_fh: u64,
}

impl<B: Backend> Volume<B> {
    /// The CREATE operation.
    pub fn create(
        &self,
        req: &Request,
        name: &str,
        args: &CreateArgs<'_>,
    ) -> FsResult<(FileHandle, FileInfo)> {
        path::validate(
            name,
            self.params.named_streams(),
            self.params.max_component_length() as usize,
        )?;
        if args.directory && args.non_directory {
            return Err(FsError::InvalidParameter);
        }
        if args.directory && args.disposition.overwrites() {
            // directories cannot be overwritten or superseded
            return Err(FsError::InvalidParameter);
        }

        let name = if self.params.reparse_points() {
            match self.call_backend(req, |b| b.resolve_reparse_points(req, name))? {
                Some(resolved) => {
                    path::validate(
                        &resolved,
                        self.params.named_streams(),
                        self.params.max_component_length() as usize,
                    )?;
                    resolved
                }
                None => name.to_string(),
            }
        } else {
            name.to_string()
        };

        self.rename_lock.acquire_shared();
        let result = self.create_locked(req, &name, args);
        self.rename_lock.release();
        result
    }

    /// Security descriptor by name, served from the cache when the node is
    /// live; the cache fills from the back-end on a miss.
    pub fn get_security_by_name(&self, req: &Request, name: &str) -> FsResult<Vec<u8>> {
        if let Some(node) = self.lookup(name) {
            if let Some(cached) = self.reference_security(&node) {
                return Ok(cached.to_vec());
            }
            let security = self.call_backend(req, |b| b.get_security_by_name(req, name))?;
            self.set_security(&node, Some(&security));
            return Ok(security);
        }
        self.call_backend(req, |b| b.get_security_by_name(req, name))
    }

    fn create_locked(
        &self,
        req: &Request,
        name: &str,
        args: &CreateArgs<'_>,
    ) -> FsResult<(FileHandle, FileInfo)> {
        // a stream opener may need its main file opened on its behalf
        let (main_node, assist) = match path::split_stream(name) {
            (main_name, Some(_)) => match self.lookup(main_name) {
                Some(existing) => (Some(existing), None),
                None => {
                    let assist = self.open_main_file_assist(req, main_name)?;
                    (Some(assist.node.clone()), Some(assist))
                }
            },
            _ => (None, None),
        };

        let result = self.create_with_main(req, name, args, main_node);

        if let Some(assist) = assist {
            self.close_main_file_assist(req, assist);
        }

        result
    }

    fn create_with_main(
        &self,
        req: &Request,
        name: &str,
        args: &CreateArgs<'_>,
        main_node: Option<Arc<FileNode>>,
    ) -> FsResult<(FileHandle, FileInfo)> {
        // back-end create/open per disposition
        let (backend_fh, mut info, created) = self.backend_create_open(req, name, args)?;

        if args.directory && !info.attributes.is_directory() {
            self.call_backend(req, |b| b.close(req, backend_fh));
            return Err(FsError::NotADirectory);
        }
        if args.non_directory && info.attributes.is_directory() {
            self.call_backend(req, |b| b.close(req, backend_fh));
            return Err(FsError::IsADirectory);
        }
        if info.attributes.contains(FileAttributes::READONLY)
            && (args.delete_on_close || (!created && args.disposition.overwrites()))
        {
            self.call_backend(req, |b| b.close(req, backend_fh));
            return Err(FsError::AccessDenied);
        }

        let candidate = FileNode::new(name.to_string(), main_node);
        let overwrite_pending = !created && args.disposition.overwrites();
        let additional = if overwrite_pending {
            args.disposition.additional_access()
        } else {
            FileAccess::empty()
        };

        let opened = match self.node_open(&candidate, args.access, additional, args.share) {
            Ok((opened, _inserted)) => opened,
            Err(err) if err.is_sharing_violation() => {
                // a batch-oplock holder may be the only obstacle; break it
                // and retry once
                match self.break_batch_for_sharing_violation(req, name) {
                    Ok(true) => match self.node_open(&candidate, args.access, additional, args.share)
                    {
                        Ok((opened, _)) => opened,
                        Err(err) => {
                            self.call_backend(req, |b| b.close(req, backend_fh));
                            return Err(err);
                        }
                    },
                    _ => {
                        self.call_backend(req, |b| b.close(req, backend_fh));
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                self.call_backend(req, |b| b.close(req, backend_fh));
                return Err(err);
            }
        };

        // an exclusive oplock held against this identity breaks now; the
        // open suspends until the holder acknowledges
        if let Err(err) = opened.main_or_self().oplock.check(req, false) {
            self.abandon_open(req, &opened, backend_fh, args);
            return Err(err);
        }

        // install metadata: the first opener sets everything, later
        // openers only refresh sizes when a truncate intent rides along
        let truncate_on_close = args.allocation_size != 0;
        if opened.open_count() == 1 {
            opened.set_file_info(&self.params, &info, truncate_on_close);
        } else if truncate_on_close {
            opened.set_file_sizes(&self.params, info.allocation_size, info.file_size);
        }

        if overwrite_pending {
            match self.overwrite_opened(req, &opened, backend_fh, args) {
                Ok(new_info) => info = new_info,
                Err(err) => {
                    self.abandon_open(req, &opened, backend_fh, args);
                    return Err(err);
                }
            }
        }

        let mut desc = FileDesc::new(args.access, args.share);
        desc.delete_on_close = args.delete_on_close;
        desc.posix_delete = args.posix_delete;
        let handle = self.register_handle(opened.clone(), backend_fh, desc);

        let name_filter = if info.attributes.is_directory() {
            NotifyFilter::DIR_NAME
        } else {
            NotifyFilter::FILE_NAME
        };
        if created {
            self.notify_change(&opened, name_filter, NotifyAction::Added, true);
        } else if args.disposition.overwrites() {
            self.notify_change(
                &opened,
                NotifyFilter::ATTRIBUTES | NotifyFilter::SIZE | NotifyFilter::LAST_WRITE,
                NotifyAction::Modified,
                true,
            );
        }

        debug!(
            "create: {name:?} disposition {:?} -> {handle} (created: {created})",
            args.disposition
        );
        Ok((handle, info))
    }

    fn backend_create_open(
        &self,
        req: &Request,
        name: &str,
        args: &CreateArgs<'_>,
    ) -> FsResult<(u64, FileInfo, bool)> {
        // a back-end not-a-directory during traversal means a parent
        // component is not a directory
        fn traversal(err: FsError) -> FsError {
            match err {
                FsError::NotADirectory => FsError::PathNotFound,
                other => other,
            }
        }

        let create = |req: &Request, b: &B| {
            b.create(req, name, args)
                .map(|outcome| (outcome.fh, outcome.info, true))
        };
        let open = |req: &Request, b: &B| {
            b.open(req, name, args.access, args.share)
                .map(|outcome| (outcome.fh, outcome.info, false))
        };

        self.call_backend(req, |b| match args.disposition {
            CreateDisposition::Create => create(req, b).map_err(traversal),
            CreateDisposition::Open | CreateDisposition::Overwrite => {
                open(req, b).map_err(traversal)
            }
            CreateDisposition::OpenIf
            | CreateDisposition::OverwriteIf
            | CreateDisposition::Supersede => match open(req, b) {
                Err(FsError::NotFound) => create(req, b).map_err(traversal),
                other => other.map_err(traversal),
            },
        })
    }

    /// Overwrite/supersede processing for an open that found an existing
    /// file: break batch oplocks across the streams, run the back-end
    /// overwrite, then condemn any open streams.
    fn overwrite_opened(
        &self,
        req: &Request,
        node: &Arc<FileNode>,
        backend_fh: u64,
        args: &CreateArgs<'_>,
    ) -> FsResult<FileInfo> {
        node.acquire_exclusive(Acquire::FULL, req);

        if self.params.named_streams() && !node.is_stream() {
            // releases the node resources before waiting
            self.check_batch_oplocks_on_all_streams(req, node, Acquire::FULL, None)
                .map_err(|_| FsError::sharing_violation())?;
            node.acquire_exclusive(Acquire::FULL, req);
        }

        let replace_attributes = args.disposition == CreateDisposition::Supersede;
        let result = self.call_backend(req, |b| {
            b.overwrite(
                req,
                backend_fh,
                args.attributes,
                replace_attributes,
                args.allocation_size,
                args.ea,
            )
        });

        match result {
            Ok(info) => {
                if self.params.named_streams() && !node.is_stream() {
                    self.overwrite_streams(node);
                }
                node.set_file_info(&self.params, &info, args.allocation_size != 0);
                node.release(Acquire::FULL, req);
                Ok(info)
            }
            Err(err) => {
                node.release(Acquire::FULL, req);
                Err(err)
            }
        }
    }

    /// Unwind a failed open after `node_open` succeeded.
    fn abandon_open(
        &self,
        req: &Request,
        node: &Arc<FileNode>,
        backend_fh: u64,
        args: &CreateArgs<'_>,
    ) {
        let desc = FileDesc::new(args.access, args.share);
        self.call_backend(req, |b| b.close(req, backend_fh));
        self.node_close(node, Some(&desc), true);
    }

    /// If the name's occupant holds a batch oplock, wait the break out.
    /// Returns whether a retry is worthwhile.
    fn break_batch_for_sharing_violation(&self, req: &Request, name: &str) -> FsResult<bool> {
        let Some(occupant) = self.lookup(name) else {
            return Ok(false);
        };
        if !occupant.oplock.is_batch() {
            return Ok(false);
        }
        occupant.oplock.check(req, false)?;
        Ok(true)
    }

    fn open_main_file_assist(&self, req: &Request, main_name: &str) -> FsResult<MainFileAssist> {
        let outcome = self.call_backend(req, |b| {
            b.open(
                req,
                main_name,
                FileAccess::READ_ATTRIBUTES,
                ShareMode::all(),
            )
        })?;

        let candidate = FileNode::new(main_name.to_string(), None);
        match self.node_open(
            &candidate,
            FileAccess::READ_ATTRIBUTES,
            FileAccess::empty(),
            ShareMode::all(),
        ) {
            Ok((node, _)) => {
                if node.open_count() == 1 {
                    node.set_file_info(&self.params, &outcome.info, false);
                }
                Ok(MainFileAssist {
                    node,
                    backend_fh: outcome.fh,
                })
            }
            Err(err) => {
                self.call_backend(req, |b| b.close(req, outcome.fh));
                Err(err)
            }
        }
    }

    fn close_main_file_assist(&self, req: &Request, assist: MainFileAssist) {
        let desc = FileDesc::new(FileAccess::READ_ATTRIBUTES, ShareMode::all());
        self.call_backend(req, |b| b.close(req, assist.backend_fh));
        self.node_close(&assist.node, Some(&desc), true);
    }
}
