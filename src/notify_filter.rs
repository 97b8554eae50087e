//! Change-notification filters and action codes.

use bitflags::bitflags;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

bitflags! {
    /// What kinds of change a directory watcher wants to hear about.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct NotifyFilter: u32 {
        /// A file name changed (create, delete, rename).
        const FILE_NAME = 0x0001;
        /// A directory name changed.
        const DIR_NAME = 0x0002;
        /// Attributes changed.
        const ATTRIBUTES = 0x0004;
        /// File size changed.
        const SIZE = 0x0008;
        /// Last-write time changed.
        const LAST_WRITE = 0x0010;
        /// Last-access time changed.
        const LAST_ACCESS = 0x0020;
        /// Creation time changed.
        const CREATION = 0x0040;
        /// Extended attributes changed.
        const EA = 0x0080;
        /// Security descriptor changed.
        const SECURITY = 0x0100;
        /// A stream name changed.
        const STREAM_NAME = 0x0200;
        /// A stream size changed.
        const STREAM_SIZE = 0x0400;
        /// A stream was written.
        const STREAM_WRITE = 0x0800;
    }
}

/// What happened to the reported name.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum NotifyAction {
    /// A file was added.
    Added = 1,
    /// A file was removed.
    Removed = 2,
    /// A file was modified.
    Modified = 3,
    /// A rename removed this name.
    RenamedOldName = 4,
    /// A rename introduced this name.
    RenamedNewName = 5,
    /// A stream was added.
    AddedStream = 6,
    /// A stream was removed.
    RemovedStream = 7,
    /// A stream was modified.
    ModifiedStream = 8,
}

/// Rewrite a (filter, action) pair reported against a named stream into the
/// stream-flavored codes a watcher actually sees. File-level bits that have
/// no stream counterpart are dropped; a fully-dropped filter means nothing
/// gets reported.
#[must_use]
pub fn translate_for_stream(
    mut filter: NotifyFilter,
    action: NotifyAction,
) -> (NotifyFilter, NotifyAction) {
    if filter.intersects(NotifyFilter::DIR_NAME | NotifyFilter::FILE_NAME) {
        filter |= NotifyFilter::STREAM_NAME;
    }
    if filter.contains(NotifyFilter::SIZE) {
        filter |= NotifyFilter::STREAM_SIZE;
    }
    if filter.contains(NotifyFilter::LAST_WRITE) {
        filter |= NotifyFilter::STREAM_WRITE;
    }
    filter &=
        NotifyFilter::STREAM_NAME | NotifyFilter::STREAM_SIZE | NotifyFilter::STREAM_WRITE;

    let action = match action {
        NotifyAction::Added => NotifyAction::AddedStream,
        NotifyAction::Removed => NotifyAction::RemovedStream,
        NotifyAction::Modified => NotifyAction::ModifiedStream,
        other => other,
    };

    (filter, action)
}
