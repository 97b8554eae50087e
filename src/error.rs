//! Engine status codes.
//!
//! The engine reports failures with symbolic status values rather than
//! platform error numbers; the transport layer owns the mapping to whatever
//! its wire format wants.

use thiserror::Error;

/// Why an open failed with [`FsError::SharingViolation`].
///
/// Cross-stream opens can fail the sharing check because of state on a
/// *different* node than the one being opened; the reason tag tells the
/// caller which node was responsible.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SharingViolationReason {
    /// The ordinary share-mode reconciliation failed on the target itself.
    #[default]
    General,
    /// A stream open was denied because the main file is held with
    /// delete access and the opener did not share delete.
    MainFile,
    /// A main-file open was denied delete access because an open stream
    /// does not share delete.
    Stream,
}

/// Status codes surfaced by the engine.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FsError {
    /// The final path component does not exist.
    #[error("object not found")]
    NotFound,
    /// An intermediate path component does not exist or is not traversable.
    #[error("path not found")]
    PathNotFound,
    /// A directory operation was attempted on a non-directory.
    #[error("not a directory")]
    NotADirectory,
    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsADirectory,
    /// The name already exists (object name collision).
    #[error("object name collision")]
    Exists,
    /// The target (or its main file) is marked for deletion.
    #[error("delete pending")]
    DeletePending,
    /// Granted access conflicts with the share mode of prior openers.
    #[error("sharing violation ({0:?})")]
    SharingViolation(SharingViolationReason),
    /// The operation is not permitted in the current state.
    #[error("access denied")]
    AccessDenied,
    /// The caller lacks a required privilege.
    #[error("privilege not held")]
    PrivilegeNotHeld,
    /// The name is not a valid canonical name for this volume.
    #[error("invalid name")]
    InvalidName,
    /// A request parameter is malformed or inconsistent.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The output buffer cannot hold even a partial result.
    #[error("buffer too small")]
    BufferTooSmall,
    /// The output buffer holds a truncated result.
    #[error("buffer overflow")]
    BufferOverflow,
    /// The reparse payload fails validation.
    #[error("reparse data invalid")]
    ReparseDataInvalid,
    /// The reparse tag does not match the stored reparse point.
    #[error("reparse tag invalid")]
    ReparseTagInvalid,
    /// The file has no reparse point attached.
    #[error("not a reparse point")]
    NotAReparsePoint,
    /// Read past end of file.
    #[error("end of file")]
    EndOfFile,
    /// Enumeration is exhausted.
    #[error("no more entries")]
    NoMoreEntries,
    /// The directory still has children.
    #[error("directory not empty")]
    DirNotEmpty,
    /// An oplock request cannot be granted at the requested level.
    #[error("oplock not granted")]
    OplockNotGranted,
    /// An oplock break has been initiated and has not completed.
    #[error("oplock break in progress")]
    OplockBreakInProgress,
    /// The byte range to unlock is not held by the caller.
    #[error("range not locked")]
    RangeNotLocked,
    /// The transfer collides with a byte-range lock.
    #[error("lock conflict")]
    LockConflict,
    /// The operation would block and the caller asked not to wait.
    #[error("operation would block")]
    CantWait,
    /// The request was canceled at a suspension point.
    #[error("operation canceled")]
    Canceled,
    /// Resource allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// Engine state is inconsistent; the volume should be torn down.
    #[error("internal corruption")]
    InternalCorrupt,
    /// The back-end does not implement this capability.
    #[error("not supported")]
    Unsupported,
}

impl FsError {
    /// Shorthand for the general sharing-violation value.
    #[must_use]
    pub fn sharing_violation() -> Self {
        FsError::SharingViolation(SharingViolationReason::General)
    }

    /// True for any [`FsError::SharingViolation`], regardless of reason.
    #[must_use]
    pub fn is_sharing_violation(&self) -> bool {
        matches!(self, FsError::SharingViolation(_))
    }

    /// True for statuses that are recoverable control flow rather than
    /// failures: the caller is expected to retry or wait.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::CantWait | FsError::OplockBreakInProgress)
    }
}

/// Result alias used throughout the engine.
pub type FsResult<T> = Result<T, FsError>;
