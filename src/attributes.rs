//! File attribute flags.

use bitflags::bitflags;

bitflags! {
    /// Basic file attributes, in the classic NT layout.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct FileAttributes: u32 {
        /// Writes and delete are refused by policy.
        const READONLY = 0x0000_0001;
        /// Hidden from normal listings.
        const HIDDEN = 0x0000_0002;
        /// Operating system file.
        const SYSTEM = 0x0000_0004;
        /// The node is a directory.
        const DIRECTORY = 0x0000_0010;
        /// Marked for archival.
        const ARCHIVE = 0x0000_0020;
        /// No other attributes set.
        const NORMAL = 0x0000_0080;
        /// Delete-on-last-close hint for temporary files.
        const TEMPORARY = 0x0000_0100;
        /// Sparse allocation.
        const SPARSE_FILE = 0x0000_0200;
        /// A reparse point is attached.
        const REPARSE_POINT = 0x0000_0400;
        /// Compressed storage.
        const COMPRESSED = 0x0000_0800;
        /// Content is not immediately available.
        const OFFLINE = 0x0000_1000;
        /// Excluded from content indexing.
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        /// Encrypted storage.
        const ENCRYPTED = 0x0000_4000;
    }
}

impl FileAttributes {
    /// Attributes a named stream never reports for itself: a stream of a
    /// directory is not itself a directory.
    pub const STREAM_MASK: FileAttributes = FileAttributes::DIRECTORY.complement();

    /// Is the directory bit set?
    #[must_use]
    pub fn is_directory(self) -> bool {
        self.contains(FileAttributes::DIRECTORY)
    }
}
