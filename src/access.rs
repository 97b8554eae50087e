//! Granted-access and share-mode flag words.

use bitflags::bitflags;

bitflags! {
    /// Access rights granted to an open, in the classic NT layout.
    ///
    /// Directory rights alias the file rights of the same bit
    /// (`LIST_DIRECTORY` == `READ_DATA` and so on); the engine only ever
    /// interprets the file meanings.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct FileAccess: u32 {
        /// Read file data / list directory.
        const READ_DATA = 0x0000_0001;
        /// Write file data / add file to directory.
        const WRITE_DATA = 0x0000_0002;
        /// Append to file / add subdirectory.
        const APPEND_DATA = 0x0000_0004;
        /// Read extended attributes.
        const READ_EA = 0x0000_0008;
        /// Write extended attributes.
        const WRITE_EA = 0x0000_0010;
        /// Execute file data / traverse directory.
        const EXECUTE = 0x0000_0020;
        /// Delete a child of a directory.
        const DELETE_CHILD = 0x0000_0040;
        /// Read basic attributes.
        const READ_ATTRIBUTES = 0x0000_0080;
        /// Write basic attributes.
        const WRITE_ATTRIBUTES = 0x0000_0100;
        /// Delete the object itself.
        const DELETE = 0x0001_0000;
        /// Read the security descriptor.
        const READ_CONTROL = 0x0002_0000;
        /// Write the discretionary ACL.
        const WRITE_DAC = 0x0004_0000;
        /// Take ownership.
        const WRITE_OWNER = 0x0008_0000;
        /// Wait on the handle.
        const SYNCHRONIZE = 0x0010_0000;
    }
}

bitflags! {
    /// Share mode declared by an open.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ShareMode: u32 {
        /// Other openers may read.
        const READ = 0x1;
        /// Other openers may write.
        const WRITE = 0x2;
        /// Other openers may delete (or rename over) the file.
        const DELETE = 0x4;
    }
}

impl FileAccess {
    /// The access bits that count as "reading" for share reconciliation.
    pub const READ_CLASS: FileAccess = FileAccess::READ_DATA.union(FileAccess::EXECUTE);
    /// The access bits that count as "writing" for share reconciliation.
    pub const WRITE_CLASS: FileAccess = FileAccess::WRITE_DATA.union(FileAccess::APPEND_DATA);
    /// The access bits that touch file data or identity; used by the
    /// cross-stream and writable-section sharing checks.
    pub const DATA_CLASS: FileAccess = FileAccess::EXECUTE
        .union(FileAccess::READ_DATA)
        .union(FileAccess::WRITE_DATA)
        .union(FileAccess::APPEND_DATA)
        .union(FileAccess::DELETE);

    /// Does this access read file data?
    #[must_use]
    pub fn wants_read(self) -> bool {
        self.intersects(Self::READ_CLASS)
    }

    /// Does this access write file data?
    #[must_use]
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE_CLASS)
    }

    /// Does this access allow deleting the object?
    #[must_use]
    pub fn wants_delete(self) -> bool {
        self.contains(FileAccess::DELETE)
    }

    /// Does this access participate in share accounting at all?
    /// Attribute-only opens do not.
    #[must_use]
    pub fn shares_object(self) -> bool {
        self.wants_read() || self.wants_write() || self.wants_delete()
    }
}
