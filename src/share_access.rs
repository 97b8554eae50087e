//! Share-access accounting.
//!
//! The per-node [`ShareAccess`] state reconciles each opener's granted
//! access against the share modes declared by every prior opener, following
//! the standard Windows `IoSetShareAccess`/`IoCheckShareAccess`/
//! `IoRemoveShareAccess` rules. The cross-stream extensions (main-file and
//! stream deny-delete counters) live on the file node and are applied by the
//! open/cleanup/close paths; this module is the pure counter arithmetic.

use crate::FileAccess;
use crate::FsError;
use crate::FsResult;
use crate::ShareMode;

/// Share-access counters for one node.
///
/// `open_count` counts openers that requested any read/write/delete class
/// access; attribute-only opens never touch these counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShareAccess {
    /// Openers participating in share accounting.
    pub open_count: u32,
    /// Openers that read data.
    pub readers: u32,
    /// Openers that write data.
    pub writers: u32,
    /// Openers that may delete.
    pub deleters: u32,
    /// Openers that shared read.
    pub shared_read: u32,
    /// Openers that shared write.
    pub shared_write: u32,
    /// Openers that shared delete.
    pub shared_delete: u32,
}

impl ShareAccess {
    /// Install the first opener's contribution, overwriting whatever was
    /// there. Used when a node is freshly inserted into the name table.
    pub fn set(&mut self, access: FileAccess, share: ShareMode) {
        *self = ShareAccess::default();
        if access.shares_object() {
            self.open_count = 1;
            self.readers = u32::from(access.wants_read());
            self.writers = u32::from(access.wants_write());
            self.deleters = u32::from(access.wants_delete());
            self.shared_read = u32::from(share.contains(ShareMode::READ));
            self.shared_write = u32::from(share.contains(ShareMode::WRITE));
            self.shared_delete = u32::from(share.contains(ShareMode::DELETE));
        }
    }

    /// Check a prospective opener against the current state without
    /// recording it.
    pub fn check(&self, access: FileAccess, share: ShareMode) -> FsResult<()> {
        if !access.shares_object() {
            return Ok(());
        }

        let wants_read = access.wants_read();
        let wants_write = access.wants_write();
        let wants_delete = access.wants_delete();
        let shares_read = share.contains(ShareMode::READ);
        let shares_write = share.contains(ShareMode::WRITE);
        let shares_delete = share.contains(ShareMode::DELETE);

        // each prior opener must have shared what we want, and we must
        // share what each prior opener wants
        if (wants_read && self.shared_read < self.open_count)
            || (wants_write && self.shared_write < self.open_count)
            || (wants_delete && self.shared_delete < self.open_count)
            || (self.readers != 0 && !shares_read)
            || (self.writers != 0 && !shares_write)
            || (self.deleters != 0 && !shares_delete)
        {
            return Err(FsError::sharing_violation());
        }

        Ok(())
    }

    /// Check and, on success, record the opener's contribution.
    pub fn check_update(&mut self, access: FileAccess, share: ShareMode) -> FsResult<()> {
        self.check(access, share)?;
        if access.shares_object() {
            self.open_count += 1;
            self.readers += u32::from(access.wants_read());
            self.writers += u32::from(access.wants_write());
            self.deleters += u32::from(access.wants_delete());
            self.shared_read += u32::from(share.contains(ShareMode::READ));
            self.shared_write += u32::from(share.contains(ShareMode::WRITE));
            self.shared_delete += u32::from(share.contains(ShareMode::DELETE));
        }
        Ok(())
    }

    /// Remove the contribution recorded for an opener with this access and
    /// share mode.
    pub fn remove(&mut self, access: FileAccess, share: ShareMode) {
        if access.shares_object() {
            self.open_count -= 1;
            self.readers -= u32::from(access.wants_read());
            self.writers -= u32::from(access.wants_write());
            self.deleters -= u32::from(access.wants_delete());
            self.shared_read -= u32::from(share.contains(ShareMode::READ));
            self.shared_write -= u32::from(share.contains(ShareMode::WRITE));
            self.shared_delete -= u32::from(share.contains(ShareMode::DELETE));
        }
    }

    /// Do *all* current openers share delete? The POSIX-rename descendant
    /// check keys off this.
    #[must_use]
    pub fn all_share_delete(&self) -> bool {
        self.open_count == self.shared_delete
    }
}
