//! Per-handle state.
//!
//! A [`FileDesc`] lives for the lifetime of one transport file handle: the
//! access/share pair recorded into the node's share accounting (needed again
//! to undo it at cleanup/close), the delete intents, and the directory
//! enumeration cursor.

use crate::FileAccess;
use crate::FsError;
use crate::FsResult;
use crate::ShareMode;

/// State the engine keeps per open handle.
#[derive(Clone, Debug, Default)]
pub struct FileDesc {
    /// Access granted to this open.
    pub granted: FileAccess,
    /// Share mode declared by this open.
    pub share: ShareMode,
    /// Delete when the last handle goes away.
    pub delete_on_close: bool,
    /// Unlink at cleanup regardless of other handles (POSIX semantics).
    pub posix_delete: bool,
    dir_pattern: Option<String>,
    dir_marker: Option<String>,
}

impl FileDesc {
    /// Create a descriptor for an open with this access/share pair.
    #[must_use]
    pub fn new(granted: FileAccess, share: ShareMode) -> Self {
        FileDesc {
            granted,
            share,
            ..FileDesc::default()
        }
    }

    /// Begin or restart a directory scan. The first scan fixes the search
    /// pattern for the handle's lifetime (later patterns are ignored, as
    /// the kernel interface does); a restart clears the cursor.
    pub fn reset_directory(&mut self, pattern: Option<&str>, restart: bool) {
        if self.dir_pattern.is_none() {
            self.dir_pattern = Some(pattern.unwrap_or("*").to_string());
        }
        if restart {
            self.dir_marker = None;
        }
    }

    /// Record the resume marker after a batch of entries went out.
    pub fn set_directory_marker(&mut self, marker: &str) -> FsResult<()> {
        if marker.is_empty() {
            return Err(FsError::InvalidParameter);
        }
        self.dir_marker = Some(marker.to_string());
        Ok(())
    }

    /// The fixed search pattern, if a scan has begun.
    #[must_use]
    pub fn dir_pattern(&self) -> Option<&str> {
        self.dir_pattern.as_deref()
    }

    /// The resume marker, if any entries have been delivered.
    #[must_use]
    pub fn dir_marker(&self) -> Option<&str> {
        self.dir_marker.as_deref()
    }
}

/// Match `name` against a search pattern with `*` and `?` wildcards.
#[must_use]
pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[char], name: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some('?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) => {
                p.eq_ignore_ascii_case(n) && matches(&pattern[1..], &name[1..])
            }
            _ => false,
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches(&pattern, &name)
}
