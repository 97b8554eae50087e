//! Descendant gathering.
//!
//! Rename, overwrite, oplock fan-out and the cleanup stream sweep all need
//! "every node below this name" snapshots. The gather runs under the
//! context-table lock, taking a strong reference per hit into an inline
//! array that spills to the heap past 16 entries; per-hit facts observed
//! under the lock (has handles, which break is in flight) ride along as
//! explicit flags next to each reference rather than being packed into
//! pointer bits. After the lock is dropped the caller works the snapshot
//! and the references unwind on drop.

use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::FileNode;
use crate::name_table::NameTable;
use crate::name_table::RestartKey;

bitflags! {
    /// Facts recorded per gathered node while the table lock was held.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub(crate) struct DescendantFlags: u8 {
        /// The node had open handles at gather time.
        const HAS_HANDLES = 1;
        /// A batch-oplock break was initiated and must be awaited.
        const BATCH_BREAK = 2;
        /// A handle-oplock break was initiated and must be awaited.
        const HANDLE_BREAK = 4;
    }
}

/// What the gather filter decides per enumerated node.
pub(crate) enum Visit {
    /// Take a reference, with these flags.
    Keep(DescendantFlags),
    /// Pass over this node.
    Skip,
    /// Stop enumerating entirely (the remaining names cannot match).
    Stop,
}

/// A snapshot of descendants taken under the table lock.
#[derive(Debug, Default)]
pub(crate) struct Gathered {
    entries: SmallVec<[(Arc<FileNode>, DescendantFlags); 16]>,
}

impl Gathered {
    /// Enumerate every node whose name starts with `prefix` (itself
    /// included) and keep what `filter` says. The caller holds the table
    /// lock.
    pub(crate) fn gather(
        table: &NameTable,
        prefix: &str,
        mut filter: impl FnMut(&Arc<FileNode>) -> Visit,
    ) -> Gathered {
        let mut entries = SmallVec::new();
        let mut restart = RestartKey::default();
        while let Some(node) = table.enumerate_prefix(prefix, &mut restart) {
            match filter(&node) {
                Visit::Keep(flags) => entries.push((node, flags)),
                Visit::Skip => {}
                Visit::Stop => break,
            }
        }
        Gathered { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &(Arc<FileNode>, DescendantFlags)> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl DoubleEndedIterator<Item = &mut (Arc<FileNode>, DescendantFlags)> {
        self.entries.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;

    fn table_with(names: &[&str]) -> NameTable {
        let mut table = NameTable::new(true);
        for name in names {
            table.insert_if_absent(&FileNode::new((*name).into(), None));
        }
        table
    }

    #[test]
    fn gather_filters_and_flags() {
        let table = table_with(&["\\a", "\\a:s", "\\a\\b", "\\a\\b\\c", "\\ab"]);
        let gathered = Gathered::gather(&table, "\\a", |node| {
            node.with_name(|name| {
                if name == "\\a" || path::is_path_descendant("\\a", name) {
                    Visit::Keep(DescendantFlags::HAS_HANDLES)
                } else if path::is_stream_descendant("\\a", name) {
                    Visit::Keep(DescendantFlags::empty())
                } else {
                    Visit::Skip
                }
            })
        });
        let names: Vec<_> = gathered.iter().map(|(n, _)| n.name()).collect();
        assert_eq!(names, vec!["\\a", "\\a:s", "\\a\\b", "\\a\\b\\c"]);
        assert_eq!(gathered.iter().next().unwrap().1, DescendantFlags::HAS_HANDLES);
        assert_eq!(gathered.iter().nth(1).unwrap().1, DescendantFlags::empty());
    }

    #[test]
    fn stop_short_circuits() {
        // streams sort before path children, so the stream sweep stops at
        // the first '\' descendant
        let table = table_with(&["\\a", "\\a:s1", "\\a:s2", "\\a\\b"]);
        let gathered = Gathered::gather(&table, "\\a", |node| {
            node.with_name(|name| {
                if path::is_path_descendant("\\a", name) {
                    Visit::Stop
                } else if path::is_stream_descendant("\\a", name) {
                    Visit::Keep(DescendantFlags::empty())
                } else {
                    Visit::Skip
                }
            })
        });
        let names: Vec<_> = gathered.iter().map(|(n, _)| n.name()).collect();
        assert_eq!(names, vec!["\\a:s1", "\\a:s2"]);
    }

    #[test]
    fn spills_past_the_inline_capacity() {
        let names: Vec<String> = (0..40).map(|i| format!("\\d\\f{i:02}")).collect();
        let mut table = NameTable::new(true);
        table.insert_if_absent(&FileNode::new("\\d".into(), None));
        for name in &names {
            table.insert_if_absent(&FileNode::new(name.clone(), None));
        }
        let gathered = Gathered::gather(&table, "\\d", |_| Visit::Keep(DescendantFlags::empty()));
        assert_eq!(gathered.len(), 41);
    }
}
