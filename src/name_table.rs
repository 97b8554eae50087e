//! The per-volume name table.
//!
//! An ordered map from canonical name to file node. The table owns one
//! strong reference to every inserted node; lookup and enumeration hand out
//! additional clones. Case policy is fixed at construction: when
//! insensitive, keys are case-folded copies while the nodes keep their
//! original-case names.
//!
//! A single lock (the `Mutex` the volume wraps this in) guards all mutation
//! and enumeration, along with the per-volume active list and every node
//! counter; the engine calls this the context-table lock. Prefix
//! enumeration is restartable: it hands back one node at a time together
//! with an opaque [`RestartKey`] so callers may drop the lock between
//! steps.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::FileNode;
use crate::path;

/// Opaque continuation token for prefix enumeration.
#[derive(Clone, Debug, Default)]
pub struct RestartKey(Option<String>);

/// Ordered name-to-node mapping plus the active list.
#[derive(Debug)]
pub struct NameTable {
    case_sensitive: bool,
    map: BTreeMap<String, Arc<FileNode>>,
    active: Vec<Arc<FileNode>>,
}

impl NameTable {
    /// Create an empty table with the given case policy.
    #[must_use]
    pub fn new(case_sensitive: bool) -> Self {
        NameTable {
            case_sensitive,
            map: BTreeMap::new(),
            active: Vec::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        path::fold(name, self.case_sensitive).into_owned()
    }

    /// Look up a node by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.map.get(self.key(name).as_str()).cloned()
    }

    /// Insert `node` under its current name unless the name is already
    /// taken. Returns the occupant (the inserted node or the prior one)
    /// and whether an insert happened.
    pub fn insert_if_absent(&mut self, node: &Arc<FileNode>) -> (Arc<FileNode>, bool) {
        let key = node.with_name(|name| self.key(name));
        match self.map.entry(key) {
            std::collections::btree_map::Entry::Occupied(occupied) => {
                (occupied.get().clone(), false)
            }
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(node.clone());
                (node.clone(), true)
            }
        }
    }

    /// Remove the entry for `name`, returning the node so the caller can
    /// drop the table's reference.
    pub fn remove(&mut self, name: &str) -> Option<Arc<FileNode>> {
        self.map.remove(self.key(name).as_str())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no names are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Yield the next node at or after `prefix` whose name begins with
    /// `prefix` (the node named exactly `prefix` included), advancing
    /// `restart`. Callers filter for directory ancestry or stream
    /// membership themselves.
    pub fn enumerate_prefix(
        &self,
        prefix: &str,
        restart: &mut RestartKey,
    ) -> Option<Arc<FileNode>> {
        let prefix = self.key(prefix);
        let lower = match restart.0.take() {
            Some(last) => Bound::Excluded(last),
            None => Bound::Included(prefix.clone()),
        };
        let (key, node) = self
            .map
            .range::<String, _>((lower, Bound::Unbounded))
            .next()
            .filter(|(key, _)| key.starts_with(prefix.as_str()))?;
        restart.0 = Some(key.clone());
        Some(node.clone())
    }

    /// Snapshot every node currently in the table.
    #[must_use]
    pub fn open_nodes(&self) -> Vec<Arc<FileNode>> {
        self.map.values().cloned().collect()
    }

    // ----- active list -----

    /// Link a node whose active count just went 0 to 1.
    pub fn active_insert(&mut self, node: &Arc<FileNode>) {
        self.active.push(node.clone());
    }

    /// Unlink a node whose active count just reached 0.
    pub fn active_remove(&mut self, node: &Arc<FileNode>) {
        if let Some(index) = self.active.iter().position(|n| Arc::ptr_eq(n, node)) {
            self.active.swap_remove(index);
        }
    }

    /// Snapshot the active list.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<Arc<FileNode>> {
        self.active.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Arc<FileNode> {
        FileNode::new(name.into(), None)
    }

    fn names(table: &NameTable, prefix: &str) -> Vec<String> {
        let mut restart = RestartKey::default();
        let mut out = Vec::new();
        while let Some(n) = table.enumerate_prefix(prefix, &mut restart) {
            out.push(n.name());
        }
        out
    }

    #[test]
    fn insert_lookup_remove() {
        let mut table = NameTable::new(true);
        let a = node("\\a");
        let (occupant, inserted) = table.insert_if_absent(&a);
        assert!(inserted);
        assert!(Arc::ptr_eq(&occupant, &a));

        let duplicate = node("\\a");
        let (occupant, inserted) = table.insert_if_absent(&duplicate);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&occupant, &a));

        assert!(table.lookup("\\a").is_some());
        assert!(table.lookup("\\A").is_none());
        assert!(table.remove("\\a").is_some());
        assert!(table.remove("\\a").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn case_insensitive_lookup_preserves_stored_case() {
        let mut table = NameTable::new(false);
        let a = node("\\Alpha");
        table.insert_if_absent(&a);
        let found = table.lookup("\\ALPHA").unwrap();
        assert_eq!(found.name(), "\\Alpha");

        let clash = node("\\alpha");
        let (_, inserted) = table.insert_if_absent(&clash);
        assert!(!inserted);
    }

    #[test]
    fn prefix_enumeration_is_ordered_and_restartable() {
        let mut table = NameTable::new(true);
        for name in ["\\a", "\\a:s1", "\\a\\b", "\\a\\b\\c", "\\ab", "\\b"] {
            table.insert_if_absent(&node(name));
        }
        assert_eq!(names(&table, "\\a"), vec!["\\a", "\\a:s1", "\\a\\b", "\\a\\b\\c", "\\ab"]);
        assert_eq!(names(&table, "\\a\\"), vec!["\\a\\b", "\\a\\b\\c"]);
        assert_eq!(names(&table, "\\c"), Vec::<String>::new());

        // stepwise restart sees inserts past the cursor
        let mut restart = RestartKey::default();
        let first = table.enumerate_prefix("\\a", &mut restart).unwrap();
        assert_eq!(first.name(), "\\a");
        table.insert_if_absent(&node("\\a\\z"));
        let mut rest = Vec::new();
        while let Some(n) = table.enumerate_prefix("\\a", &mut restart) {
            rest.push(n.name());
        }
        assert!(rest.contains(&"\\a\\z".to_string()));
    }

    #[test]
    fn streams_sort_before_path_children() {
        let mut table = NameTable::new(true);
        table.insert_if_absent(&node("\\a\\b"));
        table.insert_if_absent(&node("\\a:s"));
        table.insert_if_absent(&node("\\a"));
        assert_eq!(names(&table, "\\a"), vec!["\\a", "\\a:s", "\\a\\b"]);
    }

    #[test]
    fn active_list() {
        let mut table = NameTable::new(true);
        let a = node("\\a");
        let b = node("\\b");
        table.active_insert(&a);
        table.active_insert(&b);
        assert_eq!(table.active_nodes().len(), 2);
        table.active_remove(&a);
        let active = table.active_nodes();
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &b));
    }
}
