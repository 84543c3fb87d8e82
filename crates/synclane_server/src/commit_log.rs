//! Log of committed versions and the tables each one wrote.

use std::collections::BTreeSet;

use synclane_protocol::Version;

/// One committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    /// Version the commit produced.
    pub version: Version,
    /// Tables written by the commit.
    pub tables: BTreeSet<String>,
}

/// Commit history in version order.
///
/// The log answers "which tables changed after version `v`", so a
/// transition only recomputes the page queries that can have changed.
#[derive(Debug, Clone)]
pub struct CommitLog {
    entries: Vec<CommitEntry>,
    current: Version,
}

impl CommitLog {
    /// Creates a log whose current version is `initial`.
    pub fn new(initial: Version) -> Self {
        Self {
            entries: Vec::new(),
            current: initial,
        }
    }

    /// The latest committed version.
    pub fn current(&self) -> Version {
        self.current
    }

    /// Records a commit and returns its version.
    pub fn append(&mut self, tables: BTreeSet<String>) -> Version {
        self.current = self.current.next();
        self.entries.push(CommitEntry {
            version: self.current,
            tables,
        });
        self.current
    }

    /// Tables written by commits after `since`.
    pub fn tables_changed_since(&self, since: Version) -> BTreeSet<String> {
        let start = self.entries.partition_point(|e| e.version <= since);
        self.entries[start..]
            .iter()
            .flat_map(|e| e.tables.iter().cloned())
            .collect()
    }

    /// Drops entries at or below `version`.
    pub fn truncate_through(&mut self, version: Version) {
        let keep_from = self.entries.partition_point(|e| e.version <= version);
        self.entries.drain(..keep_from);
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn append_advances_version() {
        let mut log = CommitLog::new(Version(1));
        assert_eq!(log.append(tables(&["a"])), Version(2));
        assert_eq!(log.append(tables(&["b"])), Version(3));
        assert_eq!(log.current(), Version(3));
    }

    #[test]
    fn changed_tables_since() {
        let mut log = CommitLog::new(Version(1));
        log.append(tables(&["a"]));
        log.append(tables(&["b", "c"]));
        log.append(tables(&["a"]));

        assert_eq!(log.tables_changed_since(Version(1)), tables(&["a", "b", "c"]));
        assert_eq!(log.tables_changed_since(Version(3)), tables(&["a"]));
        assert!(log.tables_changed_since(Version(4)).is_empty());
    }

    #[test]
    fn truncate() {
        let mut log = CommitLog::new(Version(1));
        log.append(tables(&["a"]));
        log.append(tables(&["b"]));
        log.truncate_through(Version(2));
        assert_eq!(log.len(), 1);
        assert_eq!(log.current(), Version(3));
    }
}
