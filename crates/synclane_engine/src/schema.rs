//! Local schema: which indexes exist per table on the client side.

use std::collections::BTreeMap;

use synclane_protocol::{with_implicit_indexes, IndexDefinition};

/// Tables and their index definitions as the client sees them.
///
/// Overlay documents have no server-computed keys, so the engine keys them
/// with these definitions when merging them into index scans.
#[derive(Debug, Clone, Default)]
pub struct LocalSchema {
    tables: BTreeMap<String, Vec<IndexDefinition>>,
}

impl LocalSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table with the implicit indexes plus `indexes`.
    pub fn with_table(mut self, name: impl Into<String>, indexes: Vec<IndexDefinition>) -> Self {
        self.tables.insert(name.into(), with_implicit_indexes(indexes));
        self
    }

    /// Returns true if the table is declared.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Looks up an index definition.
    pub fn index(&self, table: &str, index: &str) -> Option<&IndexDefinition> {
        self.tables.get(table)?.iter().find(|i| i.name == index)
    }

    /// Declared table names.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}
