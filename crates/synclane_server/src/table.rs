//! In-memory reference table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use synclane_protocol::{
    with_implicit_indexes, Bound, Direction, Document, DocumentId, IndexDefinition, IndexKey,
    KeyRange,
};

use crate::error::{ServerError, ServerResult};
use crate::resolver::{Identity, IndexBatch, IndexCursor, TableResolver};

/// Decision of an access policy for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The caller may read the document.
    Allow,
    /// The document is silently left out of results.
    Hide,
    /// Reading the document is an authorization error.
    Deny,
}

/// Per-document authorization hook, evaluated on every read.
pub type AccessPolicy = Arc<dyn Fn(&Document, &Identity) -> Access + Send + Sync>;

/// One index of a [`MemoryTable`].
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    definition: IndexDefinition,
    entries: BTreeMap<IndexKey, DocumentId>,
}

impl MemoryIndex {
    fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: BTreeMap::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IndexCursor for MemoryIndex {
    fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    fn next_batch(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> ServerResult<IndexBatch> {
        let in_range = |key: &IndexKey| range.contains(key);
        let mut items: Vec<(IndexKey, DocumentId)> = match direction {
            Direction::Asc => self
                .entries
                .iter()
                .skip_while(|(k, _)| !range.lower.admits(k))
                .take_while(|(k, _)| in_range(k))
                .take(limit + 1)
                .map(|(k, id)| (k.clone(), id.clone()))
                .collect(),
            Direction::Desc => self
                .entries
                .iter()
                .rev()
                .skip_while(|(k, _)| !in_range(k) && range.lower.admits(k))
                .take_while(|(k, _)| in_range(k))
                .take(limit + 1)
                .map(|(k, id)| (k.clone(), id.clone()))
                .collect(),
        };

        let next_bound = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|(key, _)| match direction {
                Direction::Asc => Bound::Successor(key.clone()),
                Direction::Desc => Bound::Exact(key.clone()),
            })
        } else {
            None
        };
        Ok(IndexBatch { items, next_bound })
    }
}

/// A BTreeMap-backed table implementing [`TableResolver`].
#[derive(Clone)]
pub struct MemoryTable {
    name: String,
    documents: BTreeMap<DocumentId, Document>,
    indexes: Vec<MemoryIndex>,
    policy: Option<AccessPolicy>,
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("name", &self.name)
            .field("documents", &self.documents.len())
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

impl MemoryTable {
    /// Creates an empty table with the implicit indexes plus `indexes`.
    pub fn new(name: impl Into<String>, indexes: Vec<IndexDefinition>) -> Self {
        Self {
            name: name.into(),
            documents: BTreeMap::new(),
            indexes: with_implicit_indexes(indexes)
                .into_iter()
                .map(MemoryIndex::new)
                .collect(),
            policy: None,
        }
    }

    /// Installs an access policy.
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Reads a document without applying the access policy.
    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// All documents in id order, without applying the access policy.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Inserts a new document.
    pub fn insert(&mut self, doc: Document) -> ServerResult<()> {
        if self.documents.contains_key(&doc.id) {
            return Err(ServerError::InvalidRequest(format!(
                "document {} already exists in {}",
                doc.id, self.name
            )));
        }
        self.index_document(&doc);
        self.documents.insert(doc.id.clone(), doc);
        Ok(())
    }

    /// Replaces an existing document, returning the previous version.
    pub fn replace(&mut self, doc: Document) -> ServerResult<Document> {
        let old = self.delete(&doc.id)?;
        self.index_document(&doc);
        self.documents.insert(doc.id.clone(), doc);
        Ok(old)
    }

    /// Deletes a document, returning it.
    pub fn delete(&mut self, id: &DocumentId) -> ServerResult<Document> {
        let old = self.documents.remove(id).ok_or_else(|| {
            ServerError::InvalidRequest(format!("document {id} not found in {}", self.name))
        })?;
        for index in &mut self.indexes {
            let key = index.definition.key_for(&old);
            index.entries.remove(&key);
        }
        Ok(old)
    }

    fn index_document(&mut self, doc: &Document) {
        for index in &mut self.indexes {
            let key = index.definition.key_for(doc);
            index.entries.insert(key, doc.id.clone());
        }
    }
}

impl TableResolver for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &DocumentId, identity: &Identity) -> ServerResult<Option<Document>> {
        let Some(doc) = self.documents.get(id) else {
            return Ok(None);
        };
        let access = self
            .policy
            .as_ref()
            .map_or(Access::Allow, |policy| policy(doc, identity));
        match access {
            Access::Allow => Ok(Some(doc.clone())),
            Access::Hide => Ok(None),
            Access::Deny => Err(ServerError::NotAuthorized(format!(
                "{}/{} is not readable",
                self.name, id
            ))),
        }
    }

    fn index(&self, name: &str) -> Option<&dyn IndexCursor> {
        self.indexes
            .iter()
            .find(|i| i.definition.name == name)
            .map(|i| i as &dyn IndexCursor)
    }

    fn index_definitions(&self) -> Vec<IndexDefinition> {
        self.indexes.iter().map(|i| i.definition.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclane_value::Value;

    fn message(id: &str, conversation: &str, t: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("conversation".to_string(), Value::from(conversation));
        Document::new(DocumentId::new(id), t, fields)
    }

    fn messages() -> MemoryTable {
        let mut table = MemoryTable::new(
            "messages",
            vec![IndexDefinition::new(
                "by_conversation",
                vec!["conversation".into()],
            )],
        );
        table.insert(message("m1", "c1", 1)).unwrap();
        table.insert(message("m2", "c2", 2)).unwrap();
        table.insert(message("m3", "c1", 3)).unwrap();
        table
    }

    fn batch_ids(batch: &IndexBatch) -> Vec<&str> {
        batch.items.iter().map(|(_, id)| id.as_str()).collect()
    }

    #[test]
    fn prefix_scan_on_secondary_index() {
        let table = messages();
        let index = table.index("by_conversation").unwrap();
        let range = KeyRange::prefix(IndexKey(vec![Value::from("c1")]));
        let batch = index.next_batch(&range, Direction::Asc, 10).unwrap();
        assert_eq!(batch_ids(&batch), ["m1", "m3"]);
        assert!(batch.next_bound.is_none());
    }

    #[test]
    fn batches_resume_from_bound() {
        let table = messages();
        let index = table.index("by_id").unwrap();
        let first = index.next_batch(&KeyRange::all(), Direction::Desc, 2).unwrap();
        assert_eq!(batch_ids(&first), ["m3", "m2"]);

        let upper = first.next_bound.clone().unwrap();
        let rest = index
            .next_batch(&KeyRange::new(Bound::Minimal, upper), Direction::Desc, 2)
            .unwrap();
        assert_eq!(batch_ids(&rest), ["m1"]);
        assert!(rest.next_bound.is_none());
    }

    #[test]
    fn replace_moves_index_entries() {
        let mut table = messages();
        table.replace(message("m1", "c2", 1)).unwrap();
        let index = table.index("by_conversation").unwrap();
        let range = KeyRange::prefix(IndexKey(vec![Value::from("c2")]));
        let batch = index.next_batch(&range, Direction::Asc, 10).unwrap();
        assert_eq!(batch_ids(&batch), ["m1", "m2"]);
    }

    #[test]
    fn duplicate_and_missing_documents() {
        let mut table = messages();
        assert!(table.insert(message("m1", "c1", 9)).is_err());
        assert!(table.delete(&DocumentId::new("nope")).is_err());
        table.delete(&DocumentId::new("m2")).unwrap();
        assert_eq!(table.len(), 2);
    }
}
