//! Documents and index definitions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use synclane_value::Value;

use crate::key::IndexKey;

/// System field holding the document id.
pub const ID_FIELD: &str = "_id";
/// System field holding the creation time.
pub const CREATION_TIME_FIELD: &str = "_creationTime";
/// Name of the implicit index ordered by id.
pub const BY_ID: &str = "by_id";
/// Name of the implicit index ordered by creation time.
pub const BY_CREATION_TIME: &str = "by_creation_time";

/// Identifier of a document within its table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Creates a document id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A stored document: system fields plus user fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: DocumentId,
    /// Logical creation time, used by `by_creation_time`.
    pub creation_time: i64,
    /// User fields. Names never start with `_`.
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Creates a document.
    pub fn new(id: DocumentId, creation_time: i64, fields: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            creation_time,
            fields,
        }
    }

    /// Reads a field, including the `_id` and `_creationTime` system fields.
    /// Missing fields read as `Null`.
    pub fn get(&self, field: &str) -> Value {
        match field {
            ID_FIELD => Value::Text(self.id.0.clone()),
            CREATION_TIME_FIELD => Value::Integer(self.creation_time),
            _ => self.fields.get(field).cloned().unwrap_or(Value::Null),
        }
    }

    /// The document as a single object value including system fields.
    pub fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(ID_FIELD.to_string(), self.get(ID_FIELD));
        fields.insert(CREATION_TIME_FIELD.to_string(), self.get(CREATION_TIME_FIELD));
        Value::Object(fields)
    }
}

/// A named index over a table: its key is the listed field values
/// followed by the document id as tiebreaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name, unique within the table.
    pub name: String,
    /// Indexed field paths in key order.
    pub fields: Vec<String>,
}

impl IndexDefinition {
    /// Creates an index definition.
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// The implicit index ordered by id.
    pub fn by_id() -> Self {
        Self::new(BY_ID, Vec::new())
    }

    /// The implicit index ordered by creation time.
    pub fn by_creation_time() -> Self {
        Self::new(BY_CREATION_TIME, vec![CREATION_TIME_FIELD.to_string()])
    }

    /// Computes the key of a document in this index.
    pub fn key_for(&self, doc: &Document) -> IndexKey {
        let mut values: Vec<Value> = self.fields.iter().map(|f| doc.get(f)).collect();
        values.push(Value::Text(doc.id.0.clone()));
        IndexKey(values)
    }
}

/// The indexes every table has, followed by `extra`.
pub fn with_implicit_indexes(extra: Vec<IndexDefinition>) -> Vec<IndexDefinition> {
    let mut all = vec![IndexDefinition::by_id(), IndexDefinition::by_creation_time()];
    all.extend(extra);
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("conversation".to_string(), Value::from("c1"));
        fields.insert("body".to_string(), Value::from("hi"));
        Document::new(DocumentId::new("m1"), 7, fields)
    }

    #[test]
    fn system_fields() {
        let doc = message();
        assert_eq!(doc.get("_id"), Value::from("m1"));
        assert_eq!(doc.get("_creationTime"), Value::Integer(7));
        assert_eq!(doc.get("nope"), Value::Null);
        assert_eq!(doc.to_value().get("_id"), Some(&Value::from("m1")));
    }

    #[test]
    fn index_keys_end_with_id() {
        let doc = message();
        let index = IndexDefinition::new("by_conversation", vec!["conversation".into()]);
        assert_eq!(
            index.key_for(&doc),
            IndexKey(vec![Value::from("c1"), Value::from("m1")])
        );
        assert_eq!(IndexDefinition::by_id().key_for(&doc), IndexKey(vec![Value::from("m1")]));
        assert_eq!(
            IndexDefinition::by_creation_time().key_for(&doc),
            IndexKey(vec![Value::Integer(7), Value::from("m1")])
        );
    }

    #[test]
    fn implicit_indexes_first() {
        let all = with_implicit_indexes(vec![IndexDefinition::new("x", vec![])]);
        let names: Vec<_> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, [BY_ID, BY_CREATION_TIME, "x"]);
    }
}
