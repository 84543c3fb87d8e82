//! Transactional writes performed by server mutations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use synclane_protocol::{Direction, Document, DocumentId, KeyRange, PageRequest};
use synclane_value::Value;

use crate::error::{ServerError, ServerResult};
use crate::resolver::{fetch_page, Identity};
use crate::table::MemoryTable;

/// A server mutation: reads and writes through the writer, returns a value
/// for the client, or an error message that aborts the whole mutation.
pub type ServerMutation =
    Arc<dyn Fn(&mut ServerWriter<'_>, &Value, &Identity) -> Result<Value, String> + Send + Sync>;

/// Write access to a private copy of the tables.
///
/// Nothing is visible to other sessions until the mutation returns `Ok`
/// and the server commits the copy.
pub struct ServerWriter<'a> {
    tables: &'a mut BTreeMap<String, MemoryTable>,
    touched: BTreeSet<String>,
    next_document: &'a mut u64,
    creation_time: i64,
}

impl<'a> ServerWriter<'a> {
    pub(crate) fn new(
        tables: &'a mut BTreeMap<String, MemoryTable>,
        next_document: &'a mut u64,
        creation_time: i64,
    ) -> Self {
        Self {
            tables,
            touched: BTreeSet::new(),
            next_document,
            creation_time,
        }
    }

    pub(crate) fn into_touched(self) -> BTreeSet<String> {
        self.touched
    }

    fn table(&self, name: &str) -> ServerResult<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| ServerError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> ServerResult<&mut MemoryTable> {
        self.touched.insert(name.to_string());
        self.tables
            .get_mut(name)
            .ok_or_else(|| ServerError::UnknownTable(name.to_string()))
    }

    /// Inserts a document with a server-assigned id and creation time.
    pub fn insert(
        &mut self,
        table: &str,
        fields: BTreeMap<String, Value>,
    ) -> ServerResult<DocumentId> {
        *self.next_document += 1;
        let id = DocumentId::new(format!("{table}:{:08}", *self.next_document));
        self.creation_time = self.creation_time.saturating_add(1);
        let doc = Document::new(id.clone(), self.creation_time, fields);
        self.table_mut(table)?.insert(doc)?;
        Ok(id)
    }

    /// Reads a document, ignoring access policies.
    pub fn get(&self, table: &str, id: &DocumentId) -> ServerResult<Option<Document>> {
        Ok(self.table(table)?.document(id).cloned())
    }

    /// Merges `fields` into an existing document. `Null` removes a field.
    pub fn patch(
        &mut self,
        table: &str,
        id: &DocumentId,
        fields: BTreeMap<String, Value>,
    ) -> ServerResult<()> {
        let table = self.table_mut(table)?;
        let mut doc = table
            .document(id)
            .cloned()
            .ok_or_else(|| ServerError::InvalidRequest(format!("document {id} not found")))?;
        for (name, value) in fields {
            if value.is_null() {
                doc.fields.remove(&name);
            } else {
                doc.fields.insert(name, value);
            }
        }
        table.replace(doc)?;
        Ok(())
    }

    /// Replaces the user fields of an existing document.
    pub fn replace(
        &mut self,
        table: &str,
        id: &DocumentId,
        fields: BTreeMap<String, Value>,
    ) -> ServerResult<()> {
        let table = self.table_mut(table)?;
        let creation_time = table
            .document(id)
            .map(|d| d.creation_time)
            .ok_or_else(|| ServerError::InvalidRequest(format!("document {id} not found")))?;
        table.replace(Document::new(id.clone(), creation_time, fields))?;
        Ok(())
    }

    /// Deletes a document.
    pub fn delete(&mut self, table: &str, id: &DocumentId) -> ServerResult<()> {
        self.table_mut(table)?.delete(id)?;
        Ok(())
    }

    /// Reads every document of `range` in an index, in `direction` order.
    pub fn query(
        &self,
        table: &str,
        index: &str,
        range: KeyRange,
        direction: Direction,
    ) -> ServerResult<Vec<Document>> {
        let request = PageRequest::new(table, index, range).with_direction(direction);
        let page = fetch_page(self.table(table)?, &request, &Identity::Anonymous, 64)?;
        let mut docs: Vec<Document> = page.documents.into_iter().map(|d| d.document).collect();
        if direction == Direction::Desc {
            docs.reverse();
        }
        Ok(docs)
    }

    /// Returns true if `table` exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> BTreeMap<String, MemoryTable> {
        let mut tables = BTreeMap::new();
        tables.insert("notes".to_string(), MemoryTable::new("notes", vec![]));
        tables
    }

    fn fields(body: &str) -> BTreeMap<String, Value> {
        let mut f = BTreeMap::new();
        f.insert("body".to_string(), Value::from(body));
        f
    }

    #[test]
    fn insert_patch_delete() {
        let mut tables = setup();
        let mut counter = 0;
        let mut writer = ServerWriter::new(&mut tables, &mut counter, 1000);

        let id = writer.insert("notes", fields("a")).unwrap();
        let mut patch = BTreeMap::new();
        patch.insert("done".to_string(), Value::Bool(true));
        writer.patch("notes", &id, patch).unwrap();

        let doc = writer.get("notes", &id).unwrap().unwrap();
        assert_eq!(doc.get("done"), Value::Bool(true));
        assert_eq!(doc.get("body"), Value::from("a"));
        assert_eq!(doc.creation_time, 1001);

        writer.delete("notes", &id).unwrap();
        assert!(writer.get("notes", &id).unwrap().is_none());
        assert_eq!(writer.into_touched().len(), 1);
    }

    #[test]
    fn query_in_creation_order() {
        let mut tables = setup();
        let mut counter = 0;
        let mut writer = ServerWriter::new(&mut tables, &mut counter, 0);
        writer.insert("notes", fields("a")).unwrap();
        writer.insert("notes", fields("b")).unwrap();

        let docs = writer
            .query("notes", "by_creation_time", KeyRange::all(), Direction::Desc)
            .unwrap();
        let bodies: Vec<_> = docs.iter().map(|d| d.get("body")).collect();
        assert_eq!(bodies, [Value::from("b"), Value::from("a")]);
    }

    #[test]
    fn unknown_table() {
        let mut tables = setup();
        let mut counter = 0;
        let mut writer = ServerWriter::new(&mut tables, &mut counter, 0);
        assert!(matches!(
            writer.insert("nope", BTreeMap::new()),
            Err(ServerError::UnknownTable(_))
        ));
    }
}
