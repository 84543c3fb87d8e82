//! Optimistic overlay: pending mutations replayed over the loaded pages.
//!
//! The overlay never mutates pages. It is an ordered list of optimistic
//! functions; replaying them in submission order against the current pages
//! produces an [`OverlayView`] of document-level writes that reads merge on
//! top of the authoritative data. Retiring an entry and replaying gives the
//! same view as if the entry had never been submitted.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use synclane_protocol::{Document, DocumentId, MutationId};
use synclane_value::Value;
use tracing::warn;

use crate::error::QueryError;
use crate::page_cache::PageCache;
use crate::reader::{IndexQuery, LocalDbReader};
use crate::schema::LocalSchema;

/// An optimistic mutation: the client-side prediction of a server mutation.
pub type OptimisticFn =
    Arc<dyn Fn(&mut LocalWriter<'_>, &Value) -> Result<(), QueryError> + Send + Sync>;

/// Document-level writes produced by replaying the overlay.
///
/// `None` marks a deleted document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayView {
    tables: BTreeMap<String, BTreeMap<DocumentId, Option<Document>>>,
}

impl OverlayView {
    /// The overlay entry for a document, if the overlay touched it.
    pub fn get(&self, table: &str, id: &DocumentId) -> Option<Option<&Document>> {
        self.tables.get(table)?.get(id).map(Option::as_ref)
    }

    /// Records a write.
    pub fn put(&mut self, table: &str, id: DocumentId, doc: Option<Document>) {
        self.tables.entry(table.to_string()).or_default().insert(id, doc);
    }

    /// Entries of one table.
    pub fn entries<'a>(
        &'a self,
        table: &str,
    ) -> impl Iterator<Item = (&'a DocumentId, &'a Option<Document>)> + 'a {
        self.tables.get(table).into_iter().flat_map(|t| t.iter())
    }

    /// Number of touched documents.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is overlaid.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write access for optimistic mutations.
///
/// Reads see the loaded pages plus every earlier pending mutation plus
/// this mutation's own writes. Reads never trigger fetches: an unloaded
/// range fails with `Loading` and the mutation contributes nothing until
/// the next replay.
pub struct LocalWriter<'a> {
    reader: LocalDbReader<'a>,
    mutation_id: MutationId,
    next_creation_time: i64,
    inserted: u32,
}

impl<'a> LocalWriter<'a> {
    pub(crate) fn new(reader: LocalDbReader<'a>, mutation_id: MutationId, creation_base: i64) -> Self {
        Self {
            reader,
            mutation_id,
            next_creation_time: creation_base,
            inserted: 0,
        }
    }

    fn finish(self) -> (OverlayView, i64) {
        (self.reader.view.into_owned(), self.next_creation_time)
    }

    fn check_table(&self, table: &str) -> Result<(), QueryError> {
        if self.reader.schema().has_table(table) {
            Ok(())
        } else {
            Err(QueryError::UnknownTable(table.to_string()))
        }
    }

    fn existing(&mut self, table: &str, id: &DocumentId) -> Result<Document, QueryError> {
        self.reader
            .get(table, id)?
            .ok_or_else(|| QueryError::failed(format!("document {id} not found")))
    }

    /// Inserts a document with a local id and a local creation time.
    pub fn insert(
        &mut self,
        table: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<DocumentId, QueryError> {
        self.check_table(table)?;
        self.inserted += 1;
        let id = DocumentId::new(format!("local:{}:{}", self.mutation_id.0, self.inserted));
        let doc = Document::new(id.clone(), self.next_creation_time, fields);
        self.next_creation_time = self.next_creation_time.saturating_add(1);
        self.reader.view.to_mut().put(table, id.clone(), Some(doc));
        Ok(id)
    }

    /// Merges fields into a document. `Null` removes a field.
    pub fn patch(
        &mut self,
        table: &str,
        id: &DocumentId,
        fields: BTreeMap<String, Value>,
    ) -> Result<(), QueryError> {
        let mut doc = self.existing(table, id)?;
        for (name, value) in fields {
            if value.is_null() {
                doc.fields.remove(&name);
            } else {
                doc.fields.insert(name, value);
            }
        }
        self.reader.view.to_mut().put(table, id.clone(), Some(doc));
        Ok(())
    }

    /// Replaces a document's user fields.
    pub fn replace(
        &mut self,
        table: &str,
        id: &DocumentId,
        fields: BTreeMap<String, Value>,
    ) -> Result<(), QueryError> {
        let existing = self.existing(table, id)?;
        let doc = Document::new(id.clone(), existing.creation_time, fields);
        self.reader.view.to_mut().put(table, id.clone(), Some(doc));
        Ok(())
    }

    /// Deletes a document.
    pub fn delete(&mut self, table: &str, id: &DocumentId) -> Result<(), QueryError> {
        self.check_table(table)?;
        self.reader.view.to_mut().put(table, id.clone(), None);
        Ok(())
    }

    /// Reads a document.
    pub fn get(&mut self, table: &str, id: &DocumentId) -> Result<Option<Document>, QueryError> {
        self.reader.get(table, id)
    }

    /// Starts a range read.
    pub fn query(&mut self, table: &str, index: &str) -> IndexQuery<'_, 'a> {
        self.reader.query(table, index)
    }
}

#[derive(Clone)]
pub(crate) struct OverlayEntry {
    pub(crate) mutation_id: MutationId,
    pub(crate) name: String,
    pub(crate) optimistic: OptimisticFn,
    pub(crate) args: Value,
    pub(crate) creation_base: i64,
}

/// Pending optimistic mutations in submission order and their combined view.
#[derive(Default)]
pub struct Overlay {
    entries: Vec<OverlayEntry>,
    view: OverlayView,
}

impl Overlay {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// The combined writes of every pending entry.
    pub fn view(&self) -> &OverlayView {
        &self.view
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if the mutation has a pending entry.
    pub fn contains(&self, id: MutationId) -> bool {
        self.entries.iter().any(|e| e.mutation_id == id)
    }

    /// Ids of pending entries in submission order.
    pub fn mutation_ids(&self) -> impl Iterator<Item = MutationId> + '_ {
        self.entries.iter().map(|e| e.mutation_id)
    }

    /// Appends an entry and applies it on top of the current view.
    /// Returns the first creation time the entry left unused, or `None` if
    /// the optimistic function failed.
    pub(crate) fn push(
        &mut self,
        entry: OverlayEntry,
        cache: &PageCache,
        schema: &LocalSchema,
    ) -> Option<i64> {
        let applied = Self::apply(&self.view, &entry, cache, schema);
        self.entries.push(entry);
        let (view, next_time) = applied?;
        self.view = view;
        Some(next_time)
    }

    /// Drops an entry. The view is stale until the next replay.
    pub(crate) fn retire(&mut self, id: MutationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.mutation_id != id);
        self.entries.len() != before
    }

    /// Rebuilds the view from the pages by replaying every entry in order.
    /// Returns the entries that applied.
    pub(crate) fn replay(&mut self, cache: &PageCache, schema: &LocalSchema) -> Vec<MutationId> {
        let mut view = OverlayView::default();
        let mut applied = Vec::new();
        for entry in &self.entries {
            if let Some((next, _)) = Self::apply(&view, entry, cache, schema) {
                view = next;
                applied.push(entry.mutation_id);
            }
        }
        self.view = view;
        applied
    }

    fn apply(
        view: &OverlayView,
        entry: &OverlayEntry,
        cache: &PageCache,
        schema: &LocalSchema,
    ) -> Option<(OverlayView, i64)> {
        let reader = LocalDbReader::new(cache, schema, Cow::Owned(view.clone()), None);
        let mut writer = LocalWriter::new(reader, entry.mutation_id, entry.creation_base);
        match (entry.optimistic)(&mut writer, &entry.args) {
            Ok(()) => Some(writer.finish()),
            Err(QueryError::Loading) => None,
            Err(error) => {
                warn!(mutation = %entry.mutation_id, name = %entry.name, %error, "optimistic update failed");
                None
            }
        }
    }
}
