//! Reads against the local mirror: authoritative pages merged with the
//! optimistic overlay.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};

use synclane_protocol::{
    Bound, Direction, Document, DocumentId, IndexKey, KeyRange, PageRequest, BY_ID,
};
use synclane_value::Value;

use crate::error::QueryError;
use crate::overlay::OverlayView;
use crate::page_cache::{Page, PageCache, PageId, PageState};
use crate::schema::LocalSchema;

/// Read access for sync query functions.
///
/// Every page a read touches is recorded as a dependency. A read that
/// reaches an unloaded range fails with [`QueryError::Loading`] and records
/// a request for the missing slice, which the engine turns into a page
/// subscription after the query function returns.
pub struct LocalDbReader<'a> {
    cache: &'a PageCache,
    schema: &'a LocalSchema,
    pub(crate) view: Cow<'a, OverlayView>,
    page_size: Option<u32>,
    dependencies: BTreeSet<PageId>,
    request: Option<PageRequest>,
}

impl<'a> LocalDbReader<'a> {
    /// Creates a reader. With `page_size` set, gaps produce page requests;
    /// without it, gaps only report `Loading`.
    pub(crate) fn new(
        cache: &'a PageCache,
        schema: &'a LocalSchema,
        view: Cow<'a, OverlayView>,
        page_size: Option<u32>,
    ) -> Self {
        Self {
            cache,
            schema,
            view,
            page_size,
            dependencies: BTreeSet::new(),
            request: None,
        }
    }

    pub(crate) fn schema(&self) -> &LocalSchema {
        self.schema
    }

    /// Pages read so far.
    pub fn dependencies(&self) -> &BTreeSet<PageId> {
        &self.dependencies
    }

    pub(crate) fn into_parts(self) -> (BTreeSet<PageId>, Option<PageRequest>) {
        (self.dependencies, self.request)
    }

    /// Reads a document by id.
    pub fn get(&mut self, table: &str, id: &DocumentId) -> Result<Option<Document>, QueryError> {
        if !self.schema.has_table(table) {
            return Err(QueryError::UnknownTable(table.to_string()));
        }
        if let Some(entry) = self.view.get(table, id) {
            return Ok(entry.cloned());
        }
        let cache = self.cache;
        if let Some((page, doc)) = cache
            .loaded_pages(table)
            .find_map(|p| p.document(id).map(|d| (p, d)))
        {
            self.dependencies.insert(page.id);
            return Ok(Some(doc.clone()));
        }
        let range = KeyRange::prefix(IndexKey(vec![Value::Text(id.0.clone())]));
        let docs = self.scan(table, BY_ID, &range, Direction::Asc, Some(1))?;
        Ok(docs.into_iter().next())
    }

    /// Starts a range read over an index.
    pub fn query(&mut self, table: &str, index: &str) -> IndexQuery<'_, 'a> {
        IndexQuery {
            reader: self,
            table: table.to_string(),
            index: index.to_string(),
            range: KeyRange::all(),
            direction: Direction::Asc,
            limit: None,
        }
    }

    fn scan(
        &mut self,
        table: &str,
        index: &str,
        range: &KeyRange,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, QueryError> {
        let definition = self
            .schema
            .index(table, index)
            .ok_or_else(|| QueryError::UnknownIndex {
                table: table.to_string(),
                index: index.to_string(),
            })?
            .clone();
        let mut out = Vec::new();
        if range.is_empty() || limit == Some(0) {
            return Ok(out);
        }

        let cache = self.cache;
        let pages = cache.pages(table, index);
        let mut overridden: HashSet<DocumentId> = HashSet::new();
        let mut local: Vec<(IndexKey, Document)> = Vec::new();
        for (id, entry) in self.view.entries(table) {
            overridden.insert(id.clone());
            if let Some(doc) = entry {
                local.push((definition.key_for(doc), doc.clone()));
            }
        }

        let mut cursor = match direction {
            Direction::Asc => range.lower.clone(),
            Direction::Desc => range.upper.clone(),
        };
        loop {
            let done = match direction {
                Direction::Asc => cursor >= range.upper,
                Direction::Desc => cursor <= range.lower,
            };
            if done {
                return Ok(out);
            }

            let page = pages.iter().find(|p| match direction {
                Direction::Asc => p.range.lower <= cursor && cursor < p.range.upper,
                Direction::Desc => p.range.lower < cursor && cursor <= p.range.upper,
            });
            let Some(page) = page else {
                return Err(self.gap(table, index, &pages, cursor, range, direction));
            };
            self.dependencies.insert(page.id);
            let documents = match &page.state {
                PageState::Loading => return Err(QueryError::Loading),
                PageState::Failed { error } => return Err(QueryError::Failed(error.clone())),
                PageState::Loaded { documents } => documents,
            };

            let segment = match direction {
                Direction::Asc => {
                    KeyRange::new(cursor.clone(), page.range.upper.clone().min(range.upper.clone()))
                }
                Direction::Desc => {
                    KeyRange::new(page.range.lower.clone().max(range.lower.clone()), cursor.clone())
                }
            };
            let mut chunk: Vec<(&IndexKey, &Document)> = documents
                .iter()
                .filter(|d| segment.contains(&d.key) && !overridden.contains(&d.document.id))
                .map(|d| (&d.key, &d.document))
                .chain(
                    local
                        .iter()
                        .filter(|(k, _)| segment.contains(k))
                        .map(|(k, d)| (k, d)),
                )
                .collect();
            chunk.sort_by(|a, b| a.0.cmp(b.0));
            if direction == Direction::Desc {
                chunk.reverse();
            }
            for (_, doc) in chunk {
                out.push(doc.clone());
                if limit.is_some_and(|l| out.len() >= l) {
                    return Ok(out);
                }
            }

            cursor = match direction {
                Direction::Asc => segment.upper,
                Direction::Desc => segment.lower,
            };
        }
    }

    /// Records a request for the unloaded slice starting at `cursor`. The
    /// slice stops at the next page so it never overlaps existing coverage.
    fn gap(
        &mut self,
        table: &str,
        index: &str,
        pages: &[&Page],
        cursor: Bound,
        range: &KeyRange,
        direction: Direction,
    ) -> QueryError {
        let Some(page_size) = self.page_size else {
            return QueryError::Loading;
        };
        if self.request.is_some() {
            return QueryError::Loading;
        }
        let gap = match direction {
            Direction::Asc => {
                let upper = pages
                    .iter()
                    .map(|p| &p.range.lower)
                    .filter(|l| **l > cursor)
                    .min()
                    .map_or(range.upper.clone(), |l| l.clone().min(range.upper.clone()));
                KeyRange::new(cursor, upper)
            }
            Direction::Desc => {
                let lower = pages
                    .iter()
                    .map(|p| &p.range.upper)
                    .filter(|u| **u < cursor)
                    .max()
                    .map_or(range.lower.clone(), |u| u.clone().max(range.lower.clone()));
                KeyRange::new(lower, cursor)
            }
        };
        self.request = Some(
            PageRequest::new(table, index, gap)
                .with_direction(direction)
                .with_limit(page_size),
        );
        QueryError::Loading
    }
}

/// A range read under construction.
pub struct IndexQuery<'r, 'a> {
    reader: &'r mut LocalDbReader<'a>,
    table: String,
    index: String,
    range: KeyRange,
    direction: Direction,
    limit: Option<usize>,
}

impl IndexQuery<'_, '_> {
    /// Restricts the read to a range of the index.
    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }

    /// Restricts the read to keys starting with `values`.
    pub fn prefix(mut self, values: Vec<Value>) -> Self {
        self.range = KeyRange::prefix(IndexKey(values));
        self
    }

    /// Sets the read order.
    pub fn order(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Stops after `n` documents.
    pub fn take(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Runs the read.
    pub fn collect(self) -> Result<Vec<Document>, QueryError> {
        self.reader
            .scan(&self.table, &self.index, &self.range, self.direction, self.limit)
    }

    /// Runs the read and returns the first document.
    pub fn first(self) -> Result<Option<Document>, QueryError> {
        Ok(self.take(1).collect()?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use synclane_protocol::{IndexDefinition, PageDocument, PageResult, BY_CREATION_TIME};

    fn schema() -> LocalSchema {
        LocalSchema::new().with_table(
            "messages",
            vec![IndexDefinition::new("by_conversation", vec!["conversation".into()])],
        )
    }

    fn message(id: &str, time: i64, conversation: &str) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("conversation".to_string(), Value::from(conversation));
        Document::new(DocumentId::new(id), time, fields)
    }

    fn load(cache: &mut PageCache, schema: &LocalSchema, index: &str, range: KeyRange, docs: &[Document]) -> PageId {
        let definition = schema.index("messages", index).unwrap();
        let coverage = cache.ensure_range("messages", index, &range, Direction::Asc, None);
        let id = coverage.fetches[0].query_id;
        let mut documents: Vec<PageDocument> = docs
            .iter()
            .map(|d| PageDocument {
                key: definition.key_for(d),
                document: d.clone(),
            })
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        cache.apply_loaded(
            id,
            PageResult {
                documents,
                lower: range.lower,
                upper: range.upper,
            },
        );
        id
    }

    #[test]
    fn empty_cache_requests_a_page() {
        let cache = PageCache::new();
        let schema = schema();
        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(OverlayView::default()), Some(10));
        let err = reader
            .query("messages", BY_CREATION_TIME)
            .order(Direction::Desc)
            .collect()
            .unwrap_err();
        assert_eq!(err, QueryError::Loading);
        let (deps, request) = reader.into_parts();
        assert!(deps.is_empty());
        let request = request.unwrap();
        assert_eq!(request.direction, Direction::Desc);
        assert_eq!(request.limit, Some(10));
        assert_eq!(request.range(), KeyRange::all());
    }

    #[test]
    fn reads_across_adjacent_pages() {
        let mut cache = PageCache::new();
        let schema = schema();
        let mid = Bound::Exact(IndexKey(vec![Value::Integer(2)]));
        let low = load(
            &mut cache,
            &schema,
            BY_CREATION_TIME,
            KeyRange::new(Bound::Minimal, mid.clone()),
            &[message("a", 1, "c1")],
        );
        let high = load(
            &mut cache,
            &schema,
            BY_CREATION_TIME,
            KeyRange::new(mid, Bound::Maximal),
            &[message("b", 2, "c1"), message("c", 3, "c2")],
        );

        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(OverlayView::default()), Some(10));
        let desc: Vec<String> = reader
            .query("messages", BY_CREATION_TIME)
            .order(Direction::Desc)
            .take(2)
            .collect()
            .unwrap()
            .into_iter()
            .map(|d| d.id.0)
            .collect();
        assert_eq!(desc, ["c", "b"]);
        assert_eq!(reader.dependencies().iter().copied().collect::<Vec<_>>(), [high]);

        let asc = reader.query("messages", BY_CREATION_TIME).collect().unwrap();
        assert_eq!(asc.len(), 3);
        assert!(reader.dependencies().contains(&low));
        assert!(reader.into_parts().1.is_none());
    }

    #[test]
    fn overlay_documents_merge_into_loaded_pages() {
        let mut cache = PageCache::new();
        let schema = schema();
        load(
            &mut cache,
            &schema,
            "by_conversation",
            KeyRange::all(),
            &[message("a", 1, "c1"), message("b", 2, "c1")],
        );
        let mut view = OverlayView::default();
        view.put("messages", DocumentId::new("a"), None);
        view.put("messages", DocumentId::new("local"), Some(message("local", 5, "c1")));
        view.put("messages", DocumentId::new("other"), Some(message("other", 6, "c2")));

        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(view), Some(10));
        let ids: Vec<String> = reader
            .query("messages", "by_conversation")
            .prefix(vec![Value::from("c1")])
            .collect()
            .unwrap()
            .into_iter()
            .map(|d| d.id.0)
            .collect();
        assert_eq!(ids, ["b", "local"]);
        assert!(reader.get("messages", &DocumentId::new("a")).unwrap().is_none());
    }

    #[test]
    fn get_falls_back_to_a_point_read() {
        let cache = PageCache::new();
        let schema = schema();
        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(OverlayView::default()), Some(10));
        assert_eq!(
            reader.get("messages", &DocumentId::new("x")),
            Err(QueryError::Loading)
        );
        let request = reader.into_parts().1.unwrap();
        assert_eq!(request.index, BY_ID);
        assert_eq!(
            request.range(),
            KeyRange::prefix(IndexKey(vec![Value::from("x")]))
        );
    }

    #[test]
    fn gap_request_stops_at_next_page() {
        let mut cache = PageCache::new();
        let schema = schema();
        let mid = Bound::Exact(IndexKey(vec![Value::Integer(5)]));
        load(
            &mut cache,
            &schema,
            BY_CREATION_TIME,
            KeyRange::new(mid.clone(), Bound::Maximal),
            &[],
        );
        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(OverlayView::default()), Some(3));
        assert!(reader.query("messages", BY_CREATION_TIME).collect().is_err());
        let request = reader.into_parts().1.unwrap();
        assert_eq!(request.range(), KeyRange::new(Bound::Minimal, mid));
    }

    #[test]
    fn unknown_index_and_table() {
        let cache = PageCache::new();
        let schema = schema();
        let mut reader = LocalDbReader::new(&cache, &schema, Cow::Owned(OverlayView::default()), None);
        assert!(matches!(
            reader.query("messages", "by_author").collect(),
            Err(QueryError::UnknownIndex { .. })
        ));
        assert!(matches!(
            reader.get("ghosts", &DocumentId::new("x")),
            Err(QueryError::UnknownTable(_))
        ));
    }
}
