//! Client-side mirror of loaded index slices.
//!
//! Every page is a server subscription: its id is the `QueryId` used in the
//! query set, and the server keeps it current through transitions. Within
//! one `(table, index)` the loaded pages never overlap; when a fresh slice
//! lands on top of older ones the newest slice wins and the older pages are
//! discarded or trimmed to the uncovered remainder.

use std::collections::BTreeMap;

use synclane_protocol::{
    Direction, DocumentId, Document, KeyRange, PageDocument, PageQuery, PageRequest, PageResult,
    QueryId,
};
use tracing::debug;

/// Pages share the id space of the query set.
pub type PageId = QueryId;

/// Load state of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// Requested, no result yet.
    Loading,
    /// Authoritative documents of the page's range, ascending.
    Loaded {
        /// Documents with their index keys.
        documents: Vec<PageDocument>,
    },
    /// The server could not compute the page.
    Failed {
        /// Server error message.
        error: String,
    },
}

/// One subscribed slice of an index.
#[derive(Debug, Clone)]
pub struct Page {
    /// Page id, equal to the query id on the wire.
    pub id: PageId,
    /// Table name.
    pub table: String,
    /// Index name.
    pub index: String,
    /// Range the page covers: the requested range while loading, the
    /// delivered range once loaded.
    pub range: KeyRange,
    /// Request sent to the server.
    pub request: PageRequest,
    /// Load state.
    pub state: PageState,
    held: bool,
}

impl Page {
    /// Returns true once documents have arrived.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state, PageState::Loaded { .. })
    }

    /// Loaded documents, empty otherwise.
    pub fn documents(&self) -> &[PageDocument] {
        match &self.state {
            PageState::Loaded { documents } => documents,
            _ => &[],
        }
    }

    /// Finds a loaded document by id.
    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents()
            .iter()
            .map(|d| &d.document)
            .find(|d| d.id == *id)
    }

    /// The request that re-creates this page with stable bounds.
    pub fn resubscribe_request(&self) -> PageRequest {
        if self.is_loaded() {
            PageRequest::new(self.table.clone(), self.index.clone(), self.range.clone())
        } else {
            self.request.clone()
        }
    }

    fn same_index(&self, table: &str, index: &str) -> bool {
        self.table == table && self.index == index
    }
}

/// Existing coverage of a range plus the fetches issued for its gaps.
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    /// Pages (in any state) intersecting the range.
    pub pages: Vec<PageId>,
    /// New subscriptions, one per uncovered sub-range.
    pub fetches: Vec<PageQuery>,
}

/// Query set changes and affected pages caused by a slice landing.
#[derive(Debug, Clone, Default)]
pub struct CacheChange {
    /// Pages whose contents changed or disappeared.
    pub changed: Vec<PageId>,
    /// Pages dropped from the cache; their subscriptions must be removed.
    pub removed: Vec<PageId>,
    /// Replacement pages for trimmed remainders; they must be subscribed.
    pub added: Vec<PageQuery>,
}

/// The page cache.
#[derive(Debug, Clone, Default)]
pub struct PageCache {
    pages: BTreeMap<PageId, Page>,
    refs: BTreeMap<PageId, usize>,
    next_id: u64,
}

impl PageCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages in any state.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if the cache holds no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Looks up a page.
    pub fn get(&self, id: PageId) -> Option<&Page> {
        self.pages.get(&id)
    }

    /// All pages in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    /// Pages of one index, ordered by lower bound.
    pub fn pages(&self, table: &str, index: &str) -> Vec<&Page> {
        let mut pages: Vec<&Page> = self
            .pages
            .values()
            .filter(|p| p.same_index(table, index))
            .collect();
        pages.sort_by(|a, b| a.range.lower.cmp(&b.range.lower).then(a.id.cmp(&b.id)));
        pages
    }

    /// Loaded pages of a table across all its indexes.
    pub fn loaded_pages<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Page> + 'a {
        self.pages
            .values()
            .filter(move |p| p.table == table && p.is_loaded())
    }

    fn allocate(&mut self) -> PageId {
        self.next_id += 1;
        QueryId(self.next_id)
    }

    /// Returns the pages already covering `range` and creates one loading
    /// page per uncovered sub-range. Loading pages count as coverage, so a
    /// range that is already in flight is never fetched twice.
    pub fn ensure_range(
        &mut self,
        table: &str,
        index: &str,
        range: &KeyRange,
        direction: Direction,
        limit: Option<u32>,
    ) -> Coverage {
        let mut coverage = Coverage::default();
        if range.is_empty() {
            return coverage;
        }
        let mut gaps = vec![range.clone()];
        for page in self.pages(table, index) {
            if !page.range.intersects(range) {
                continue;
            }
            coverage.pages.push(page.id);
            gaps = gaps
                .into_iter()
                .flat_map(|gap| gap.difference(&page.range))
                .filter(|gap| !gap.is_empty())
                .collect();
        }

        for gap in gaps {
            let id = self.allocate();
            let mut request =
                PageRequest::new(table, index, gap.clone()).with_direction(direction);
            request.limit = limit;
            debug!(page = %id, %table, %index, "requesting page");
            self.pages.insert(
                id,
                Page {
                    id,
                    table: table.to_string(),
                    index: index.to_string(),
                    range: gap,
                    request: request.clone(),
                    state: PageState::Loading,
                    held: false,
                },
            );
            coverage.fetches.push(PageQuery {
                query_id: id,
                request,
            });
        }
        coverage
    }

    /// Stores a delivered slice for page `id`. Older loaded pages that
    /// overlap the slice are invalidated. Unknown ids are ignored.
    pub fn apply_loaded(&mut self, id: PageId, result: PageResult) -> CacheChange {
        let Some(page) = self.pages.get(&id) else {
            debug!(page = %id, "slice for unknown page ignored");
            return CacheChange::default();
        };
        let (table, index) = (page.table.clone(), page.index.clone());
        let range = result.range();

        let mut change = self.invalidate_range(&table, &index, &range, Some(id));
        if let Some(page) = self.pages.get_mut(&id) {
            page.range = range;
            page.state = PageState::Loaded {
                documents: result.documents,
            };
        }
        change.changed.push(id);
        change
    }

    /// Discards loaded or failed pages of an index that intersect `range`
    /// (other than `except`). Pages extending beyond the range are trimmed:
    /// the remainder keeps its documents under a new id with fixed bounds
    /// and must be subscribed again.
    pub fn invalidate_range(
        &mut self,
        table: &str,
        index: &str,
        range: &KeyRange,
        except: Option<PageId>,
    ) -> CacheChange {
        let overlapping: Vec<PageId> = self
            .pages
            .values()
            .filter(|p| {
                Some(p.id) != except
                    && p.same_index(table, index)
                    && !matches!(p.state, PageState::Loading)
                    && p.range.intersects(range)
            })
            .map(|p| p.id)
            .collect();

        let mut change = CacheChange::default();
        for old_id in overlapping {
            let Some(old) = self.pages.remove(&old_id) else {
                continue;
            };
            self.refs.remove(&old_id);
            change.changed.push(old_id);
            change.removed.push(old_id);

            for piece in old.range.difference(range) {
                let new_id = self.allocate();
                let request = PageRequest::new(table, index, piece.clone());
                let state = match &old.state {
                    PageState::Loaded { documents } => PageState::Loaded {
                        documents: documents
                            .iter()
                            .filter(|d| piece.contains(&d.key))
                            .cloned()
                            .collect(),
                    },
                    _ => PageState::Loading,
                };
                debug!(old = %old_id, new = %new_id, "trimmed overlapping page");
                self.pages.insert(
                    new_id,
                    Page {
                        id: new_id,
                        table: table.to_string(),
                        index: index.to_string(),
                        range: piece,
                        request: request.clone(),
                        state,
                        held: old.held,
                    },
                );
                change.changed.push(new_id);
                change.added.push(PageQuery {
                    query_id: new_id,
                    request,
                });
            }
        }
        change
    }

    /// Marks a page failed.
    pub fn fail(&mut self, id: PageId, error: String) -> bool {
        match self.pages.get_mut(&id) {
            Some(page) => {
                page.state = PageState::Failed { error };
                true
            }
            None => false,
        }
    }

    /// Removes a page.
    pub fn remove(&mut self, id: PageId) -> Option<Page> {
        self.refs.remove(&id);
        self.pages.remove(&id)
    }

    /// Adds a loaded page restored from persistence under a fresh id. It
    /// survives sweeps until [`PageCache::release_holds`] or the next
    /// resubscription.
    pub fn restore(
        &mut self,
        table: &str,
        index: &str,
        range: KeyRange,
        documents: Vec<PageDocument>,
    ) -> (PageId, CacheChange) {
        let mut change = self.invalidate_range(table, index, &range, None);
        let id = self.allocate();
        let request = PageRequest::new(table, index, range.clone());
        self.pages.insert(
            id,
            Page {
                id,
                table: table.to_string(),
                index: index.to_string(),
                range,
                request,
                state: PageState::Loaded { documents },
                held: true,
            },
        );
        change.changed.push(id);
        (id, change)
    }

    /// Lets restored pages be swept like any other page.
    pub fn release_holds(&mut self) {
        for page in self.pages.values_mut() {
            page.held = false;
        }
    }

    /// Increments the reference count of each page.
    pub fn retain<'a>(&mut self, ids: impl IntoIterator<Item = &'a PageId>) {
        for id in ids {
            if self.pages.contains_key(id) {
                *self.refs.entry(*id).or_insert(0) += 1;
            }
        }
    }

    /// Decrements the reference count of each page.
    pub fn release<'a>(&mut self, ids: impl IntoIterator<Item = &'a PageId>) {
        for id in ids {
            if let Some(count) = self.refs.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    self.refs.remove(id);
                }
            }
        }
    }

    /// Number of subscriptions depending on a page.
    pub fn ref_count(&self, id: PageId) -> usize {
        self.refs.get(&id).copied().unwrap_or(0)
    }

    /// Drops every unreferenced page and returns their ids.
    pub fn sweep(&mut self) -> Vec<PageId> {
        let dead: Vec<PageId> = self
            .pages
            .values()
            .filter(|p| !p.held && self.ref_count(p.id) == 0)
            .map(|p| p.id)
            .collect();
        for id in &dead {
            self.pages.remove(id);
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "evicted unreferenced pages");
        }
        dead
    }

    /// Turns every page back into a loading subscription with stable
    /// bounds, for a fresh server connection. Returns the subscriptions.
    pub fn resubscribe_all(&mut self) -> Vec<PageQuery> {
        self.pages
            .values_mut()
            .map(|page| {
                let request = page.resubscribe_request();
                page.range = request.range();
                page.request = request.clone();
                page.state = PageState::Loading;
                page.held = false;
                PageQuery {
                    query_id: page.id,
                    request,
                }
            })
            .collect()
    }

    /// Verifies that loaded pages of one index never overlap and that
    /// every document lies inside its page.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut by_index: BTreeMap<(&str, &str), Vec<&Page>> = BTreeMap::new();
        for page in self.pages.values().filter(|p| p.is_loaded()) {
            if let Some(doc) = page.documents().iter().find(|d| !page.range.contains(&d.key)) {
                return Err(format!(
                    "document {} lies outside page {}",
                    doc.document.id, page.id
                ));
            }
            by_index
                .entry((page.table.as_str(), page.index.as_str()))
                .or_default()
                .push(page);
        }
        for ((table, index), mut pages) in by_index {
            pages.sort_by(|a, b| a.range.lower.cmp(&b.range.lower));
            for pair in pages.windows(2) {
                if pair[0].range.intersects(&pair[1].range) {
                    return Err(format!(
                        "pages {} and {} overlap on {table}.{index}",
                        pair[0].id, pair[1].id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use synclane_protocol::{Bound, IndexKey};
    use synclane_value::Value;

    fn key(s: &str) -> IndexKey {
        IndexKey(vec![Value::from(s)])
    }

    fn doc(s: &str) -> PageDocument {
        PageDocument {
            key: key(s),
            document: Document::new(DocumentId::new(s), 0, BTreeMap::new()),
        }
    }

    fn slice(lower: Bound, upper: Bound, keys: &[&str]) -> PageResult {
        PageResult {
            documents: keys.iter().map(|k| doc(k)).collect(),
            lower,
            upper,
        }
    }

    #[test]
    fn loading_pages_dedupe_fetches() {
        let mut cache = PageCache::new();
        let first = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, Some(10));
        assert_eq!(first.fetches.len(), 1);
        let second = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, Some(10));
        assert!(second.fetches.is_empty());
        assert_eq!(second.pages, vec![first.fetches[0].query_id]);
    }

    #[test]
    fn two_halves_cover_the_full_range() {
        let mut cache = PageCache::new();
        let mid = Bound::Exact(key("mid"));
        let low = cache.ensure_range(
            "t",
            "by_id",
            &KeyRange::new(Bound::Minimal, mid.clone()),
            Direction::Asc,
            None,
        );
        let high = cache.ensure_range(
            "t",
            "by_id",
            &KeyRange::new(mid.clone(), Bound::Maximal),
            Direction::Asc,
            None,
        );
        cache.apply_loaded(
            low.fetches[0].query_id,
            slice(Bound::Minimal, mid.clone(), &["a"]),
        );
        cache.apply_loaded(
            high.fetches[0].query_id,
            slice(mid, Bound::Maximal, &["z"]),
        );

        let full = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, None);
        assert!(full.fetches.is_empty());
        assert_eq!(full.pages.len(), 2);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn newest_slice_trims_older_page() {
        let mut cache = PageCache::new();
        let old = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, None);
        let old_id = old.fetches[0].query_id;
        cache.apply_loaded(old_id, slice(Bound::Minimal, Bound::Maximal, &["a", "m", "z"]));

        // A second page loaded over the middle wins; the old page splits.
        let mid_range = KeyRange::new(Bound::Exact(key("f")), Bound::Exact(key("p")));
        let mid_id = cache.allocate();
        cache.pages.insert(
            mid_id,
            Page {
                id: mid_id,
                table: "t".into(),
                index: "by_id".into(),
                range: mid_range.clone(),
                request: PageRequest::new("t", "by_id", mid_range.clone()),
                state: PageState::Loading,
                held: false,
            },
        );
        let change = cache.apply_loaded(
            mid_id,
            slice(mid_range.lower.clone(), mid_range.upper.clone(), &["n"]),
        );

        assert_eq!(change.removed, vec![old_id]);
        assert_eq!(change.added.len(), 2);
        assert!(cache.get(old_id).is_none());
        cache.check_invariants().unwrap();

        let docs: Vec<String> = cache
            .pages("t", "by_id")
            .iter()
            .flat_map(|p| p.documents().iter().map(|d| d.document.id.0.clone()))
            .collect();
        assert_eq!(docs, ["a", "n", "z"]);
    }

    #[test]
    fn sweep_keeps_referenced_pages() {
        let mut cache = PageCache::new();
        let a = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, None);
        let b = cache.ensure_range("u", "by_id", &KeyRange::all(), Direction::Asc, None);
        let a_id = a.fetches[0].query_id;
        cache.retain(&[a_id]);
        assert_eq!(cache.sweep(), vec![b.fetches[0].query_id]);
        assert_eq!(cache.ref_count(a_id), 1);
        cache.release(&[a_id]);
        assert_eq!(cache.sweep(), vec![a_id]);
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_page_and_resubscribe() {
        let mut cache = PageCache::new();
        let c = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Desc, Some(5));
        let id = c.fetches[0].query_id;
        assert!(cache.fail(id, "denied".into()));
        assert!(!cache.fail(QueryId(99), "nope".into()));
        assert!(matches!(cache.get(id).unwrap().state, PageState::Failed { .. }));

        let subs = cache.resubscribe_all();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].request.limit, Some(5));
        assert_eq!(cache.get(id).unwrap().state, PageState::Loading);
    }

    #[test]
    fn loaded_pages_resubscribe_with_fixed_bounds() {
        let mut cache = PageCache::new();
        let c = cache.ensure_range("t", "by_id", &KeyRange::all(), Direction::Asc, Some(1));
        let id = c.fetches[0].query_id;
        cache.apply_loaded(id, slice(Bound::Minimal, Bound::Successor(key("a")), &["a"]));

        let subs = cache.resubscribe_all();
        assert_eq!(subs[0].request.limit, None);
        assert_eq!(subs[0].request.upper, Bound::Successor(key("a")));
    }

    #[test]
    fn restored_pages_survive_sweeps() {
        let mut cache = PageCache::new();
        let (id, _) = cache.restore("t", "by_id", KeyRange::all(), vec![doc("a")]);
        assert!(cache.sweep().is_empty());
        let next = cache.ensure_range("u", "by_id", &KeyRange::all(), Direction::Asc, None);
        assert!(next.fetches[0].query_id > id);
        cache.release_holds();
        assert_eq!(cache.sweep().len(), 2);

        cache.restore("t", "by_id", KeyRange::all(), vec![doc("a")]);
        cache.resubscribe_all();
        assert_eq!(cache.sweep().len(), 1);
    }
}
