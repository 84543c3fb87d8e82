//! The index streaming contract between tables and the page loop.
//!
//! A table exposes a point loader that is checked against the caller's
//! identity on every access, plus named indexes that stream document ids
//! in key order. Indexes are restartable cursors: each call to
//! [`IndexCursor::next_batch`] takes the remaining range and returns a
//! continuation bound, so the page loop can stop at any point and a later
//! request can resume from the page boundary.

use synclane_protocol::{
    Bound, Direction, Document, DocumentId, IndexDefinition, IndexKey, KeyRange, PageDocument,
    PageRequest, PageResult,
};
use tracing::debug;

use crate::error::{ServerError, ServerResult};

/// Who is reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Identity {
    /// Unauthenticated caller.
    #[default]
    Anonymous,
    /// Authenticated user.
    User(String),
}

/// One batch pulled from an index cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexBatch {
    /// Keys and ids in scan order.
    pub items: Vec<(IndexKey, DocumentId)>,
    /// Where to resume, or `None` when the range is exhausted.
    ///
    /// Ascending scans resume from this lower bound, descending scans
    /// from this upper bound.
    pub next_bound: Option<Bound>,
}

/// A restartable cursor over one index.
pub trait IndexCursor: Send + Sync {
    /// The index being scanned.
    fn definition(&self) -> &IndexDefinition;

    /// Returns up to `limit` entries of `range` in `direction` order.
    ///
    /// Entries must be strictly ordered by key and must include every
    /// document of the range the point loader would authorize.
    fn next_batch(
        &self,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> ServerResult<IndexBatch>;
}

/// A table as seen by the page loop.
pub trait TableResolver: Send + Sync {
    /// Table name.
    fn name(&self) -> &str;

    /// Loads a document for `identity`.
    ///
    /// `Ok(None)` means the document does not exist or is invisible to the
    /// caller and is skipped. `Err(NotAuthorized)` fails the whole page.
    fn get(&self, id: &DocumentId, identity: &Identity) -> ServerResult<Option<Document>>;

    /// Looks up an index cursor by name.
    fn index(&self, name: &str) -> Option<&dyn IndexCursor>;

    /// Definitions of every index on this table.
    fn index_definitions(&self) -> Vec<IndexDefinition>;
}

/// Materializes one page by pulling batches from the index until `limit`
/// authorized documents have been collected or the range is exhausted.
///
/// When the limit cuts the scan short, the page ends just after the last
/// returned key (`Successor` for ascending, `Exact` for descending), so the
/// next page can start exactly where this one stopped. Documents are
/// returned in ascending key order.
pub fn fetch_page(
    table: &dyn TableResolver,
    request: &PageRequest,
    identity: &Identity,
    batch_size: usize,
) -> ServerResult<PageResult> {
    let index = table
        .index(&request.index)
        .ok_or_else(|| ServerError::UnknownIndex {
            table: table.name().to_string(),
            index: request.index.clone(),
        })?;

    let limit = request.limit.map(|l| l as usize);
    let mut remaining = request.range();
    let mut documents: Vec<PageDocument> = Vec::new();
    let mut exhausted = false;
    let mut batches = 0usize;

    'scan: while !remaining.is_empty() {
        if limit.is_some_and(|l| documents.len() >= l) {
            break;
        }
        let batch = index.next_batch(&remaining, request.direction, batch_size.max(1))?;
        batches += 1;

        let total = batch.items.len();
        for (position, (key, id)) in batch.items.into_iter().enumerate() {
            if let Some(document) = table.get(&id, identity)? {
                documents.push(PageDocument { key, document });
            }
            if limit.is_some_and(|l| documents.len() >= l) {
                exhausted = position + 1 == total && batch.next_bound.is_none();
                break 'scan;
            }
        }

        match batch.next_bound {
            Some(bound) => match request.direction {
                Direction::Asc => remaining.lower = bound,
                Direction::Desc => remaining.upper = bound,
            },
            None => {
                exhausted = true;
                break;
            }
        }
    }
    if remaining.is_empty() {
        exhausted = true;
    }

    let (mut lower, mut upper) = (request.lower.clone(), request.upper.clone());
    if !exhausted {
        if let Some(last) = documents.last() {
            match request.direction {
                Direction::Asc => upper = Bound::Successor(last.key.clone()),
                Direction::Desc => lower = Bound::Exact(last.key.clone()),
            }
        }
    }
    if request.direction == Direction::Desc {
        documents.reverse();
    }

    debug!(
        table = table.name(),
        index = %request.index,
        documents = documents.len(),
        batches,
        exhausted,
        "fetched page"
    );

    Ok(PageResult {
        documents,
        lower,
        upper,
    })
}
