//! Per-connection query sets and transition computation.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use synclane_protocol::{
    Direction, KeyRange, PageRequest, PageResult, QueryId, QuerySetModification, SessionId,
    StateModification, Transition, Version,
};
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::resolver::{fetch_page, Identity, TableResolver};
use crate::table::MemoryTable;

/// A page query held by a connection.
#[derive(Debug, Clone)]
pub(crate) struct SessionQuery {
    request: PageRequest,
    /// Bounds of the first successful load. Later recomputations read the
    /// same range in full so page boundaries never drift.
    pinned: Option<KeyRange>,
    digest: Option<[u8; 32]>,
}

impl SessionQuery {
    fn new(request: PageRequest) -> Self {
        Self {
            request,
            pinned: None,
            digest: None,
        }
    }

    fn effective_request(&self) -> PageRequest {
        match &self.pinned {
            Some(range) => PageRequest {
                table: self.request.table.clone(),
                index: self.request.index.clone(),
                lower: range.lower.clone(),
                upper: range.upper.clone(),
                direction: Direction::Asc,
                limit: None,
            },
            None => self.request.clone(),
        }
    }
}

/// State of one open connection.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) identity: Identity,
    pub(crate) session: Option<SessionId>,
    query_set_version: u32,
    queries: BTreeMap<QueryId, SessionQuery>,
    removed: Vec<QueryId>,
    pub(crate) last_sent: Version,
}

impl Connection {
    pub(crate) fn new(identity: Identity) -> Self {
        Self {
            identity,
            session: None,
            query_set_version: 0,
            queries: BTreeMap::new(),
            removed: Vec::new(),
            last_sent: Version::ZERO,
        }
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Applies a query set change, validating its versions first. Nothing
    /// changes if any modification is invalid.
    pub(crate) fn modify_query_set(
        &mut self,
        base_version: u32,
        new_version: u32,
        modifications: Vec<QuerySetModification>,
        max_queries: usize,
    ) -> ServerResult<()> {
        if base_version != self.query_set_version {
            return Err(ServerError::QuerySetMismatch {
                expected: self.query_set_version,
                actual: base_version,
            });
        }
        if new_version <= base_version {
            return Err(ServerError::InvalidRequest(format!(
                "query set version must advance: {base_version} -> {new_version}"
            )));
        }

        let mut queries = self.queries.clone();
        let mut removed = self.removed.clone();
        for modification in modifications {
            match modification {
                QuerySetModification::Add(query) => {
                    if queries.contains_key(&query.query_id) {
                        return Err(ServerError::InvalidRequest(format!(
                            "duplicate query {}",
                            query.query_id
                        )));
                    }
                    removed.retain(|id| *id != query.query_id);
                    queries.insert(query.query_id, SessionQuery::new(query.request));
                }
                QuerySetModification::Remove { query_id } => {
                    if queries.remove(&query_id).is_none() {
                        return Err(ServerError::InvalidRequest(format!(
                            "unknown query {query_id}"
                        )));
                    }
                    removed.push(query_id);
                }
            }
        }
        if queries.len() > max_queries {
            return Err(ServerError::TooManyQueries {
                count: queries.len(),
                max: max_queries,
            });
        }

        self.queries = queries;
        self.removed = removed;
        self.query_set_version = new_version;
        Ok(())
    }

    /// Recomputes queries that are new or read a table in `changed`, and
    /// returns a transition to `current` if anything changed or the
    /// connection is behind.
    pub(crate) fn compute_transition(
        &mut self,
        tables: &BTreeMap<String, MemoryTable>,
        changed: &BTreeSet<String>,
        current: Version,
        batch_size: usize,
        max_page_size: u32,
    ) -> Option<Transition> {
        let mut modifications: Vec<StateModification> = self
            .removed
            .drain(..)
            .map(|query_id| StateModification::QueryRemoved { query_id })
            .collect();

        for (query_id, query) in &mut self.queries {
            if query.digest.is_some() && !changed.contains(&query.request.table) {
                continue;
            }
            let mut request = query.effective_request();
            request.limit = request.limit.map(|l| l.min(max_page_size));

            let result = tables
                .get(&request.table)
                .ok_or_else(|| ServerError::UnknownTable(request.table.clone()))
                .and_then(|table| {
                    fetch_page(table as &dyn TableResolver, &request, &self.identity, batch_size)
                })
                .map_err(|e| e.to_string());
            let (digest, result) = digest_result(result);
            if query.digest == Some(digest) {
                continue;
            }
            query.digest = Some(digest);

            match result {
                Ok(page) => {
                    if query.pinned.is_none() {
                        query.pinned = Some(page.range());
                    }
                    modifications.push(StateModification::QueryUpdated {
                        query_id: *query_id,
                        page,
                    });
                }
                Err(error) => {
                    debug!(query = %query_id, %error, "page query failed");
                    modifications.push(StateModification::QueryFailed {
                        query_id: *query_id,
                        error,
                    });
                }
            }
        }

        if modifications.is_empty() && self.last_sent >= current {
            return None;
        }
        let transition = Transition {
            start_version: self.last_sent,
            end_version: current,
            modifications,
        };
        self.last_sent = current;
        Some(transition)
    }
}

fn digest_result(result: Result<PageResult, String>) -> ([u8; 32], Result<PageResult, String>) {
    let mut hasher = Sha256::new();
    let result = match result {
        Ok(page) => match serde_json::to_vec(&page) {
            Ok(bytes) => {
                hasher.update([0u8]);
                hasher.update(&bytes);
                Ok(page)
            }
            Err(e) => Err(format!("page is not encodable: {e}")),
        },
        Err(error) => Err(error),
    };
    if let Err(error) = &result {
        hasher.update([1u8]);
        hasher.update(error.as_bytes());
    }
    (hasher.finalize().into(), result)
}
