//! Local persistence of pages and pending mutations.
//!
//! Persistence is advisory. The engine keeps working in memory when a
//! write fails, so a broken store never blocks reads or mutations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synclane_protocol::{Bound, MutationId, PageDocument, QueryId, SessionId, Version};
use synclane_value::{from_cbor, to_cbor, Value};

use crate::error::{SyncError, SyncResult};

/// A mutation that has not been confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMutation {
    /// Session the mutation id belongs to.
    pub session_id: SessionId,
    /// Mutation id.
    pub mutation_id: MutationId,
    /// Server mutation name.
    pub name: String,
    /// Arguments for the optimistic update.
    pub optimistic_args: Value,
    /// Arguments sent to the server.
    pub server_args: Value,
}

/// A loaded page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPage {
    /// Page id.
    pub query_id: QueryId,
    /// Table name.
    pub table: String,
    /// Index name.
    pub index: String,
    /// Inclusive lower cut.
    pub lower: Bound,
    /// Exclusive upper cut.
    pub upper: Bound,
    /// Documents in ascending key order.
    pub documents: Vec<PageDocument>,
}

/// Everything a store holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    /// Version the pages were current at.
    pub version: Version,
    /// Loaded pages.
    pub pages: Vec<PersistedPage>,
    /// Unconfirmed mutations in id order.
    pub mutations: Vec<PersistedMutation>,
}

/// Storage for the engine's durable state.
pub trait LocalPersistence: Send + Sync {
    /// Stores a pending mutation, or deletes it when `mutation` is `None`.
    fn persist_mutation(
        &self,
        id: MutationId,
        mutation: Option<&PersistedMutation>,
    ) -> SyncResult<()>;

    /// Replaces the stored pages.
    fn persist_pages(&self, version: Version, pages: &[PersistedPage]) -> SyncResult<()>;

    /// Reads everything back.
    fn load(&self) -> SyncResult<PersistedState>;
}

/// Persistence that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

impl LocalPersistence for NoopPersistence {
    fn persist_mutation(&self, _: MutationId, _: Option<&PersistedMutation>) -> SyncResult<()> {
        Ok(())
    }

    fn persist_pages(&self, _: Version, _: &[PersistedPage]) -> SyncResult<()> {
        Ok(())
    }

    fn load(&self) -> SyncResult<PersistedState> {
        Ok(PersistedState::default())
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    mutations: BTreeMap<MutationId, Vec<u8>>,
    pages: Option<Vec<u8>>,
}

/// CBOR-encoded in-memory store. Clones share the same store, so a new
/// engine can reload what an earlier one wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    store: Arc<Mutex<MemoryStore>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored mutations.
    pub fn mutation_count(&self) -> usize {
        self.store.lock().mutations.len()
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Persistence("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl LocalPersistence for MemoryPersistence {
    fn persist_mutation(
        &self,
        id: MutationId,
        mutation: Option<&PersistedMutation>,
    ) -> SyncResult<()> {
        self.check()?;
        let mut store = self.store.lock();
        match mutation {
            Some(m) => {
                store.mutations.insert(id, to_cbor(m)?);
            }
            None => {
                store.mutations.remove(&id);
            }
        }
        Ok(())
    }

    fn persist_pages(&self, version: Version, pages: &[PersistedPage]) -> SyncResult<()> {
        self.check()?;
        let bytes = to_cbor(&(version, pages))?;
        self.store.lock().pages = Some(bytes);
        Ok(())
    }

    fn load(&self) -> SyncResult<PersistedState> {
        let store = self.store.lock();
        let (version, pages) = match &store.pages {
            Some(bytes) => from_cbor::<(Version, Vec<PersistedPage>)>(bytes)?,
            None => (Version::ZERO, Vec::new()),
        };
        let mutations = store
            .mutations
            .values()
            .map(|bytes| from_cbor::<PersistedMutation>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PersistedState {
            version,
            pages,
            mutations,
        })
    }
}
