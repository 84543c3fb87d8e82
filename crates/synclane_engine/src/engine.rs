//! The sync engine state machine.
//!
//! Every public call is one step: it mutates the page cache, overlay and
//! mutation table, re-evaluates the subscriptions that became dirty, sends
//! at most one query set change, and finally drains the outbox of
//! subscription events. Callbacks therefore observe a consistent state and
//! never a half-applied transition.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use synclane_protocol::{
    ClientMessage, KeyRange, MutationId, MutationOutcome, PageQuery, QuerySetModification,
    ServerMessage, SessionId, StateModification, Transition, Version,
};
use synclane_value::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{MutationError, SyncError, SyncResult};
use crate::functions::{FunctionRegistry, MutationSpec, SyncQuery, SyncQueryResult};
use crate::network::NetworkState;
use crate::overlay::{Overlay, OverlayEntry};
use crate::page_cache::{CacheChange, PageCache, PageId};
use crate::persistence::{LocalPersistence, NoopPersistence, PersistedMutation, PersistedPage};
use crate::reader::LocalDbReader;
use crate::schema::LocalSchema;
use crate::transport::{IncomingMessage, Transport};

/// Identifies a subscription within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Called with every new result of a subscription.
pub type UpdateCallback = Box<dyn FnMut(&SyncQueryResult) + Send>;

/// A subscription result change, delivered at the end of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    /// The subscription.
    pub subscription: SubscriptionId,
    /// Its new result.
    pub result: SyncQueryResult,
}

/// Where a mutation stands with respect to the local mirror and the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Neither the optimistic update nor the server has taken effect.
    Unresolved,
    /// The optimistic update is visible; the server has not answered.
    ReflectedLocallyButWaitingForNetwork,
    /// The server committed the mutation at a version the mirror has not
    /// reached yet.
    ReflectedOnNetworkButNotLocally,
    /// The mirror includes the committed effect and the overlay entry is
    /// gone.
    Reflected,
}

/// A submitted mutation.
#[derive(Debug)]
pub struct MutationHandle {
    /// Client-assigned mutation id.
    pub mutation_id: MutationId,
    /// Resolves with the server's return value or rejection.
    pub result: oneshot::Receiver<Result<Value, MutationError>>,
}

struct Subscription {
    query: SyncQuery,
    args: Value,
    dependencies: BTreeSet<PageId>,
    result: SyncQueryResult,
    delivered: bool,
    dirty: bool,
    callback: Option<UpdateCallback>,
}

struct PendingMutation {
    name: String,
    optimistic_args: Value,
    server_args: Value,
    status: MutationStatus,
    commit_version: Option<Version>,
    sender: Option<oneshot::Sender<Result<Value, MutationError>>>,
}

/// The client sync engine.
pub struct SyncEngine<T: Transport, P: LocalPersistence = NoopPersistence> {
    config: EngineConfig,
    schema: LocalSchema,
    transport: Arc<T>,
    persistence: P,
    persistence_active: bool,
    session_id: SessionId,
    cache: PageCache,
    overlay: Overlay,
    overlay_stale: bool,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_subscription: u64,
    mutations: BTreeMap<MutationId, PendingMutation>,
    reflected: VecDeque<MutationId>,
    next_mutation: u64,
    next_creation_time: i64,
    network: NetworkState,
    query_set_changes: Vec<QuerySetModification>,
    pages_changed: bool,
    outbox: Vec<SubscriptionEvent>,
    events: Vec<SubscriptionEvent>,
}

impl<T: Transport> SyncEngine<T> {
    /// Creates an engine without persistence.
    pub fn new(config: EngineConfig, schema: LocalSchema, transport: Arc<T>) -> Self {
        Self::with_persistence(config, schema, transport, NoopPersistence)
    }
}

impl<T: Transport, P: LocalPersistence> SyncEngine<T, P> {
    /// Creates an engine that writes pages and pending mutations to
    /// `persistence`.
    pub fn with_persistence(
        config: EngineConfig,
        schema: LocalSchema,
        transport: Arc<T>,
        persistence: P,
    ) -> Self {
        let network = NetworkState::new(config.max_buffered_transitions);
        Self {
            persistence_active: config.persistence_enabled,
            config,
            schema,
            transport,
            persistence,
            session_id: SessionId::generate(),
            cache: PageCache::new(),
            overlay: Overlay::new(),
            overlay_stale: false,
            subscriptions: BTreeMap::new(),
            next_subscription: 0,
            mutations: BTreeMap::new(),
            reflected: VecDeque::new(),
            next_mutation: 0,
            next_creation_time: 0,
            network,
            query_set_changes: Vec::new(),
            pages_changed: false,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Session id sent on every connect.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns true while the engine believes it is connected.
    pub fn is_connected(&self) -> bool {
        self.network.connected
    }

    /// Highest server version applied so far, across reconnects.
    pub fn max_observed_version(&self) -> Version {
        self.network.max_observed
    }

    /// Returns true while local writes are persisted.
    pub fn persistence_active(&self) -> bool {
        self.persistence_active
    }

    /// The page cache, for inspection.
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Number of mutations the server has not yet reflected.
    pub fn pending_mutations(&self) -> usize {
        self.mutations.len()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribes to a sync query. `on_update` runs at the end of every step
    /// that changes the result, starting with the step that adds it.
    pub fn add_sync_query<F>(
        &mut self,
        query: &SyncQuery,
        args: Value,
        on_update: F,
    ) -> SubscriptionId
    where
        F: FnMut(&SyncQueryResult) + Send + 'static,
    {
        self.subscribe(query, args, Some(Box::new(on_update)))
    }

    /// Subscribes to a sync query whose updates are collected by
    /// [`SyncEngine::take_events`] instead of a callback.
    pub fn watch(&mut self, query: &SyncQuery, args: Value) -> SubscriptionId {
        self.subscribe(query, args, None)
    }

    fn subscribe(
        &mut self,
        query: &SyncQuery,
        args: Value,
        callback: Option<UpdateCallback>,
    ) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        debug!(subscription = %id, query = query.name(), "adding sync query");
        self.subscriptions.insert(
            id,
            Subscription {
                query: query.clone(),
                args,
                dependencies: BTreeSet::new(),
                result: SyncQueryResult::Loading,
                delivered: false,
                dirty: true,
                callback,
            },
        );
        self.finish_step(true);
        id
    }

    /// Removes a subscription. No callback runs for it afterwards; pages no
    /// other subscription needs are evicted.
    pub fn remove_sync_query(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.remove(&id) else {
            return false;
        };
        debug!(subscription = %id, "removing sync query");
        self.cache.release(&sub.dependencies);
        self.outbox.retain(|e| e.subscription != id);
        self.finish_step(true);
        true
    }

    /// Current result of a subscription.
    pub fn sync_query_result(&self, id: SubscriptionId) -> Option<&SyncQueryResult> {
        self.subscriptions.get(&id).map(|s| &s.result)
    }

    /// Drains events of subscriptions added with [`SyncEngine::watch`].
    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Submits a mutation. The optimistic update, if any, is visible to
    /// every subscription when this returns.
    pub fn submit_mutation(
        &mut self,
        spec: &MutationSpec,
        optimistic_args: Value,
        server_args: Value,
    ) -> MutationHandle {
        self.next_mutation += 1;
        let mutation_id = MutationId(self.next_mutation);
        let (sender, result) = oneshot::channel();
        debug!(mutation = %mutation_id, name = spec.name(), "submitting mutation");

        let status = self.apply_optimistic(mutation_id, spec, &optimistic_args);
        self.mutations.insert(
            mutation_id,
            PendingMutation {
                name: spec.name().to_string(),
                optimistic_args,
                server_args: server_args.clone(),
                status,
                commit_version: None,
                sender: Some(sender),
            },
        );
        self.persist_mutation(mutation_id);
        self.send(ClientMessage::Mutation {
            mutation_id,
            name: spec.name().to_string(),
            args: server_args,
        });
        self.finish_step(true);
        MutationHandle {
            mutation_id,
            result,
        }
    }

    /// Status of a mutation. `None` for unknown ids, rejected mutations
    /// and reflected mutations older than the configured history.
    pub fn mutation_status(&self, id: MutationId) -> Option<MutationStatus> {
        if let Some(m) = self.mutations.get(&id) {
            return Some(m.status);
        }
        self.reflected
            .contains(&id)
            .then_some(MutationStatus::Reflected)
    }

    fn apply_optimistic(
        &mut self,
        mutation_id: MutationId,
        spec: &MutationSpec,
        args: &Value,
    ) -> MutationStatus {
        let Some(optimistic) = spec.optimistic() else {
            return MutationStatus::Unresolved;
        };
        let floor = creation_floor(self.network.max_observed).unwrap_or(self.next_creation_time);
        let creation_base = self.next_creation_time.max(floor);
        let entry = OverlayEntry {
            mutation_id,
            name: spec.name().to_string(),
            optimistic: Arc::clone(optimistic),
            args: args.clone(),
            creation_base,
        };
        match self.overlay.push(entry, &self.cache, &self.schema) {
            Some(next_time) => {
                self.next_creation_time = next_time;
                self.mark_all_dirty();
                MutationStatus::ReflectedLocallyButWaitingForNetwork
            }
            None => {
                self.next_creation_time = creation_base.saturating_add(1);
                MutationStatus::Unresolved
            }
        }
    }

    fn on_mutation_response(&mut self, mutation_id: MutationId, outcome: MutationOutcome) {
        let Some(mutation) = self.mutations.get_mut(&mutation_id) else {
            debug!(mutation = %mutation_id, "response for unknown mutation");
            return;
        };
        match outcome {
            MutationOutcome::Success {
                value,
                commit_version,
            } => {
                debug!(mutation = %mutation_id, commit = %commit_version, "mutation committed");
                if let Some(sender) = mutation.sender.take() {
                    let _ = sender.send(Ok(value));
                }
                mutation.commit_version = Some(commit_version);
                if self.network.last_applied >= commit_version {
                    self.reflect(mutation_id);
                } else {
                    mutation.status = MutationStatus::ReflectedOnNetworkButNotLocally;
                }
            }
            MutationOutcome::Failure { error } => {
                info!(mutation = %mutation_id, %error, "mutation rejected");
                if let Some(mut mutation) = self.mutations.remove(&mutation_id) {
                    if let Some(sender) = mutation.sender.take() {
                        let _ = sender.send(Err(MutationError::Rejected(error)));
                    }
                }
                if self.overlay.retire(mutation_id) {
                    self.overlay_stale = true;
                }
                self.unpersist_mutation(mutation_id);
            }
        }
    }

    /// Retires a committed mutation whose version the mirror has reached.
    fn reflect(&mut self, mutation_id: MutationId) {
        if self.mutations.remove(&mutation_id).is_none() {
            return;
        }
        debug!(mutation = %mutation_id, "mutation reflected");
        if self.overlay.retire(mutation_id) {
            self.overlay_stale = true;
        }
        self.reflected.push_back(mutation_id);
        while self.reflected.len() > self.config.reflected_history {
            self.reflected.pop_front();
        }
        self.unpersist_mutation(mutation_id);
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    /// Processes one event from the transport.
    pub fn receive(&mut self, incoming: IncomingMessage) {
        match incoming {
            IncomingMessage::Connected => self.on_connected(),
            IncomingMessage::Closed => {
                info!("connection closed");
                self.network.disconnect();
                self.query_set_changes.clear();
            }
            IncomingMessage::Message(_) if !self.network.connected => {
                debug!("dropping message from a closed connection");
            }
            IncomingMessage::Message(ServerMessage::Transition(transition)) => {
                self.on_transition(transition)
            }
            IncomingMessage::Message(ServerMessage::MutationResponse {
                mutation_id,
                outcome,
            }) => self.on_mutation_response(mutation_id, outcome),
            IncomingMessage::Message(ServerMessage::FatalError { message }) => {
                self.protocol_error(SyncError::Protocol(format!("server error: {message}")))
            }
        }
        self.finish_step(true);
    }

    /// Starts over on a fresh connection: every page becomes a new
    /// subscription and every unanswered mutation is sent again.
    fn on_connected(&mut self) {
        self.network.connect();
        self.query_set_changes.clear();
        self.send(ClientMessage::Connect {
            session_id: self.session_id,
            max_observed_version: self.network.max_observed,
        });

        let resubscribed = self.cache.resubscribe_all();
        info!(
            pages = resubscribed.len(),
            mutations = self.mutations.len(),
            "connected; resubscribing"
        );
        self.query_set_changes
            .extend(resubscribed.into_iter().map(QuerySetModification::Add));
        self.overlay_stale = true;
        self.mark_all_dirty();

        let unanswered: Vec<ClientMessage> = self
            .mutations
            .iter()
            .filter(|(_, m)| m.commit_version.is_none())
            .map(|(id, m)| ClientMessage::Mutation {
                mutation_id: *id,
                name: m.name.clone(),
                args: m.server_args.clone(),
            })
            .collect();
        for message in unanswered {
            self.send(message);
        }
    }

    fn on_transition(&mut self, transition: Transition) {
        match self.network.accept(transition) {
            Ok(ready) => {
                for transition in ready {
                    self.apply_transition(transition);
                }
            }
            Err(reason) => self.protocol_error(SyncError::Protocol(reason)),
        }
    }

    fn apply_transition(&mut self, transition: Transition) {
        debug!(
            start = %transition.start_version,
            end = %transition.end_version,
            modifications = transition.modifications.len(),
            "applying transition"
        );
        for modification in transition.modifications {
            match modification {
                StateModification::QueryUpdated { query_id, page } => {
                    let change = self.cache.apply_loaded(query_id, page);
                    self.absorb(change);
                }
                StateModification::QueryFailed { query_id, error } => {
                    debug!(page = %query_id, %error, "page failed");
                    if self.cache.fail(query_id, error) {
                        self.mark_dependents(&[query_id]);
                    }
                }
                StateModification::QueryRemoved { .. } => {}
            }
        }
        self.cache.release_holds();
        self.pages_changed = true;
        self.overlay_stale = true;

        let reached: Vec<MutationId> = self
            .mutations
            .iter()
            .filter(|(_, m)| m.commit_version.is_some_and(|v| v <= transition.end_version))
            .map(|(id, _)| *id)
            .collect();
        for id in reached {
            self.reflect(id);
        }
    }

    fn absorb(&mut self, change: CacheChange) {
        self.mark_dependents(&change.changed);
        self.query_set_changes.extend(
            change
                .removed
                .into_iter()
                .map(|query_id| QuerySetModification::Remove { query_id }),
        );
        self.query_set_changes
            .extend(change.added.into_iter().map(QuerySetModification::Add));
    }

    /// The stream cannot be repaired in place; ask for a new connection and
    /// resubscribe when it opens.
    fn protocol_error(&mut self, error: SyncError) {
        warn!(%error, "reconnecting");
        self.network.disconnect();
        self.query_set_changes.clear();
        self.transport.reconnect();
    }

    fn send(&mut self, message: ClientMessage) {
        if !self.network.connected {
            return;
        }
        if let Err(error) = self.transport.send(message) {
            warn!(%error, "send failed; waiting for reconnect");
            self.network.disconnect();
            self.query_set_changes.clear();
            if !error.is_retryable() {
                self.transport.reconnect();
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Restores pages and unconfirmed mutations written by an earlier
    /// engine. Restored mutations are re-applied optimistically with the
    /// specs in `registry` and resent on the next connect. Call before the
    /// first `Connected` so resent mutations keep their original session.
    pub fn ingest_from_local_persistence(
        &mut self,
        registry: &FunctionRegistry,
    ) -> SyncResult<()> {
        if !self.persistence_active {
            return Ok(());
        }
        let state = match self.persistence.load() {
            Ok(state) => state,
            Err(error) => {
                self.disable_persistence(&error);
                return Err(error);
            }
        };
        info!(
            version = %state.version,
            pages = state.pages.len(),
            mutations = state.mutations.len(),
            "ingesting local persistence"
        );

        for page in state.pages {
            let range = KeyRange::new(page.lower, page.upper);
            let (id, change) = self.cache.restore(&page.table, &page.index, range, page.documents);
            self.absorb(change);
            if let Some(page) = self.cache.get(id) {
                let request = page.resubscribe_request();
                self.query_set_changes
                    .push(QuerySetModification::Add(PageQuery { query_id: id, request }));
            }
        }

        if self.mutations.is_empty() && self.next_mutation == 0 {
            if let Some(first) = state.mutations.first() {
                self.session_id = first.session_id;
            }
        }
        for persisted in state.mutations {
            let id = persisted.mutation_id;
            if self.mutations.contains_key(&id) {
                continue;
            }
            self.next_mutation = self.next_mutation.max(id.0);
            let status = match registry.mutation(&persisted.name) {
                Some(spec) => self.apply_optimistic(id, spec, &persisted.optimistic_args),
                None => {
                    warn!(mutation = %id, name = %persisted.name, "no spec for persisted mutation");
                    MutationStatus::Unresolved
                }
            };
            self.mutations.insert(
                id,
                PendingMutation {
                    name: persisted.name.clone(),
                    optimistic_args: persisted.optimistic_args,
                    server_args: persisted.server_args.clone(),
                    status,
                    commit_version: None,
                    sender: None,
                },
            );
            self.send(ClientMessage::Mutation {
                mutation_id: id,
                name: persisted.name,
                args: persisted.server_args,
            });
        }
        self.mark_all_dirty();
        self.finish_step(false);
        Ok(())
    }

    fn disable_persistence(&mut self, error: &SyncError) {
        warn!(%error, "persistence failed; continuing in memory only");
        self.persistence_active = false;
    }

    fn persist_mutation(&mut self, id: MutationId) {
        if !self.persistence_active {
            return;
        }
        let Some(m) = self.mutations.get(&id) else {
            return;
        };
        let record = PersistedMutation {
            session_id: self.session_id,
            mutation_id: id,
            name: m.name.clone(),
            optimistic_args: m.optimistic_args.clone(),
            server_args: m.server_args.clone(),
        };
        if let Err(error) = self.persistence.persist_mutation(id, Some(&record)) {
            self.disable_persistence(&error);
        }
    }

    fn unpersist_mutation(&mut self, id: MutationId) {
        if !self.persistence_active {
            return;
        }
        if let Err(error) = self.persistence.persist_mutation(id, None) {
            self.disable_persistence(&error);
        }
    }

    fn persist_pages(&mut self) {
        if !self.persistence_active {
            return;
        }
        let pages: Vec<PersistedPage> = self
            .cache
            .iter()
            .filter(|p| p.is_loaded())
            .map(|p| PersistedPage {
                query_id: p.id,
                table: p.table.clone(),
                index: p.index.clone(),
                lower: p.range.lower.clone(),
                upper: p.range.upper.clone(),
                documents: p.documents().to_vec(),
            })
            .collect();
        if let Err(error) = self
            .persistence
            .persist_pages(self.network.last_applied, &pages)
        {
            self.disable_persistence(&error);
        }
    }

    // ------------------------------------------------------------------
    // Step
    // ------------------------------------------------------------------

    fn mark_all_dirty(&mut self) {
        for sub in self.subscriptions.values_mut() {
            sub.dirty = true;
        }
    }

    fn mark_dependents(&mut self, pages: &[PageId]) {
        for sub in self.subscriptions.values_mut() {
            if pages.iter().any(|p| sub.dependencies.contains(p)) {
                sub.dirty = true;
            }
        }
    }

    fn evaluate(&mut self, id: SubscriptionId) {
        let Some(sub) = self.subscriptions.get(&id) else {
            return;
        };
        let mut reader = LocalDbReader::new(
            &self.cache,
            &self.schema,
            Cow::Borrowed(self.overlay.view()),
            Some(self.config.page_size),
        );
        let result = SyncQueryResult::from(sub.query.run(&mut reader, &sub.args));
        let (mut dependencies, request) = reader.into_parts();

        if let Some(request) = request {
            let coverage = self.cache.ensure_range(
                &request.table,
                &request.index,
                &request.range(),
                request.direction,
                request.limit,
            );
            dependencies.extend(coverage.pages);
            for fetch in coverage.fetches {
                dependencies.insert(fetch.query_id);
                self.query_set_changes.push(QuerySetModification::Add(fetch));
            }
        }

        self.cache.retain(&dependencies);
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut sub.dependencies, dependencies);
        self.cache.release(&previous);
        sub.dirty = false;
        if !sub.delivered || sub.result != result {
            sub.delivered = true;
            sub.result = result.clone();
            self.outbox.push(SubscriptionEvent {
                subscription: id,
                result,
            });
        }
    }

    fn finish_step(&mut self, evict: bool) {
        if self.overlay_stale {
            let before = self.overlay.view().clone();
            let applied = self.overlay.replay(&self.cache, &self.schema);
            if *self.overlay.view() != before {
                self.mark_all_dirty();
            }
            self.overlay_stale = false;
            // An entry that first failed on a loading range may apply now.
            for id in applied {
                if let Some(m) = self.mutations.get_mut(&id) {
                    if m.status == MutationStatus::Unresolved {
                        m.status = MutationStatus::ReflectedLocallyButWaitingForNetwork;
                    }
                }
            }
        }

        let dirty: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            self.evaluate(id);
        }

        if evict {
            for query_id in self.cache.sweep() {
                let pending_add = self.query_set_changes.iter().position(
                    |m| matches!(m, QuerySetModification::Add(q) if q.query_id == query_id),
                );
                match pending_add {
                    Some(pos) => {
                        self.query_set_changes.remove(pos);
                    }
                    None => self
                        .query_set_changes
                        .push(QuerySetModification::Remove { query_id }),
                }
            }
        }

        self.flush_query_set();
        if self.pages_changed {
            self.persist_pages();
            self.pages_changed = false;
        }

        for event in std::mem::take(&mut self.outbox) {
            let Some(sub) = self.subscriptions.get_mut(&event.subscription) else {
                continue;
            };
            match sub.callback.as_mut() {
                Some(callback) => callback(&event.result),
                None => self.events.push(event),
            }
        }

        debug_assert!(
            self.check_invariants().is_ok(),
            "{:?}",
            self.check_invariants()
        );
    }

    fn flush_query_set(&mut self) {
        if self.query_set_changes.is_empty() {
            return;
        }
        let modifications = std::mem::take(&mut self.query_set_changes);
        if !self.network.connected {
            return;
        }
        let base_version = self.network.query_set_version;
        let new_version = base_version + 1;
        debug!(base_version, changes = modifications.len(), "modifying query set");
        self.network.query_set_version = new_version;
        self.send(ClientMessage::ModifyQuerySet {
            base_version,
            new_version,
            modifications,
        });
    }

    /// Verifies the engine's internal invariants: loaded pages never
    /// overlap, reference counts match subscription dependencies, and every
    /// overlay entry belongs to a pending mutation.
    pub fn check_invariants(&self) -> SyncResult<()> {
        self.cache.check_invariants().map_err(SyncError::Invariant)?;

        let mut counts: BTreeMap<PageId, usize> = BTreeMap::new();
        for (id, sub) in &self.subscriptions {
            for page in &sub.dependencies {
                if self.cache.get(*page).is_none() {
                    return Err(SyncError::Invariant(format!(
                        "subscription {id} depends on missing page {page}"
                    )));
                }
                *counts.entry(*page).or_insert(0) += 1;
            }
        }
        for page in self.cache.iter() {
            let expected = counts.get(&page.id).copied().unwrap_or(0);
            if self.cache.ref_count(page.id) != expected {
                return Err(SyncError::Invariant(format!(
                    "page {} has {} references, expected {expected}",
                    page.id,
                    self.cache.ref_count(page.id)
                )));
            }
        }

        if let Some(orphan) = self
            .overlay
            .mutation_ids()
            .find(|id| !self.mutations.contains_key(id))
        {
            return Err(SyncError::Invariant(format!(
                "overlay entry {orphan} has no pending mutation"
            )));
        }
        Ok(())
    }
}

/// Lowest creation time not yet handed out by a server at `version`.
/// `None` when the server's scheme would overflow.
fn creation_floor(version: Version) -> Option<i64> {
    i64::try_from(version.0)
        .ok()
        .and_then(|v| v.checked_add(1)?.checked_mul(1000))
}
