//! Reference sync server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use synclane_protocol::{
    ClientMessage, Document, MutationId, MutationOutcome, ServerMessage, SessionId, Transition,
    Version,
};
use synclane_value::Value;
use tracing::{debug, info, warn};

use crate::commit_log::CommitLog;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::resolver::{Identity, TableResolver};
use crate::session::Connection;
use crate::table::MemoryTable;
use crate::writer::{ServerMutation, ServerWriter};

/// Identifies one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Mutation outcomes remembered per client session, so a mutation resent
/// after a reconnect is answered without running it again.
#[derive(Debug, Default)]
struct SessionRecord {
    outcomes: BTreeMap<MutationId, MutationOutcome>,
}

struct ServerState {
    tables: BTreeMap<String, MemoryTable>,
    log: CommitLog,
    connections: HashMap<ConnectionId, Connection>,
    sessions: HashMap<SessionId, SessionRecord>,
    mutations: HashMap<String, ServerMutation>,
    next_connection: u64,
    next_document: u64,
}

/// The sync server.
///
/// Each connection owns a query set of page requests. Whenever the server
/// version advances, [`SyncServer::poll_transition`] recomputes the pages a
/// connection subscribes to and returns a transition covering
/// `[last sent version, current version)` with only the pages whose
/// contents changed.
///
/// # Example
///
/// ```
/// use synclane_server::{Identity, MemoryTable, ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// server.add_table(MemoryTable::new("notes", vec![]));
/// let conn = server.connect(Identity::Anonymous);
/// assert_eq!(server.connection_count(), 1);
/// server.disconnect(conn);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    state: RwLock<ServerState>,
}

impl SyncServer {
    /// Creates a server with no tables at version 1.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ServerState {
                tables: BTreeMap::new(),
                log: CommitLog::new(Version(1)),
                connections: HashMap::new(),
                sessions: HashMap::new(),
                mutations: HashMap::new(),
                next_connection: 0,
                next_document: 0,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Adds or replaces a table.
    pub fn add_table(&self, table: MemoryTable) {
        let name = table.name().to_string();
        self.state.write().tables.insert(name, table);
    }

    /// Registers a named mutation.
    pub fn register_mutation<F>(&self, name: impl Into<String>, mutation: F)
    where
        F: Fn(&mut ServerWriter<'_>, &Value, &Identity) -> Result<Value, String>
            + Send
            + Sync
            + 'static,
    {
        self.state
            .write()
            .mutations
            .insert(name.into(), Arc::new(mutation));
    }

    /// The latest committed version.
    pub fn version(&self) -> Version {
        self.state.read().log.current()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Snapshot of a table's documents in id order.
    pub fn documents(&self, table: &str) -> ServerResult<Vec<Document>> {
        let state = self.state.read();
        let table = state
            .tables
            .get(table)
            .ok_or_else(|| ServerError::UnknownTable(table.to_string()))?;
        Ok(table.documents().cloned().collect())
    }

    /// Opens a connection for `identity`.
    pub fn connect(&self, identity: Identity) -> ConnectionId {
        let mut state = self.state.write();
        state.next_connection += 1;
        let id = ConnectionId(state.next_connection);
        state.connections.insert(id, Connection::new(identity));
        debug!(connection = id.0, "connection opened");
        id
    }

    /// Closes a connection. Session mutation records survive.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.state.write();
        if state.connections.remove(&connection).is_some() {
            debug!(connection = connection.0, "connection closed");
            compact_log(&mut state);
        }
    }

    /// Commits a write outside of any client mutation, as another writer
    /// of the same deployment would.
    pub fn write<F>(&self, write: F) -> ServerResult<Version>
    where
        F: FnOnce(&mut ServerWriter<'_>) -> ServerResult<()>,
    {
        let mut state = self.state.write();
        let mut tables = state.tables.clone();
        let mut next_document = state.next_document;
        let base_time = creation_base(state.log.current());
        let mut writer = ServerWriter::new(&mut tables, &mut next_document, base_time);
        write(&mut writer)?;
        let touched = writer.into_touched();

        state.tables = tables;
        state.next_document = next_document;
        Ok(state.log.append(touched))
    }

    /// Handles one client message and returns the replies for this
    /// connection. Client errors are answered with a `FatalError` message.
    pub fn handle_message(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> ServerResult<Vec<ServerMessage>> {
        let mut state = self.state.write();
        match self.dispatch(&mut state, connection, message) {
            Err(e) if e.is_client_error() => {
                warn!(connection = connection.0, error = %e, "rejecting client");
                Ok(vec![ServerMessage::FatalError {
                    message: e.to_string(),
                }])
            }
            other => other,
        }
    }

    /// Returns the next transition for a connection, if its pages changed
    /// or the server version moved past what it has seen.
    pub fn poll_transition(&self, connection: ConnectionId) -> ServerResult<Option<ServerMessage>> {
        let mut state = self.state.write();
        Ok(self
            .transition_for(&mut state, connection)?
            .map(ServerMessage::Transition))
    }

    fn dispatch(
        &self,
        state: &mut ServerState,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> ServerResult<Vec<ServerMessage>> {
        let current = state.log.current();
        let conn = state
            .connections
            .get_mut(&connection)
            .ok_or(ServerError::UnknownConnection(connection.0))?;

        match message {
            ClientMessage::Connect {
                session_id,
                max_observed_version,
            } => {
                if conn.session.is_some() {
                    return Err(ServerError::InvalidRequest("already connected".into()));
                }
                if max_observed_version > current {
                    return Err(ServerError::ClientAhead {
                        observed: max_observed_version,
                        current,
                    });
                }
                conn.session = Some(session_id);
                state.sessions.entry(session_id).or_default();
                info!(connection = connection.0, session = %session_id, "client connected");
                Ok(Vec::new())
            }
            ClientMessage::ModifyQuerySet {
                base_version,
                new_version,
                modifications,
            } => {
                if conn.session.is_none() {
                    return Err(ServerError::InvalidRequest("connect first".into()));
                }
                conn.modify_query_set(
                    base_version,
                    new_version,
                    modifications,
                    self.config.max_query_set,
                )?;
                Ok(self
                    .transition_for(state, connection)?
                    .map(ServerMessage::Transition)
                    .into_iter()
                    .collect())
            }
            ClientMessage::Mutation {
                mutation_id,
                name,
                args,
            } => {
                let session = conn
                    .session
                    .ok_or_else(|| ServerError::InvalidRequest("connect first".into()))?;
                let identity = conn.identity.clone();

                let recorded = state
                    .sessions
                    .get(&session)
                    .and_then(|s| s.outcomes.get(&mutation_id))
                    .cloned();
                let outcome = match recorded {
                    Some(outcome) => {
                        debug!(mutation = %mutation_id, "duplicate mutation, replaying outcome");
                        outcome
                    }
                    None => {
                        let outcome = run_mutation(state, &name, &args, &identity);
                        state
                            .sessions
                            .entry(session)
                            .or_default()
                            .outcomes
                            .insert(mutation_id, outcome.clone());
                        outcome
                    }
                };

                let mut replies = vec![ServerMessage::MutationResponse {
                    mutation_id,
                    outcome,
                }];
                replies.extend(
                    self.transition_for(state, connection)?
                        .map(ServerMessage::Transition),
                );
                Ok(replies)
            }
        }
    }

    fn transition_for(
        &self,
        state: &mut ServerState,
        connection: ConnectionId,
    ) -> ServerResult<Option<Transition>> {
        let current = state.log.current();
        let conn = state
            .connections
            .get_mut(&connection)
            .ok_or(ServerError::UnknownConnection(connection.0))?;
        if conn.session.is_none() {
            return Ok(None);
        }
        let changed = state.log.tables_changed_since(conn.last_sent);
        let transition = conn.compute_transition(
            &state.tables,
            &changed,
            current,
            self.config.index_batch_size as usize,
            self.config.max_page_size,
        );
        if let Some(t) = &transition {
            debug!(
                connection = connection.0,
                start = %t.start_version,
                end = %t.end_version,
                modifications = t.modifications.len(),
                "transition"
            );
            compact_log(state);
        }
        Ok(transition)
    }
}

/// Creation times at `version` start above `(version + 1) * 1000`. Saturates
/// at `i64::MAX` for versions the scheme cannot represent.
fn creation_base(version: Version) -> i64 {
    i64::try_from(version.0)
        .ok()
        .and_then(|v| v.checked_add(1)?.checked_mul(1000))
        .unwrap_or(i64::MAX)
}

fn run_mutation(
    state: &mut ServerState,
    name: &str,
    args: &Value,
    identity: &Identity,
) -> MutationOutcome {
    let Some(mutation) = state.mutations.get(name).cloned() else {
        return MutationOutcome::Failure {
            error: format!("unknown mutation {name}"),
        };
    };

    let mut tables = state.tables.clone();
    let mut next_document = state.next_document;
    let base_time = creation_base(state.log.current());
    let mut writer = ServerWriter::new(&mut tables, &mut next_document, base_time);

    match mutation(&mut writer, args, identity) {
        Ok(value) => {
            let touched = writer.into_touched();
            state.tables = tables;
            state.next_document = next_document;
            let commit_version = state.log.append(touched);
            debug!(mutation = name, version = %commit_version, "mutation committed");
            MutationOutcome::Success {
                value,
                commit_version,
            }
        }
        Err(error) => {
            debug!(mutation = name, %error, "mutation rejected");
            MutationOutcome::Failure { error }
        }
    }
}

/// Drops commit log entries every open connection has already seen.
fn compact_log(state: &mut ServerState) {
    let floor = state
        .connections
        .values()
        .map(|c| c.last_sent)
        .min()
        .unwrap_or_else(|| state.log.current());
    state.log.truncate_through(floor);
}
