//! Protocol messages exchanged over the duplex connection.

use serde::{Deserialize, Serialize};
use synclane_value::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{MutationId, QueryId, SessionId, Version};
use crate::page::{PageRequest, PageResult};

/// A page query registered in a session's query set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    /// Client-chosen token for the query.
    pub query_id: QueryId,
    /// The page to load and keep up to date.
    pub request: PageRequest,
}

/// One change to the query set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuerySetModification {
    /// Start maintaining a page query.
    Add(PageQuery),
    /// Stop maintaining a page query.
    Remove {
        /// Query to remove.
        query_id: QueryId,
    },
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message on every connection.
    Connect {
        /// Stable client session.
        session_id: SessionId,
        /// Highest version the client has applied, for staleness checks.
        max_observed_version: Version,
    },
    /// Changes the query set from `base_version` to `new_version`.
    ModifyQuerySet {
        /// Query set version the modifications apply to.
        base_version: u32,
        /// Query set version after the modifications.
        new_version: u32,
        /// Modifications in order.
        modifications: Vec<QuerySetModification>,
    },
    /// Runs a named mutation on the server.
    Mutation {
        /// Client-generated id used for de-duplication and correlation.
        mutation_id: MutationId,
        /// Registered mutation name.
        name: String,
        /// Arguments passed to the server function.
        args: Value,
    },
}

impl ClientMessage {
    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// One change carried by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateModification {
    /// The page query has a new result.
    QueryUpdated {
        /// Query that changed.
        query_id: QueryId,
        /// The complete page as of the transition's end version.
        page: PageResult,
    },
    /// The page query failed, for example on an authorization error.
    QueryFailed {
        /// Query that failed.
        query_id: QueryId,
        /// Error description.
        error: String,
    },
    /// The page query was removed from the query set.
    QueryRemoved {
        /// Query that was removed.
        query_id: QueryId,
    },
}

impl StateModification {
    /// The query this modification concerns.
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. }
            | StateModification::QueryRemoved { query_id } => *query_id,
        }
    }
}

/// A versioned batch of authoritative changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Version the client must be at to apply this transition.
    pub start_version: Version,
    /// Version the client is at after applying it.
    pub end_version: Version,
    /// Changes in order.
    pub modifications: Vec<StateModification>,
}

/// Result of a server mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MutationOutcome {
    /// The mutation committed.
    Success {
        /// Return value of the server function.
        value: Value,
        /// Version at which the writes became visible.
        commit_version: Version,
    },
    /// The mutation was rejected; none of its writes were committed.
    Failure {
        /// Error description.
        error: String,
    },
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A versioned transition.
    Transition(Transition),
    /// Response to a `Mutation` message.
    MutationResponse {
        /// Mutation being answered.
        mutation_id: MutationId,
        /// Outcome.
        outcome: MutationOutcome,
    },
    /// The server cannot continue this session; the client must reconnect.
    FatalError {
        /// Error description.
        message: String,
    },
}

impl ServerMessage {
    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Bound, IndexKey};

    #[test]
    fn client_message_wire_shape() {
        let msg = ClientMessage::Mutation {
            mutation_id: MutationId(3),
            name: "conversations:create".into(),
            args: Value::object([("id", Value::from("a"))]),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "Mutation");
        assert_eq!(json["mutation_id"], 3);
        assert_eq!(ClientMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn transition_carries_pages() {
        let msg = ServerMessage::Transition(Transition {
            start_version: Version(0),
            end_version: Version(4),
            modifications: vec![
                StateModification::QueryUpdated {
                    query_id: QueryId(1),
                    page: PageResult {
                        documents: vec![],
                        lower: Bound::Minimal,
                        upper: Bound::Successor(IndexKey(vec![Value::Integer(5)])),
                    },
                },
                StateModification::QueryRemoved {
                    query_id: QueryId(2),
                },
            ],
        });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ServerMessage::decode(b"{\"type\":\"Nope\"}"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn modification_query_ids() {
        let m = StateModification::QueryFailed {
            query_id: QueryId(9),
            error: "denied".into(),
        };
        assert_eq!(m.query_id(), QueryId(9));
    }
}
