//! Error types for the sync server.

use synclane_protocol::Version;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A document reachable by the page is not readable by the caller.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No table with this name.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The table has no index with this name.
    #[error("unknown index {index} on table {table}")]
    UnknownIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },

    /// The connection id is not open.
    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    /// The client observed a version this server never issued.
    #[error("client observed {observed} but server is at {current}")]
    ClientAhead {
        /// Version reported by the client.
        observed: Version,
        /// Current server version.
        current: Version,
    },

    /// The query set modification does not apply to the current query set.
    #[error("query set version mismatch: expected {expected}, got {actual}")]
    QuerySetMismatch {
        /// Current query set version.
        expected: u32,
        /// Base version sent by the client.
        actual: u32,
    },

    /// The query set grew beyond the configured maximum.
    #[error("too many queries: {count} > {max}")]
    TooManyQueries {
        /// Size the query set would have.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the client caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::NotAuthorized(_)
                | ServerError::UnknownTable(_)
                | ServerError::UnknownIndex { .. }
                | ServerError::ClientAhead { .. }
                | ServerError::QuerySetMismatch { .. }
                | ServerError::TooManyQueries { .. }
        )
    }

    /// Returns true if this is a server-side failure.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::Internal(_) | ServerError::UnknownConnection(_)
        )
    }
}
