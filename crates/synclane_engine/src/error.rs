//! Error types for the sync engine.

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur inside the sync engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server stream violated the protocol (version gap, overlap,
    /// buffer overflow, fatal server error).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local persistence failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// An internal invariant does not hold. Always a bug.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected | SyncError::Protocol(_) => true,
            _ => false,
        }
    }
}

impl From<synclane_value::CodecError> for SyncError {
    fn from(e: synclane_value::CodecError) -> Self {
        SyncError::Codec(e.to_string())
    }
}

/// Why a read against the local mirror did not produce a value.
///
/// `Loading` propagates through `?` so a sync query simply stops at the
/// first missing range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Part of the range is not loaded yet.
    #[error("loading")]
    Loading,

    /// The server failed the page, or the query function failed.
    #[error("{0}")]
    Failed(String),

    /// The table is not part of the local schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The index is not part of the local schema.
    #[error("unknown index {index} on table {table}")]
    UnknownIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },
}

impl QueryError {
    /// Creates a failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Why a mutation's result channel resolved with an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// The server rejected the mutation. None of its writes committed.
    #[error("mutation rejected: {0}")]
    Rejected(String),
}
