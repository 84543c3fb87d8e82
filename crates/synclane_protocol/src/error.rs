//! Protocol errors.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors encoding or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes did not form a valid message.
    #[error("decode error: {0}")]
    Decode(String),
}
