//! # synclane protocol
//!
//! Shared vocabulary between the sync server and client engine.
//!
//! This crate provides:
//! - [`IndexKey`], [`Bound`] and [`KeyRange`]: ordered index positions and
//!   half-open ranges over them
//! - [`Document`] and [`IndexDefinition`]
//! - [`PageRequest`] / [`PageResult`]: paginated index slices
//! - [`ClientMessage`] / [`ServerMessage`]: the versioned transition protocol
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod ids;
mod key;
mod messages;
mod page;

pub use document::{
    with_implicit_indexes, Document, DocumentId, IndexDefinition, BY_CREATION_TIME, BY_ID,
    CREATION_TIME_FIELD, ID_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{MutationId, QueryId, SessionId, Version};
pub use key::{compare, Bound, Direction, IndexKey, KeyRange};
pub use messages::{
    ClientMessage, MutationOutcome, PageQuery, QuerySetModification, ServerMessage,
    StateModification, Transition,
};
pub use page::{PageDocument, PageRequest, PageResult};
