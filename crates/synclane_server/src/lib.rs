//! # synclane server
//!
//! Server side of the sync protocol.
//!
//! This crate provides:
//! - The index streaming contract: [`TableResolver`] (point loader checked
//!   per caller identity) and [`IndexCursor`] (restartable key-ordered id
//!   streams)
//! - [`fetch_page`]: the cooperative page loop that turns a cursor into a
//!   bounded, fully authorized page
//! - [`MemoryTable`]: an in-memory reference table with access policies
//! - [`SyncServer`]: a reference server maintaining per-connection query
//!   sets and emitting versioned transitions
//!
//! # Protocol
//!
//! 1. Client sends `Connect` with its session id and highest observed version
//! 2. Client sends `ModifyQuerySet` to subscribe to page queries
//! 3. The server answers with a transition from version 0 to its current
//!    version, then one transition per later change
//! 4. Mutations are answered with their outcome and commit version, and are
//!    de-duplicated per session by mutation id

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod commit_log;
mod config;
mod error;
mod resolver;
mod server;
mod session;
mod table;
mod writer;

pub use commit_log::{CommitEntry, CommitLog};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use resolver::{fetch_page, Identity, IndexBatch, IndexCursor, TableResolver};
pub use server::{ConnectionId, SyncServer};
pub use table::{Access, AccessPolicy, MemoryIndex, MemoryTable};
pub use writer::{ServerMutation, ServerWriter};
