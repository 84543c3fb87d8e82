//! # synclane engine
//!
//! Client side of the sync protocol: a local mirror of paginated index
//! slices kept consistent with a versioned server stream, with optimistic
//! mutations layered on top.
//!
//! This crate provides:
//! - [`PageCache`]: loaded, loading and failed pages with stable bounds and
//!   reference counts
//! - [`LocalDbReader`]: deterministic reads over pages plus the optimistic
//!   overlay, recording which pages a query touched and which slice it is
//!   missing
//! - [`Overlay`]: pending optimistic mutations replayed over the cache
//! - [`SyncEngine`]: subscriptions, mutation lifecycle, transition ordering
//!   and reconnect handling
//! - [`Transport`] and [`LocalPersistence`]: the seams to the network and
//!   to durable storage
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use synclane_engine::{
//!     EngineConfig, IncomingMessage, LocalDbReader, LocalSchema, MockTransport, SyncEngine,
//!     SyncQuery,
//! };
//! use synclane_protocol::{Direction, BY_CREATION_TIME};
//! use synclane_value::Value;
//!
//! let transport = Arc::new(MockTransport::new());
//! let schema = LocalSchema::new().with_table("notes", vec![]);
//! let mut engine = SyncEngine::new(EngineConfig::default(), schema, transport);
//! engine.receive(IncomingMessage::Connected);
//!
//! let notes = SyncQuery::new("notes:list", |db: &mut LocalDbReader<'_>, _: &Value| {
//!     let docs = db.query("notes", BY_CREATION_TIME).order(Direction::Desc).collect()?;
//!     Ok(Value::from(docs.len() as i64))
//! });
//! let sub = engine.watch(&notes, Value::Null);
//! assert!(engine.sync_query_result(sub).unwrap().is_loading());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod engine;
mod error;
mod functions;
mod network;
mod overlay;
mod page_cache;
mod persistence;
mod reader;
mod schema;
mod transport;

pub use config::EngineConfig;
pub use engine::{
    MutationHandle, MutationStatus, SubscriptionEvent, SubscriptionId, SyncEngine, UpdateCallback,
};
pub use error::{MutationError, QueryError, SyncError, SyncResult};
pub use functions::{FunctionRegistry, MutationSpec, QueryFn, SyncQuery, SyncQueryResult};
pub use overlay::{LocalWriter, OptimisticFn, Overlay, OverlayView};
pub use page_cache::{CacheChange, Coverage, Page, PageCache, PageId, PageState};
pub use persistence::{
    LocalPersistence, MemoryPersistence, NoopPersistence, PersistedMutation, PersistedPage,
    PersistedState,
};
pub use reader::{IndexQuery, LocalDbReader};
pub use schema::LocalSchema;
pub use transport::{IncomingMessage, MockTransport, Transport};
