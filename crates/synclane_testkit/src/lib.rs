//! # synclane testkit
//!
//! Test utilities for synclane.
//!
//! This crate provides:
//! - Fixtures: a conversations/messages schema with sync queries, server
//!   mutations and matching optimistic updates
//! - A loopback transport and [`TestClient`], which pumps messages between
//!   an engine and an in-process [`synclane_server::SyncServer`]
//! - Property-based strategies and workload operations
//!
//! ## Usage
//!
//! ```rust
//! use synclane_testkit::prelude::*;
//! use synclane_value::Value;
//!
//! let server = chat_server();
//! let mut client = TestClient::new(server.clone());
//! client.connect();
//! let sub = client.engine.watch(&get_conversations(), Value::Null);
//! client.pump().unwrap();
//! assert_eq!(
//!     client.engine.sync_query_result(sub).and_then(|r| r.value()),
//!     Some(&Value::Array(vec![]))
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
