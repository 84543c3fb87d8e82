//! In-process client/server plumbing.
//!
//! [`LoopbackTransport`] queues outgoing messages instead of sending them.
//! [`TestClient`] owns an engine on such a transport and moves messages
//! to and from a shared [`SyncServer`] when pumped, so tests decide exactly
//! when the network makes progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use synclane_engine::{
    EngineConfig, IncomingMessage, LocalPersistence, NoopPersistence, SyncEngine, SyncError,
    SyncResult, Transport,
};
use synclane_protocol::{ClientMessage, ServerMessage};
use synclane_server::{ConnectionId, Identity, ServerError, SyncServer};
use thiserror::Error;
use tracing::debug;

use crate::fixtures::local_schema;

/// Errors raised while pumping.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The server failed to handle a message.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Messages kept flowing after the round limit.
    #[error("no quiescence after {0} rounds")]
    NoQuiescence(usize),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// A transport that queues messages for the harness to deliver.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    connected: AtomicBool,
    reconnect_requested: AtomicBool,
    outgoing: Mutex<VecDeque<ClientMessage>>,
}

impl LoopbackTransport {
    /// Creates a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::SeqCst)
    }

    fn pop(&self) -> Option<ClientMessage> {
        self.outgoing.lock().pop_front()
    }

    fn clear(&self) {
        self.outgoing.lock().clear();
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.outgoing.lock().len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, message: ClientMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.outgoing.lock().push_back(message);
        Ok(())
    }

    fn reconnect(&self) {
        self.set_connected(false);
        self.reconnect_requested.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// An engine wired to an in-process server.
pub struct TestClient<P: LocalPersistence = NoopPersistence> {
    /// The engine under test.
    pub engine: SyncEngine<LoopbackTransport, P>,
    transport: Arc<LoopbackTransport>,
    server: Arc<SyncServer>,
    identity: Identity,
    connection: Option<ConnectionId>,
    max_rounds: usize,
}

impl TestClient {
    /// Creates a disconnected client with the chat schema.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self::with_persistence(server, EngineConfig::default(), NoopPersistence)
    }

    /// Creates a disconnected client with a custom engine configuration.
    pub fn with_config(server: Arc<SyncServer>, config: EngineConfig) -> Self {
        Self::with_persistence(server, config, NoopPersistence)
    }
}

impl<P: LocalPersistence> TestClient<P> {
    /// Creates a disconnected client that persists through `persistence`.
    pub fn with_persistence(
        server: Arc<SyncServer>,
        config: EngineConfig,
        persistence: P,
    ) -> Self {
        let transport = Arc::new(LoopbackTransport::new());
        let engine = SyncEngine::with_persistence(
            config,
            local_schema(),
            Arc::clone(&transport),
            persistence,
        );
        Self {
            engine,
            transport,
            server,
            identity: Identity::Anonymous,
            connection: None,
            max_rounds: 1000,
        }
    }

    /// Connects as `identity` from now on.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// The shared server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Returns true while a server connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Messages queued by the engine and not yet delivered.
    pub fn queued(&self) -> usize {
        self.transport.pending()
    }

    /// Opens a server connection and tells the engine.
    pub fn connect(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let connection = self.server.connect(self.identity.clone());
        debug!(connection = connection.0, "test client connected");
        self.connection = Some(connection);
        self.transport.set_connected(true);
        self.engine.receive(IncomingMessage::Connected);
    }

    /// Drops the connection. Queued messages are lost.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.server.disconnect(connection);
        }
        self.transport.set_connected(false);
        self.transport.clear();
        self.engine.receive(IncomingMessage::Closed);
    }

    /// Drops the connection and opens a new one.
    pub fn reconnect(&mut self) {
        self.disconnect();
        self.connect();
    }

    /// Delivers one server message to the engine, bypassing the server.
    pub fn deliver(&mut self, message: ServerMessage) {
        self.engine.receive(IncomingMessage::Message(message));
    }

    /// Sends every queued message to the server and returns the replies
    /// without delivering them.
    pub fn flush(&mut self) -> HarnessResult<Vec<ServerMessage>> {
        let mut replies = Vec::new();
        let Some(connection) = self.connection else {
            self.transport.clear();
            return Ok(replies);
        };
        while let Some(message) = self.transport.pop() {
            replies.extend(self.server.handle_message(connection, message)?);
        }
        Ok(replies)
    }

    /// Exchanges messages until neither side has anything to say. Handles
    /// reconnects the engine asks for. Returns the number of server
    /// messages delivered.
    pub fn pump(&mut self) -> HarnessResult<usize> {
        let mut delivered = 0;
        for _ in 0..self.max_rounds {
            if self.transport.take_reconnect_request() {
                self.reconnect();
            }
            let Some(connection) = self.connection else {
                self.transport.clear();
                return Ok(delivered);
            };

            let mut replies = self.flush()?;
            replies.extend(self.server.poll_transition(connection)?);
            if replies.is_empty() && self.transport.pending() == 0 {
                if self.transport.take_reconnect_request() {
                    self.reconnect();
                    continue;
                }
                return Ok(delivered);
            }
            for reply in replies {
                delivered += 1;
                self.deliver(reply);
            }
        }
        Err(HarnessError::NoQuiescence(self.max_rounds))
    }
}
