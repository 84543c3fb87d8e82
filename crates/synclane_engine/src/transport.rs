//! Transport abstraction between the engine and a server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use synclane_protocol::{ClientMessage, ServerMessage};

use crate::error::{SyncError, SyncResult};

/// Connection events fed into [`crate::SyncEngine::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    /// A fresh connection is open. The server has no state for it yet.
    Connected,
    /// A message arrived.
    Message(ServerMessage),
    /// The connection closed.
    Closed,
}

/// Outbound half of a connection.
///
/// Implementations deliver messages in order and report lifecycle changes
/// back through [`IncomingMessage`]. Reconnection is the transport's job:
/// after [`Transport::reconnect`] it eventually delivers `Connected`.
pub trait Transport: Send + Sync {
    /// Sends a message.
    fn send(&self, message: ClientMessage) -> SyncResult<()>;

    /// Drops the current connection and opens a new one.
    fn reconnect(&self);

    /// Returns true while a connection is open.
    fn is_connected(&self) -> bool;
}

/// A transport that records messages, for tests.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    fail_sends: AtomicBool,
    fatal_sends: AtomicBool,
    reconnects: AtomicUsize,
    sent: Mutex<Vec<ClientMessage>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every send fail with an error that retrying cannot fix.
    pub fn set_fatal_sends(&self, fatal: bool) {
        self.fatal_sends.store(fatal, Ordering::SeqCst);
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Drains the sent messages.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Number of reconnect requests.
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, message: ClientMessage) -> SyncResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        if self.fatal_sends.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("connection reset"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("send failed"));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclane_protocol::{SessionId, Version};

    fn connect() -> ClientMessage {
        ClientMessage::Connect {
            session_id: SessionId::generate(),
            max_observed_version: Version::ZERO,
        }
    }

    #[test]
    fn mock_records_messages() {
        let transport = MockTransport::new();
        transport.send(connect()).unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn mock_failures() {
        let transport = MockTransport::new();
        transport.set_fail_sends(true);
        assert!(transport.send(connect()).unwrap_err().is_retryable());

        transport.set_fail_sends(false);
        transport.reconnect();
        assert!(!transport.is_connected());
        assert_eq!(transport.reconnects(), 1);
        assert_eq!(transport.send(connect()), Err(SyncError::NotConnected));
    }
}
