//! Transport port and session bookkeeping.
//!
//! A transport translates an external protocol into
//! [`crate::dispatch::MessageContext`]s for the dispatcher and fans
//! broadcasts out to its live peers. The bus only
//! ever sees this trait; protocol specifics (HTTP routes, WebSocket frames)
//! live in the server crate.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use skiff_types::{Message, TransportError};
use tokio::sync::mpsc;
use tracing::warn;

/// Outbound frame buffer per session. A session that stops reading has this
/// many frames in flight before broadcasts start skipping it.
const SESSION_BUFFER: usize = 256;

/// Capability every transport implementation provides to the bus.
pub trait Transport: Send + Sync {
    /// Stable name used to look up this transport's bind address.
    fn name(&self) -> &str;

    /// Serve the protocol on `addr`. Blocks for the life of the listener and
    /// returns only on fatal listener failure.
    fn listen_and_serve(&self, addr: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Deliver `message` to every currently-live peer, best effort. A failed
    /// per-peer send is logged and skipped; other peers are unaffected.
    fn publish(&self, message: Message) -> BoxFuture<'_, ()>;
}

/// Explicit set of (transport name, bind address) pairs handed to
/// [`crate::bus::Bus::start`]. Transports without an entry are not started.
#[derive(Debug, Clone, Default)]
pub struct TransportBindings {
    entries: Vec<(String, String)>,
}

impl TransportBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. Builder-style so wiring reads as one expression.
    pub fn bind(mut self, transport: impl Into<String>, addr: impl Into<String>) -> Self {
        self.entries.push((transport.into(), addr.into()));
        self
    }

    /// The configured address for a transport name, if any.
    pub fn addr_for(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(transport, _)| transport == name)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live peers of a session-oriented transport.
///
/// Sessions are added on connect and removed on disconnect or receive error,
/// possibly while a broadcast is iterating from another task; the map is
/// concurrency-safe so removal never races iteration.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, mpsc::Sender<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an outbound channel for a new session and register it. Returns
    /// both halves: the sender for per-message response delivery, and the
    /// receiver the session's writer task drains.
    pub fn add(&self, id: impl Into<String>) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions.insert(id.into(), outbound_tx.clone());
        (outbound_tx, outbound_rx)
    }

    /// The outbound sender for a live session.
    pub fn sender(&self, id: &str) -> Option<mpsc::Sender<String>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    /// Remove a session. Returns `true` if it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Visit every live session.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &mpsc::Sender<String>)) {
        for entry in self.sessions.iter() {
            visit(entry.key(), entry.value());
        }
    }

    /// Queue `frame` on every live session's outbound channel. A peer whose
    /// buffer is full or whose writer is gone is logged and skipped; it is
    /// never retried and never blocks delivery to the others.
    pub fn broadcast(&self, frame: &str) {
        self.for_each(|id, outbound| {
            if let Err(err) = outbound.try_send(frame.to_string()) {
                warn!(session = %id, %err, "skipping broadcast to unreachable session");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live_sessions", &self.sessions.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
