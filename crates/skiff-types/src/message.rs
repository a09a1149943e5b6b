//! Messaging domain types for Skiff.
//!
//! Defines the `Message` routed through the bus and the `MessageResult`
//! accumulated for poll-oriented clients.

use serde::{Deserialize, Serialize};

/// The atomic unit routed through the bus.
///
/// A message is immutable once constructed: client-originated messages are
/// built by the marshaler, server-originated ones (broadcasts, responses) by
/// the bus. Field order matches the wire encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Globally-unique message id.
    pub id: String,
    /// Named routing key resolving to a channel handler.
    pub channel: String,
    /// Opaque payload.
    pub body: String,
    /// Creation time, unix seconds.
    pub timestamp: i64,
}

impl Message {
    /// Build a message with the given identity and the current time.
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        body: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            body: body.into(),
            timestamp,
        }
    }
}

/// Accumulated outcome of a dispatched message, retrievable by polling.
///
/// `responses` holds the handler's responses in arrival order. `done` flips
/// to true exactly once, when the handler signals completion, and is
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResult {
    /// Whether the handler has signaled completion.
    pub done: bool,
    /// Responses in the order the handler emitted them.
    pub responses: Vec<Message>,
}

impl MessageResult {
    /// A fresh, empty result: not done, no responses.
    pub fn pending() -> Self {
        Self {
            done: false,
            responses: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
