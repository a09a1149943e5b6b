//! In-memory implementation of the `Persister` port.
//!
//! Keeps everything in concurrent maps. Used by tests and by deployments
//! that do not need results to survive a restart.

use dashmap::DashMap;
use skiff_core::persist::Persister;
use skiff_types::{Message, MessageResult, PersistError};

/// In-memory [`Persister`] with no durability.
#[derive(Default)]
pub struct MemoryPersister {
    results: DashMap<String, MessageResult>,
    channels: DashMap<String, Vec<Message>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    async fn prepare(&self) -> Result<(), PersistError> {
        Ok(())
    }

    async fn save_result(&self, id: &str, result: &MessageResult) -> Result<(), PersistError> {
        self.results.insert(id.to_string(), result.clone());
        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<MessageResult, PersistError> {
        self.results
            .get(id)
            .map(|entry| entry.clone())
            .ok_or(PersistError::NotFound)
    }

    async fn save_message(&self, channel: &str, message: &Message) -> Result<(), PersistError> {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_messages(&self, channel: &str, since: i64) -> Result<Vec<Message>, PersistError> {
        let mut messages: Vec<Message> = self
            .channels
            .get(channel)
            .map(|entry| entry.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|message| message.timestamp >= since)
            .collect();
        // Stable sort keeps append order for equal timestamps.
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }
}

impl std::fmt::Debug for MemoryPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPersister")
            .field("results", &self.results.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
