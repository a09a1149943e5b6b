//! Persistence port.
//!
//! Defines the durable-storage interface the bus consumes: keyed result
//! storage for poll-oriented delivery, and a time-ordered message log per
//! channel for broadcasts. Uses RPITIT (native async fn in traits).
//! Implementations live in skiff-infra.

use skiff_types::{Message, MessageResult, PersistError};

/// Durable key/value and time-ordered log storage.
///
/// Reads may run concurrently with each other; implementations serialize
/// writes themselves.
pub trait Persister: Send + Sync {
    /// Establish connectivity. Called once before serving; a failure here
    /// aborts startup.
    fn prepare(&self) -> impl Future<Output = Result<(), PersistError>> + Send;

    /// Store (or replace) the result for a message id.
    fn save_result(
        &self,
        id: &str,
        result: &MessageResult,
    ) -> impl Future<Output = Result<(), PersistError>> + Send;

    /// Fetch the result for a message id. A missing id is
    /// [`PersistError::NotFound`], never a default result.
    fn get_result(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<MessageResult, PersistError>> + Send;

    /// Append a message to a channel's log, scored by its timestamp.
    fn save_message(
        &self,
        channel: &str,
        message: &Message,
    ) -> impl Future<Output = Result<(), PersistError>> + Send;

    /// All messages on a channel with timestamp >= `since`, ascending.
    fn get_messages(
        &self,
        channel: &str,
        since: i64,
    ) -> impl Future<Output = Result<Vec<Message>, PersistError>> + Send;
}
