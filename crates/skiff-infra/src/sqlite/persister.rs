//! SQLite implementation of the `Persister` port.
//!
//! Results are stored as JSON text keyed by message id; the channel log is a
//! row per broadcast scored by its timestamp, so `get_messages` is a range
//! scan over the `(channel, timestamp)` index. The pool is built lazily in
//! `prepare()` so the bus can fail fast at startup when the database is
//! unreachable.

use chrono::Utc;
use skiff_core::persist::Persister;
use skiff_types::{Message, MessageResult, PersistError};
use sqlx::Row;
use tokio::sync::OnceCell;

use super::pool::DatabasePool;

/// SQLite-backed [`Persister`].
pub struct SqlitePersister {
    database_url: String,
    pool: OnceCell<DatabasePool>,
}

impl SqlitePersister {
    /// Create a persister for the given database URL. No connection is made
    /// until [`Persister::prepare`] runs.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: OnceCell::new(),
        }
    }

    fn pool(&self) -> Result<&DatabasePool, PersistError> {
        self.pool
            .get()
            .ok_or_else(|| PersistError::Unavailable("prepare() has not been called".to_string()))
    }
}

fn query_error(err: sqlx::Error) -> PersistError {
    PersistError::Query(err.to_string())
}

impl Persister for SqlitePersister {
    async fn prepare(&self) -> Result<(), PersistError> {
        self.pool
            .get_or_try_init(|| DatabasePool::new(&self.database_url))
            .await
            .map(|_| ())
            .map_err(|err| PersistError::Unavailable(err.to_string()))
    }

    async fn save_result(&self, id: &str, result: &MessageResult) -> Result<(), PersistError> {
        let pool = self.pool()?;
        let encoded = serde_json::to_string(result)
            .map_err(|err| PersistError::Query(format!("failed to encode result: {err}")))?;

        sqlx::query(
            r#"INSERT INTO message_results (id, result, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET result = excluded.result, updated_at = excluded.updated_at"#,
        )
        .bind(id)
        .bind(&encoded)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<MessageResult, PersistError> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT result FROM message_results WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let encoded: String = row.try_get("result").map_err(query_error)?;
                serde_json::from_str(&encoded)
                    .map_err(|err| PersistError::Query(format!("invalid stored result: {err}")))
            }
            None => Err(PersistError::NotFound),
        }
    }

    async fn save_message(&self, channel: &str, message: &Message) -> Result<(), PersistError> {
        let pool = self.pool()?;
        let payload = serde_json::to_string(message)
            .map_err(|err| PersistError::Query(format!("failed to encode message: {err}")))?;

        sqlx::query(
            "INSERT INTO channel_messages (message_id, channel, timestamp, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(channel)
        .bind(message.timestamp)
        .bind(&payload)
        .execute(&pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_messages(&self, channel: &str, since: i64) -> Result<Vec<Message>, PersistError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT payload FROM channel_messages WHERE channel = ? AND timestamp >= ? ORDER BY timestamp ASC",
        )
        .bind(channel)
        .bind(since)
        .fetch_all(&pool.reader)
        .await
        .map_err(query_error)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: String = row.try_get("payload").map_err(query_error)?;
            let message: Message = serde_json::from_str(&payload)
                .map_err(|err| PersistError::Query(format!("invalid stored message: {err}")))?;
            messages.push(message);
        }

        Ok(messages)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
