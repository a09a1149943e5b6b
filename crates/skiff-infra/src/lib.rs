//! Persistence adapters for Skiff.
//!
//! Implements the `Persister` port from `skiff-core`: a durable SQLite
//! backend (sqlx, split reader/writer WAL pools) and an in-memory backend
//! for tests and ephemeral deployments.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryPersister;
pub use sqlite::SqlitePersister;
