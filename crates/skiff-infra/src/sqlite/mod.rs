//! SQLite-backed persistence.

pub mod persister;
pub mod pool;

pub use persister::SqlitePersister;
pub use pool::DatabasePool;
