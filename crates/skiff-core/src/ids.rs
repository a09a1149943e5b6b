//! Message identity generation.

use uuid::Uuid;

/// Produces globally-unique message identities.
///
/// Kept behind a capability so tests can pin ids deterministically.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator: UUIDv7, rendered without hyphens.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        Uuid::now_v7().simple().to_string()
    }
}
