use thiserror::Error;

/// Errors decoding or encoding a wire message.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The payload was not a JSON object at all.
    #[error("malformed message payload: {0}")]
    Malformed(String),

    /// A required field was absent. Fields are checked in the fixed order
    /// id, channel, body, timestamp; the first missing one is reported.
    #[error("message missing {0}")]
    MissingField(&'static str),

    /// A required field was present but of the wrong JSON type.
    #[error("message field '{0}' has the wrong type")]
    InvalidField(&'static str),

    /// Encoding a message failed.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The backend is unreachable or was never prepared.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),

    /// A read or write against the backend failed.
    #[error("persistence query error: {0}")]
    Query(String),

    /// No entry exists for the requested key.
    #[error("not found")]
    NotFound,
}

/// Errors from a transport's listener.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding or serving the listener failed.
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the bus coordinator.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A transport task terminated abnormally.
    #[error("transport task failed: {0}")]
    TransportTask(String),

    /// `start` was called a second time on the same bus.
    #[error("bus already started")]
    AlreadyStarted,
}
