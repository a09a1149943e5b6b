//! Shared domain types for Skiff.
//!
//! This crate contains the wire-level types routed through the bus --
//! `Message`, `MessageResult` -- and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde and thiserror.

pub mod error;
pub mod message;

pub use error::{BusError, MarshalError, PersistError, TransportError};
pub use message::{Message, MessageResult};
