//! Dispatch engine for the Skiff message bus.
//!
//! This crate owns the transport-agnostic core: the marshaler, the channel
//! handler registry, the bounded inbound queue and dispatcher, the transport
//! and persister ports, and the bus coordinator that ties them together.
//! It depends only on `skiff-types` -- never on an HTTP framework or a
//! storage crate; those live in `skiff-server` and `skiff-infra`.

pub mod bus;
pub mod dispatch;
pub mod ids;
pub mod marshal;
pub mod persist;
pub mod registry;
pub mod transport;
