//! Channel handler registry.
//!
//! A channel handler is the computation bound to a channel name. It receives
//! the message body, a sender for streaming response strings, and a one-shot
//! completion sender it must fire when it is finished producing responses.
//! Handlers are supplied by the embedding application at startup and treated
//! as opaque.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Sender half of a handler's response stream.
pub type ResponseSender = mpsc::Sender<String>;

/// One-shot completion signal a handler fires when done.
pub type CompletionSender = oneshot::Sender<()>;

/// The computation registered for a channel name.
///
/// Implementations must eventually fire `done`; the dispatcher never times a
/// handler out, so one that never completes parks its delivery task for the
/// life of the process.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Process one message body, streaming responses through `responses` and
    /// firing `done` when finished.
    fn invoke(
        &self,
        body: String,
        responses: ResponseSender,
        done: CompletionSender,
    ) -> BoxFuture<'static, ()>;
}

/// Adapter turning an async closure into a [`ChannelHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(String, ResponseSender, CompletionSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

impl<F, Fut> ChannelHandler for FnHandler<F>
where
    F: Fn(String, ResponseSender, CompletionSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn invoke(
        &self,
        body: String,
        responses: ResponseSender,
        done: CompletionSender,
    ) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(body, responses, done))
    }
}

/// Maps channel names to their handlers.
///
/// Written at startup registration time and read by the dispatcher on every
/// message; effectively immutable once the bus is serving.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: DashMap<String, Arc<dyn ChannelHandler>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. A later registration for the same
    /// name replaces the earlier one.
    pub fn add<H: ChannelHandler>(&self, name: impl Into<String>, handler: H) {
        let name = name.into();
        if self
            .handlers
            .insert(name.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(channel = %name, "replacing existing channel handler");
        }
    }

    /// Convenience registration for async closures.
    pub fn add_fn<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String, ResponseSender, CompletionSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(name, FnHandler::new(handler));
    }

    /// Look up the handler for a channel name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
