//! Top-level coordinator.
//!
//! The `Bus` owns the channel registry, the persister, the transport set,
//! and the shared inbound queue. `start` wires them together and serves;
//! `broadcast` pushes server-originated messages to every live peer and the
//! channel log, bypassing the dispatch queue entirely.

use std::sync::Arc;

use chrono::Utc;
use skiff_types::{BusError, Message};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::dispatch::{self, Dispatcher, MessageContext};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::persist::Persister;
use crate::registry::{ChannelRegistry, CompletionSender, ResponseSender};
use crate::transport::{Transport, TransportBindings};

/// Coordinates transports, the persister, and the dispatcher.
///
/// Generic over the persister implementation; the server crate pins it to a
/// concrete backend at wiring time.
pub struct Bus<P> {
    registry: Arc<ChannelRegistry>,
    persister: Arc<P>,
    transports: Vec<Arc<dyn Transport>>,
    inbound_tx: mpsc::Sender<MessageContext>,
    inbound_rx: Mutex<Option<mpsc::Receiver<MessageContext>>>,
    ids: Box<dyn IdGenerator>,
}

impl<P: Persister + 'static> Bus<P> {
    pub fn new(persister: Arc<P>) -> Self {
        let (inbound_tx, inbound_rx) = dispatch::inbound_queue();
        Self {
            registry: Arc::new(ChannelRegistry::new()),
            persister,
            transports: Vec::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            ids: Box::new(UuidIdGenerator),
        }
    }

    /// Swap the id generator (tests pin ids this way).
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Register a handler for `name`. A later registration for the same name
    /// replaces the earlier one.
    pub fn add_channel<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(String, ResponseSender, CompletionSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.add_fn(name, handler);
    }

    /// The channel registry, for registering [`crate::registry::ChannelHandler`]
    /// implementations directly.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Sender half of the shared inbound queue. Transports clone this to
    /// enqueue message contexts; sends block while the queue is full.
    pub fn inbound(&self) -> mpsc::Sender<MessageContext> {
        self.inbound_tx.clone()
    }

    /// Attach a transport. Whether it is started depends on the bindings
    /// passed to [`Bus::start`].
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Prepare the persister, start the dispatcher, and serve every
    /// transport with a configured binding. Blocks until the transports
    /// terminate; returns the first fatal transport error.
    pub async fn start(&self, bindings: TransportBindings) -> Result<(), BusError> {
        let inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or(BusError::AlreadyStarted)?;

        self.persister.prepare().await?;
        Dispatcher::new(Arc::clone(&self.registry), inbound_rx).spawn();

        let mut serving = JoinSet::new();
        for transport in &self.transports {
            let Some(addr) = bindings.addr_for(transport.name()) else {
                debug!(transport = transport.name(), "no binding configured, not started");
                continue;
            };
            let transport = Arc::clone(transport);
            let addr = addr.to_string();
            serving.spawn(async move {
                info!(transport = transport.name(), %addr, "transport listening");
                transport.listen_and_serve(addr).await
            });
        }

        while let Some(joined) = serving.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(BusError::Transport(err)),
                Err(err) => return Err(BusError::TransportTask(err.to_string())),
            }
        }
        Ok(())
    }

    /// Send a server-originated message to all connected peers of every
    /// transport and append it to the channel's persisted log. Returns the
    /// generated message.
    pub async fn broadcast(&self, channel: &str, body: &str) -> Result<Message, BusError> {
        let message = Message::new(
            self.ids.generate(),
            channel,
            body,
            Utc::now().timestamp(),
        );
        self.persister.save_message(channel, &message).await?;
        for transport in &self.transports {
            transport.publish(message.clone()).await;
        }
        debug!(id = %message.id, %channel, "broadcast published");
        Ok(message)
    }
}

impl<P> std::fmt::Debug for Bus<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("channels", &self.registry.len())
            .field("transports", &self.transports.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
