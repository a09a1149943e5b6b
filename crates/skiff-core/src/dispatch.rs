//! The dispatch engine: bounded inbound queue, single-consumer loop, and the
//! per-message producer/consumer protocol.
//!
//! Transports push [`MessageContext`]s into the queue. One background task
//! drains it in FIFO order, resolves the handler for each message's channel,
//! and starts two independently scheduled tasks per message: the handler
//! invocation and the context's delivery routine. The two communicate only
//! through a buffered response channel and a one-shot completion signal.
//!
//! Handler execution is never retried and never timed out. A handler that
//! never signals completion parks its delivery task until the process exits.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use skiff_types::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::registry::ChannelRegistry;

/// Capacity of the shared inbound queue. Senders block when it is full.
pub const INBOUND_CAPACITY: usize = 10_000;

/// Buffer size of the per-message response channel. Bounded so an unconsumed
/// stream back-pressures the handler instead of growing without limit.
const RESPONSE_BUFFER: usize = 64;

/// The delivery callback a transport binds to a message at ingress.
///
/// Invoked exactly once by the dispatcher with the message id, channel, the
/// receiving halves of the handler's response stream and completion signal.
pub type DeliverFn = Box<
    dyn FnOnce(String, String, mpsc::Receiver<String>, oneshot::Receiver<()>) -> BoxFuture<'static, ()>
        + Send,
>;

/// A message paired with its transport-specific delivery callback; the unit
/// the dispatcher consumes.
pub struct MessageContext {
    pub message: Message,
    pub deliver: DeliverFn,
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Create the shared inbound queue at the default capacity.
pub fn inbound_queue() -> (mpsc::Sender<MessageContext>, mpsc::Receiver<MessageContext>) {
    inbound_queue_with_capacity(INBOUND_CAPACITY)
}

/// Create an inbound queue with an explicit capacity.
pub fn inbound_queue_with_capacity(
    capacity: usize,
) -> (mpsc::Sender<MessageContext>, mpsc::Receiver<MessageContext>) {
    mpsc::channel(capacity)
}

/// Drains the inbound queue and fans each message out to its handler.
///
/// The consumption loop is deliberately single-threaded so admission order is
/// FIFO and handler start order matches it; per-message work is spawned so a
/// slow handler never blocks admission of the next message.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    inbound: mpsc::Receiver<MessageContext>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>, inbound: mpsc::Receiver<MessageContext>) -> Self {
        Self { registry, inbound }
    }

    /// Run the consumption loop on a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume contexts until every queue sender is dropped.
    pub async fn run(mut self) {
        while let Some(context) = self.inbound.recv().await {
            self.dispatch(context);
        }
        debug!("inbound queue closed, dispatcher stopping");
    }

    fn dispatch(&self, context: MessageContext) {
        let MessageContext { message, deliver } = context;
        let Message {
            id, channel, body, ..
        } = message;

        // Admission is decoupled from resolution: an unknown channel is
        // logged and dropped, with no signal back to the original caller.
        let Some(handler) = self.registry.get(&channel) else {
            warn!(%id, %channel, "no handler registered for channel, dropping message");
            return;
        };

        debug!(%id, %channel, "dispatching message");
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(handler.invoke(body, response_tx, done_tx));
        tokio::spawn(deliver(id, channel, response_rx, done_rx));
    }
}

/// A delivery routine's view of one message's response stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseEvent {
    /// The handler emitted a response.
    Response(String),
    /// The handler signaled completion; no further responses will arrive.
    Completed,
    /// The handler went away without signaling completion.
    Abandoned,
}

#[derive(Clone, Copy)]
enum FeedEnd {
    Completed,
    Abandoned,
}

impl From<FeedEnd> for ResponseEvent {
    fn from(end: FeedEnd) -> Self {
        match end {
            FeedEnd::Completed => ResponseEvent::Completed,
            FeedEnd::Abandoned => ResponseEvent::Abandoned,
        }
    }
}

/// Combines a message's response receiver and completion signal into a
/// single event stream, preserving emission order.
///
/// The final response and the completion signal race by design: once the
/// signal fires, any responses the handler had already queued are drained
/// before the terminal event is reported.
pub struct ResponseFeed {
    responses: mpsc::Receiver<String>,
    completion: oneshot::Receiver<()>,
    outcome: Option<FeedEnd>,
}

impl ResponseFeed {
    pub fn new(responses: mpsc::Receiver<String>, completion: oneshot::Receiver<()>) -> Self {
        Self {
            responses,
            completion,
            outcome: None,
        }
    }

    /// Wait for the next event. After [`ResponseEvent::Completed`] or
    /// [`ResponseEvent::Abandoned`] every further call reports the same
    /// terminal event.
    pub async fn next(&mut self) -> ResponseEvent {
        if let Some(end) = self.outcome {
            // Terminal state already observed; only queued responses remain.
            return match self.responses.try_recv() {
                Ok(body) => ResponseEvent::Response(body),
                Err(_) => end.into(),
            };
        }

        tokio::select! {
            biased;
            received = self.responses.recv() => match received {
                Some(body) => ResponseEvent::Response(body),
                None => {
                    // Response sender gone; the completion signal decides
                    // whether this was an orderly finish.
                    let end = match (&mut self.completion).await {
                        Ok(()) => FeedEnd::Completed,
                        Err(_) => FeedEnd::Abandoned,
                    };
                    self.outcome = Some(end);
                    end.into()
                }
            },
            signaled = &mut self.completion => {
                let end = match signaled {
                    Ok(()) => FeedEnd::Completed,
                    Err(_) => FeedEnd::Abandoned,
                };
                self.outcome = Some(end);
                match self.responses.try_recv() {
                    Ok(body) => ResponseEvent::Response(body),
                    Err(_) => end.into(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use skiff_types::MessageResult;
    use tokio::time::timeout;

    use super::*;

    fn collecting_context(
        message: Message,
    ) -> (MessageContext, oneshot::Receiver<MessageResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let deliver: DeliverFn = Box::new(move |id, channel, responses, done| {
            Box::pin(async move {
                let mut feed = ResponseFeed::new(responses, done);
                let mut result = MessageResult::pending();
                loop {
                    match feed.next().await {
                        ResponseEvent::Response(body) => {
                            result
                                .responses
                                .push(Message::new(id.clone(), channel.clone(), body, 0));
                        }
                        ResponseEvent::Completed => {
                            result.done = true;
                            break;
                        }
                        ResponseEvent::Abandoned => break,
                    }
                }
                let _ = result_tx.send(result);
            })
        });
        (MessageContext { message, deliver }, result_rx)
    }

    fn noop_context(id: &str, channel: &str) -> MessageContext {
        MessageContext {
            message: Message::new(id, channel, "body", 0),
            deliver: Box::new(|_, _, _, _| Box::pin(async {})),
        }
    }

    #[tokio::test]
    async fn handler_responses_arrive_in_order_and_complete() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.add_fn("foo", |_, responses, done| async move {
            for x in 0..10 {
                let _ = responses.send(x.to_string()).await;
            }
            let _ = responses.send("ping".to_string()).await;
            let _ = done.send(());
        });

        let (queue_tx, queue_rx) = inbound_queue_with_capacity(16);
        Dispatcher::new(registry, queue_rx).spawn();

        let (context, result_rx) = collecting_context(Message::new("m1", "foo", "hi", 0));
        queue_tx.send(context).await.unwrap();

        let result = timeout(Duration::from_secs(5), result_rx)
            .await
            .expect("delivery finished")
            .unwrap();
        assert!(result.done);
        let bodies: Vec<&str> = result.responses.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(
            bodies,
            vec!["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "ping"]
        );
        assert!(result.responses.iter().all(|m| m.id == "m1"));
        assert!(result.responses.iter().all(|m| m.channel == "foo"));
    }

    #[tokio::test]
    async fn unknown_channel_never_delivers() {
        let registry = Arc::new(ChannelRegistry::new());
        let (queue_tx, queue_rx) = inbound_queue_with_capacity(16);
        Dispatcher::new(registry, queue_rx).spawn();

        let (context, result_rx) = collecting_context(Message::new("m1", "bar", "hi", 0));
        queue_tx.send(context).await.unwrap();

        // The context is dropped without invoking deliver, so the collector
        // never reports and its sender is eventually dropped.
        let outcome = timeout(Duration::from_millis(200), result_rx).await;
        match outcome {
            Ok(Err(_)) => {} // deliver dropped unused
            Ok(Ok(result)) => panic!("unexpected delivery: {result:?}"),
            Err(_) => panic!("deliver callback leaked instead of being dropped"),
        }
    }

    #[tokio::test]
    async fn zero_response_handler_still_completes() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.add_fn("quiet", |_, _responses, done| async move {
            let _ = done.send(());
        });

        let (queue_tx, queue_rx) = inbound_queue_with_capacity(16);
        Dispatcher::new(registry, queue_rx).spawn();

        let (context, result_rx) = collecting_context(Message::new("m1", "quiet", "hi", 0));
        queue_tx.send(context).await.unwrap();

        let result = timeout(Duration::from_secs(5), result_rx)
            .await
            .expect("delivery finished")
            .unwrap();
        assert!(result.done);
        assert!(result.responses.is_empty());
    }

    #[tokio::test]
    async fn abandoning_handler_does_not_mark_done() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.add_fn("flaky", |_, responses, done| async move {
            let _ = responses.send("partial".to_string()).await;
            // Drop both sinks without firing the completion signal.
            drop(responses);
            drop(done);
        });

        let (queue_tx, queue_rx) = inbound_queue_with_capacity(16);
        Dispatcher::new(registry, queue_rx).spawn();

        let (context, result_rx) = collecting_context(Message::new("m1", "flaky", "hi", 0));
        queue_tx.send(context).await.unwrap();

        let result = timeout(Duration::from_secs(5), result_rx)
            .await
            .expect("delivery finished")
            .unwrap();
        assert!(!result.done);
        assert_eq!(result.responses.len(), 1);
        assert_eq!(result.responses[0].body, "partial");
    }

    #[tokio::test]
    async fn concurrent_messages_keep_responses_separate() {
        let registry = Arc::new(ChannelRegistry::new());
        for name in ["alpha", "beta", "gamma", "delta"] {
            registry.add_fn(name, move |body, responses, done| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = responses.send(format!("{name}:{body}")).await;
                let _ = responses.send(format!("{name}:done")).await;
                let _ = done.send(());
            });
        }

        let (queue_tx, queue_rx) = inbound_queue_with_capacity(16);
        Dispatcher::new(registry, queue_rx).spawn();

        let mut receivers = Vec::new();
        for (index, name) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
            let (context, result_rx) =
                collecting_context(Message::new(format!("m{index}"), *name, "payload", 0));
            queue_tx.send(context).await.unwrap();
            receivers.push((*name, result_rx));
        }

        for (name, result_rx) in receivers {
            let result = timeout(Duration::from_secs(5), result_rx)
                .await
                .expect("delivery finished")
                .unwrap();
            assert!(result.done);
            let bodies: Vec<&str> = result.responses.iter().map(|m| m.body.as_str()).collect();
            assert_eq!(bodies, vec![format!("{name}:payload"), format!("{name}:done")]);
        }
    }

    #[tokio::test]
    async fn full_queue_blocks_the_sender() {
        let registry = Arc::new(ChannelRegistry::new());
        let (queue_tx, queue_rx) = inbound_queue_with_capacity(1);

        queue_tx.send(noop_context("m1", "foo")).await.unwrap();

        // Queue full and nobody consuming: the next send must block, not
        // drop or error.
        let blocked = timeout(
            Duration::from_millis(100),
            queue_tx.send(noop_context("m2", "foo")),
        )
        .await;
        assert!(blocked.is_err(), "send should block on a full queue");

        // Once the dispatcher drains the queue, sending proceeds.
        Dispatcher::new(registry, queue_rx).spawn();
        timeout(
            Duration::from_secs(5),
            queue_tx.send(noop_context("m3", "foo")),
        )
        .await
        .expect("send unblocked after consumer started")
        .unwrap();
    }

    #[tokio::test]
    async fn feed_drains_queued_responses_before_completion() {
        let (response_tx, response_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();

        // Handler emits everything and completes before the consumer looks.
        response_tx.send("a".to_string()).await.unwrap();
        response_tx.send("b".to_string()).await.unwrap();
        done_tx.send(()).unwrap();

        let mut feed = ResponseFeed::new(response_rx, done_rx);
        assert_eq!(feed.next().await, ResponseEvent::Response("a".to_string()));
        assert_eq!(feed.next().await, ResponseEvent::Response("b".to_string()));
        assert_eq!(feed.next().await, ResponseEvent::Completed);
        // Terminal state is sticky.
        assert_eq!(feed.next().await, ResponseEvent::Completed);
    }
}
