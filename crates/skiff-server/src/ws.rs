//! WebSocket session transport.
//!
//! One long-lived connection per client. Inbound and outbound frames are the
//! marshaler's encoded `Message` form; no additional framing. Each session
//! gets a writer task draining an outbound channel, so per-message delivery
//! routines and broadcasts share one ordered path to the socket.
//!
//! A frame that fails to decode is logged and skipped -- a single bad frame
//! does not terminate the session. A receive error or close frame ends the
//! receive loop and removes the session from the live set.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use skiff_core::dispatch::{DeliverFn, MessageContext, ResponseEvent, ResponseFeed};
use skiff_core::marshal::{JsonMarshaler, Marshaler};
use skiff_core::transport::{SessionRegistry, Transport};
use skiff_types::{Message, TransportError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

/// Session-oriented transport over WebSocket.
pub struct WsTransport {
    uri: String,
    marshaler: JsonMarshaler,
    sessions: Arc<SessionRegistry>,
    inbound: mpsc::Sender<MessageContext>,
}

#[derive(Clone)]
struct WsState {
    marshaler: JsonMarshaler,
    sessions: Arc<SessionRegistry>,
    inbound: mpsc::Sender<MessageContext>,
}

impl WsTransport {
    /// Name used in transport bindings.
    pub const NAME: &'static str = "ws";

    pub fn new(uri: impl Into<String>, inbound: mpsc::Sender<MessageContext>) -> Self {
        Self {
            uri: uri.into(),
            marshaler: JsonMarshaler,
            sessions: Arc::new(SessionRegistry::new()),
            inbound,
        }
    }

    /// The live-session registry backing this transport.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn listen_and_serve(&self, addr: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let state = WsState {
                marshaler: self.marshaler,
                sessions: Arc::clone(&self.sessions),
                inbound: self.inbound.clone(),
            };
            let router = Router::new()
                .route(&self.uri, get(upgrade_session))
                .layer(TraceLayer::new_for_http())
                .with_state(state);

            let listener = TcpListener::bind(&addr).await?;
            axum::serve(listener, router).await?;
            Ok(())
        })
    }

    fn publish(&self, message: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.marshaler.marshal(&message) {
                Ok(frame) => self.sessions.broadcast(&frame),
                Err(err) => warn!(id = %message.id, %err, "failed to encode broadcast frame"),
            }
        })
    }
}

/// Upgrade an HTTP request to a WebSocket session.
async fn upgrade_session(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

/// Per-session receive loop plus an outbound writer task.
async fn run_session(socket: WebSocket, state: WsState) {
    let session_id = Uuid::now_v7().simple().to_string();
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = state.sessions.add(session_id.clone());
    debug!(session = %session_id, "session connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if socket_tx.send(WsFrame::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(received) = socket_rx.next().await {
        match received {
            Ok(WsFrame::Text(text)) => {
                let message = match state.marshaler.unmarshal(text.as_bytes()) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(session = %session_id, %err, "ignoring undecodable frame");
                        continue;
                    }
                };

                let outbound = outbound_tx.clone();
                let marshaler = state.marshaler;
                let deliver: DeliverFn = Box::new(move |id, channel, responses, done| {
                    Box::pin(respond_over_session(
                        id, channel, responses, done, outbound, marshaler,
                    ))
                });

                if state
                    .inbound
                    .send(MessageContext { message, deliver })
                    .await
                    .is_err()
                {
                    warn!(session = %session_id, "dispatcher gone, closing session");
                    break;
                }
            }
            Ok(WsFrame::Close(_)) => break,
            // Ping/pong/binary protocol frames are handled by the stack.
            Ok(_) => {}
            Err(err) => {
                debug!(session = %session_id, %err, "receive error");
                break;
            }
        }
    }

    state.sessions.remove(&session_id);
    writer.abort();
    debug!(session = %session_id, "session disconnected");
}

/// Delivery routine bound to one message: encode each handler response and
/// write it back over the originating session.
async fn respond_over_session(
    id: String,
    channel: String,
    responses: mpsc::Receiver<String>,
    done: oneshot::Receiver<()>,
    outbound: mpsc::Sender<String>,
    marshaler: JsonMarshaler,
) {
    let mut feed = ResponseFeed::new(responses, done);
    loop {
        match feed.next().await {
            ResponseEvent::Response(body) => {
                let reply = Message::new(id.clone(), channel.clone(), body, Utc::now().timestamp());
                match marshaler.marshal(&reply) {
                    Ok(frame) => {
                        if outbound.send(frame).await.is_err() {
                            debug!(%id, "session gone mid-stream, dropping remaining responses");
                            return;
                        }
                    }
                    Err(err) => warn!(%id, %err, "failed to encode response"),
                }
            }
            ResponseEvent::Completed => return,
            ResponseEvent::Abandoned => {
                warn!(%id, %channel, "handler ended without completing");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use skiff_core::bus::Bus;
    use skiff_core::dispatch;
    use skiff_core::persist::Persister;
    use skiff_infra::MemoryPersister;

    use super::*;

    #[tokio::test]
    async fn bus_broadcast_reaches_live_sessions_with_fresh_ids() {
        let persister = Arc::new(MemoryPersister::new());
        let mut bus = Bus::new(Arc::clone(&persister));
        let transport = Arc::new(WsTransport::new("/_skiff", bus.inbound()));
        let (_tx_a, mut rx_a) = transport.sessions().add("a");
        let (_tx_b, mut rx_b) = transport.sessions().add("b");
        bus.add_transport(transport);

        let first = bus.broadcast("baz", "testing 123").await.unwrap();
        let second = bus.broadcast("baz", "testing 123").await.unwrap();
        assert_ne!(first.id, second.id);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.expect("first broadcast frame");
            let decoded = JsonMarshaler.unmarshal(frame.as_bytes()).unwrap();
            assert_eq!(decoded.channel, "baz");
            assert_eq!(decoded.body, "testing 123");
            assert_eq!(decoded.id, first.id);

            let frame = rx.recv().await.expect("second broadcast frame");
            let decoded = JsonMarshaler.unmarshal(frame.as_bytes()).unwrap();
            assert_eq!(decoded.id, second.id);
        }

        // Broadcasts also land in the channel log for poll-oriented clients.
        let logged = persister.get_messages("baz", 0).await.unwrap();
        assert_eq!(logged.len(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_every_live_session() {
        let (inbound_tx, _inbound_rx) = dispatch::inbound_queue_with_capacity(4);
        let transport = WsTransport::new("/_skiff", inbound_tx);

        let (_tx_a, mut rx_a) = transport.sessions().add("a");
        let (_tx_b, mut rx_b) = transport.sessions().add("b");

        let broadcast = Message::new("b1", "baz", "testing 123", 1412003438);
        transport.publish(broadcast).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.expect("frame delivered");
            let decoded = JsonMarshaler.unmarshal(frame.as_bytes()).unwrap();
            assert_eq!(decoded.id, "b1");
            assert_eq!(decoded.channel, "baz");
            assert_eq!(decoded.body, "testing 123");
        }
    }

    #[tokio::test]
    async fn responses_are_encoded_back_in_order() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (response_tx, response_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();

        let delivery = tokio::spawn(respond_over_session(
            "m1".to_string(),
            "foo".to_string(),
            response_rx,
            done_rx,
            outbound_tx,
            JsonMarshaler,
        ));

        response_tx.send("first".to_string()).await.unwrap();
        response_tx.send("second".to_string()).await.unwrap();
        done_tx.send(()).unwrap();

        let frame_one = outbound_rx.recv().await.expect("first frame");
        let frame_two = outbound_rx.recv().await.expect("second frame");
        delivery.await.unwrap();

        let first = JsonMarshaler.unmarshal(frame_one.as_bytes()).unwrap();
        let second = JsonMarshaler.unmarshal(frame_two.as_bytes()).unwrap();
        assert_eq!((first.id.as_str(), first.body.as_str()), ("m1", "first"));
        assert_eq!((second.id.as_str(), second.body.as_str()), ("m1", "second"));
        assert_eq!(first.channel, "foo");
        // Nothing further after completion.
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_stops_when_session_disappears() {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();

        // Session writer is gone before any response arrives.
        drop(outbound_rx);

        let delivery = tokio::spawn(respond_over_session(
            "m1".to_string(),
            "foo".to_string(),
            response_rx,
            done_rx,
            outbound_tx,
            JsonMarshaler,
        ));

        response_tx.send("lost".to_string()).await.unwrap();
        // The routine must terminate without the completion signal firing.
        delivery.await.unwrap();
        drop(done_tx);
    }
}
