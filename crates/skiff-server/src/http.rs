//! HTTP poll transport.
//!
//! Stateless request/response surface: clients POST a message, get back a
//! poll URL, and retrieve accumulated responses with later GETs. Broadcasts
//! are visible purely through the persisted channel log, so `publish` is a
//! no-op here.
//!
//! Routes (mounted under the configured base URI):
//! - `POST {uri}` -- submit a message; 202 with `{id, channel, responses}`.
//! - `GET {uri}/message/{id}` -- current result; 404 for an unknown id.
//! - `GET {uri}/channel/{channel}?since=T` -- channel log, ascending.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use skiff_core::dispatch::{DeliverFn, MessageContext, ResponseEvent, ResponseFeed};
use skiff_core::marshal::{JsonMarshaler, Marshaler};
use skiff_core::persist::Persister;
use skiff_core::transport::Transport;
use skiff_types::{Message, MessageResult, PersistError, TransportError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Poll-oriented transport over HTTP.
pub struct HttpTransport<P> {
    uri: String,
    marshaler: JsonMarshaler,
    inbound: mpsc::Sender<MessageContext>,
    persister: Arc<P>,
}

struct HttpState<P> {
    uri: String,
    marshaler: JsonMarshaler,
    inbound: mpsc::Sender<MessageContext>,
    persister: Arc<P>,
}

impl<P> Clone for HttpState<P> {
    fn clone(&self) -> Self {
        Self {
            uri: self.uri.clone(),
            marshaler: self.marshaler,
            inbound: self.inbound.clone(),
            persister: Arc::clone(&self.persister),
        }
    }
}

impl<P: Persister + 'static> HttpTransport<P> {
    /// Name used in transport bindings.
    pub const NAME: &'static str = "http";

    pub fn new(
        uri: impl Into<String>,
        inbound: mpsc::Sender<MessageContext>,
        persister: Arc<P>,
    ) -> Self {
        Self {
            uri: uri.into(),
            marshaler: JsonMarshaler,
            inbound,
            persister,
        }
    }

    fn router(&self) -> Router {
        let state = HttpState {
            uri: self.uri.clone(),
            marshaler: self.marshaler,
            inbound: self.inbound.clone(),
            persister: Arc::clone(&self.persister),
        };

        // Mirror the caller's Origin and short-circuit preflight requests.
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods([
                Method::POST,
                Method::GET,
                Method::OPTIONS,
                Method::PUT,
                Method::DELETE,
            ])
            .allow_headers([
                ACCEPT,
                CONTENT_TYPE,
                CONTENT_LENGTH,
                ACCEPT_ENCODING,
                HeaderName::from_static("x-csrf-token"),
                AUTHORIZATION,
            ]);

        Router::new()
            .route(&self.uri, post(submit::<P>))
            .route(&format!("{}/message/{{id}}", self.uri), get(poll_result::<P>))
            .route(
                &format!("{}/channel/{{channel}}", self.uri),
                get(poll_channel::<P>),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

impl<P: Persister + 'static> Transport for HttpTransport<P> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn listen_and_serve(&self, addr: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(&addr).await?;
            axum::serve(listener, self.router()).await?;
            Ok(())
        })
    }

    /// Nothing to push: broadcasts were persisted to the channel log and are
    /// discoverable through polling.
    fn publish(&self, _message: Message) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// POST {uri} -- accept a message for dispatch and hand back a poll URL.
async fn submit<P: Persister + 'static>(
    State(state): State<HttpState<P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match state.marshaler.unmarshal(&body) {
        Ok(message) => message,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    // The result must exist before the context is admitted, so delivery
    // never races its creation.
    if let Err(err) = state
        .persister
        .save_result(&message.id, &MessageResult::pending())
        .await
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    let persister = Arc::clone(&state.persister);
    let deliver: DeliverFn = Box::new(move |id, channel, responses, done| {
        Box::pin(record_responses(id, channel, responses, done, persister))
    });

    let id = message.id.clone();
    let channel = message.channel.clone();
    if state
        .inbound
        .send(MessageContext { message, deliver })
        .await
        .is_err()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatcher unavailable".to_string(),
        )
            .into_response();
    }

    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let poll_url = format!("http://{host}{}/message/{id}", state.uri);

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "id": id,
            "channel": channel,
            "responses": poll_url,
        })),
    )
        .into_response()
}

/// GET {uri}/message/{id} -- the accumulated result for a message.
async fn poll_result<P: Persister>(
    State(state): State<HttpState<P>>,
    Path(id): Path<String>,
) -> Response {
    match state.persister.get_result(&id).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(PersistError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ChannelLogQuery {
    since: Option<String>,
}

/// GET {uri}/channel/{channel}?since=T -- broadcasts on a channel with
/// timestamp >= T, ascending.
async fn poll_channel<P: Persister>(
    State(state): State<HttpState<P>>,
    Path(channel): Path<String>,
    Query(query): Query<ChannelLogQuery>,
) -> Response {
    let since = match query.since.as_deref() {
        Some(raw) => match raw.parse::<i64>() {
            Ok(value) => value,
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        },
        None => 0,
    };

    match state.persister.get_messages(&channel, since).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(err) => {
            warn!(%channel, %err, "channel log lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Delivery routine bound to one message: append each response to the
/// persisted result, marking it done on completion. Persists after every
/// mutation so pollers see progress as it happens.
async fn record_responses<P: Persister>(
    id: String,
    channel: String,
    responses: mpsc::Receiver<String>,
    done: oneshot::Receiver<()>,
    persister: Arc<P>,
) {
    let mut result = match persister.get_result(&id).await {
        Ok(result) => result,
        Err(PersistError::NotFound) => MessageResult::pending(),
        Err(err) => {
            warn!(%id, %err, "cannot load result for delivery");
            return;
        }
    };

    let mut feed = ResponseFeed::new(responses, done);
    loop {
        match feed.next().await {
            ResponseEvent::Response(body) => {
                result.responses.push(Message::new(
                    id.clone(),
                    channel.clone(),
                    body,
                    Utc::now().timestamp(),
                ));
                if let Err(err) = persister.save_result(&id, &result).await {
                    warn!(%id, %err, "failed to persist response");
                }
            }
            ResponseEvent::Completed => {
                result.done = true;
                if let Err(err) = persister.save_result(&id, &result).await {
                    warn!(%id, %err, "failed to persist completion");
                }
                return;
            }
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
