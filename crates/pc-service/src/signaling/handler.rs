//! WebSocket signaling endpoint.
//!
//! One task per socket reads frames and feeds them to the coordinator in
//! arrival order. Writes go through the socket's [`ConnectionActor`], so
//! events and responses share one ordered outbound queue.

use crate::actors::connection::{ConnectionActor, ConnectionHandle, FrameSink};
use crate::actors::coordinator::CoordinatorHandle;
use crate::actors::metrics::{ActorMetrics, ActorType};
use crate::errors::PcError;
use crate::observability::metrics;
use crate::signaling::protocol::{response_payload, ClientRequest, RequestFrame};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Shared state of the signaling router.
#[derive(Clone)]
pub struct SignalingState {
    pub coordinator: CoordinatorHandle,
    pub metrics: Arc<ActorMetrics>,
}

/// Build the signaling router (`GET /ws`).
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(State(state): State<SignalingState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Write half of an axum WebSocket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), PcError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| PcError::Internal(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Owned(reason.to_string()),
        };
        let _ = self.0.send(Message::Close(Some(frame))).await;
        let _ = SinkExt::close(&mut self.0).await;
    }
}

#[instrument(skip_all, name = "pc.signaling.socket", fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = ConnectionId::new();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (sink, mut stream) = socket.split();
    let (connection, task) = ConnectionActor::spawn(
        connection_id.clone(),
        WsSink(sink),
        state.coordinator.child_token(),
        Arc::clone(&state.metrics),
    );

    if let Err(e) = state.coordinator.connect(connection.clone()).await {
        info!(
            target: "pc.signaling",
            connection_id = %connection_id,
            error = %e,
            "Connection refused"
        );
        connection.close(&e.client_message());
        let _ = task.await;
        return;
    }

    info!(
        target: "pc.signaling",
        connection_id = %connection_id,
        "Signaling channel opened"
    );

    loop {
        tokio::select! {
            () = connection.closed() => break,

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&state.coordinator, &connection, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "pc.signaling",
                            connection_id = %connection_id,
                            error = %e,
                            "Socket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    state.coordinator.disconnect(connection_id.clone()).await;
    connection.cancel();
    if let Err(e) = task.await {
        if e.is_panic() {
            state.metrics.record_panic(ActorType::Connection);
        }
    }

    info!(
        target: "pc.signaling",
        connection_id = %connection_id,
        "Signaling channel closed"
    );
}

/// Parse one text frame and hand it to the coordinator.
///
/// Only the enqueue is awaited here, so the next frame cannot overtake this
/// one. The reply is awaited in a separate task.
async fn dispatch(coordinator: &CoordinatorHandle, connection: &ConnectionHandle, text: &str) {
    let frame: RequestFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            metrics::record_request("invalid", false);
            reject(
                connection,
                RequestFrame::recover_id(text),
                PcError::Validation(format!("Malformed request: {e}")),
            )
            .await;
            return;
        }
    };

    let request = match ClientRequest::parse(&frame.method, frame.params) {
        Ok(request) => request,
        Err(e) => {
            metrics::record_request("invalid", false);
            reject(connection, frame.id, e).await;
            return;
        }
    };
    let method = request.method();

    let pending = match coordinator
        .submit(connection.connection_id().clone(), request)
        .await
    {
        Ok(pending) => pending,
        Err(e) => {
            metrics::record_request(method, false);
            reject(connection, frame.id, e).await;
            return;
        }
    };

    let connection = connection.clone();
    let id = frame.id;
    tokio::spawn(async move {
        let result = pending
            .await
            .unwrap_or_else(|_| Err(PcError::Internal("request dropped".to_string())));
        metrics::record_request(method, result.is_ok());

        if let Err(e) = &result {
            debug!(
                target: "pc.signaling",
                connection_id = %connection.connection_id(),
                method = method,
                error = %e,
                "Request failed"
            );
        }
        if let Some(id) = id {
            connection.respond(id, response_payload(result)).await;
        }
    });
}

async fn reject(connection: &ConnectionHandle, id: Option<u64>, error: PcError) {
    match id {
        Some(id) => {
            connection.respond(id, response_payload(Err(error))).await;
        }
        None => {
            debug!(
                target: "pc.signaling",
                connection_id = %connection.connection_id(),
                error = %error,
                "Dropping malformed frame without id"
            );
        }
    }
}
