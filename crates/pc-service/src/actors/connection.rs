//! `ConnectionActor` - per signaling channel outbound actor.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one client channel
//! - Serializes events and responses into frames, in mailbox order
//! - Closes the channel on `Close`, `Evict` or cancellation
//!
//! The coordinator never waits on a connection: events go through
//! `try_send`, and a full mailbox drops the event. Full snapshots repair
//! whatever a client missed. Responses are never dropped; they are sent from
//! per-request tasks that wait for mailbox capacity.

use crate::errors::PcError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::signaling::protocol::{ServerEvent, ServerFrame};

use common::types::ConnectionId;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default channel buffer size for the connection mailbox.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Write half of a client channel.
#[async_trait::async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), PcError>;

    async fn close(&mut self, reason: &str);
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<ActorMetrics>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue an event without waiting. Returns false if it was dropped.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        self.offer(ConnectionMessage::Event(event))
    }

    /// Queue a response, waiting for mailbox capacity. Responses are never
    /// dropped for a full mailbox; returns false only if the actor is gone.
    ///
    /// Must not be awaited from the coordinator loop.
    pub async fn respond(&self, id: u64, result: Value) -> bool {
        match self
            .sender
            .send(ConnectionMessage::Response { id, result })
            .await
        {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    target: "pc.actor.connection",
                    connection_id = %self.connection_id,
                    request_id = id,
                    "Response discarded, connection closed"
                );
                false
            }
        }
    }

    /// Tell the client it was evicted, then close. If the mailbox cannot
    /// take the message the actor is cancelled outright.
    pub fn evict(&self, reason: &str) {
        if !self.offer(ConnectionMessage::Evict {
            reason: reason.to_string(),
        }) {
            self.cancel();
        }
    }

    pub fn close(&self, reason: &str) {
        if !self.offer(ConnectionMessage::Close {
            reason: reason.to_string(),
        }) {
            self.cancel();
        }
    }

    fn offer(&self, message: ConnectionMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.mailbox.record_drop();
                self.metrics.record_event_dropped();
                false
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the actor has been cancelled or has closed the channel.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S: FrameSink> {
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    sink: S,
    /// Child of the coordinator's token.
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    is_closing: bool,
}

impl<S: FrameSink> ConnectionActor<S> {
    /// Spawn a new connection actor writing to `sink`.
    pub fn spawn(
        connection_id: ConnectionId,
        sink: S,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.as_str(),
        ));

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            sink,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
            metrics,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "pc.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "pc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.graceful_close("cancelled").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Let the reader side of the channel know we are gone.
        self.cancel_token.cancel();

        debug!(
            target: "pc.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Event(event) => {
                self.write(ServerFrame::Event(event)).await;
                false
            }
            ConnectionMessage::Response { id, result } => {
                self.write(ServerFrame::Response { id, result }).await;
                false
            }
            ConnectionMessage::Evict { reason } => {
                self.write(ServerFrame::Event(ServerEvent::Evicted {
                    reason: reason.clone(),
                }))
                .await;
                self.graceful_close(&reason).await;
                true
            }
            ConnectionMessage::Close { reason } => {
                self.graceful_close(&reason).await;
                true
            }
        }
    }

    async fn write(&mut self, frame: ServerFrame) {
        if self.is_closing {
            return;
        }

        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "pc.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Failed to serialize outbound frame"
                );
                return;
            }
        };

        if let Err(e) = self.sink.send_text(text).await {
            debug!(
                target: "pc.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Channel write failed, closing"
            );
            self.is_closing = true;
            self.cancel_token.cancel();
        }
    }

    async fn graceful_close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        debug!(
            target: "pc.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            "Closing connection"
        );
        self.sink.close(reason).await;
    }
}
