//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::actors::connection::ConnectionHandle;
use crate::errors::PcError;
use crate::media::engine::{ConsumerParams, MediaKind, TransportDirection, TransportParams};
use crate::presence::PeerInfo;
use crate::sessions::SessionTicket;
use crate::signaling::protocol::{ClientRequest, Reply, ServerEvent};
use common::types::ConnectionId;
use serde_json::Value;
use tokio::sync::oneshot;

/// Reply channel of one client request.
pub type Responder = oneshot::Sender<Result<Reply, PcError>>;

/// Messages sent to `CoordinatorActor`.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A signaling channel opened.
    Connect {
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<Result<(), PcError>>,
    },

    /// A signaling channel closed. Idempotent.
    Disconnect { connection_id: ConnectionId },

    /// A client request. The reply may be sent after an engine round-trip.
    Request {
        connection_id: ConnectionId,
        request: ClientRequest,
        respond_to: Responder,
    },

    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },

    /// The current "who is live" snapshot.
    GetPresenceSnapshot {
        respond_to: oneshot::Sender<Vec<PeerInfo>>,
    },
}

/// Results and timers fed back into the coordinator from tasks it spawned.
///
/// Engine results carry the [`SessionTicket`] of the session they were
/// started for and are registered only if that session is still installed.
#[derive(Debug)]
pub enum InternalEvent {
    TransportCreated {
        ticket: SessionTicket,
        direction: TransportDirection,
        params: TransportParams,
        respond_to: Responder,
    },

    ProducerCreated {
        ticket: SessionTicket,
        transport_id: String,
        kind: MediaKind,
        producer_id: String,
        respond_to: Responder,
    },

    ConsumerCreated {
        ticket: SessionTicket,
        transport_id: String,
        consumer: ConsumerParams,
        respond_to: Responder,
    },

    /// Resume delay for a paused consumer elapsed.
    ResumeDue {
        ticket: SessionTicket,
        consumer_id: String,
    },

    /// Delayed snapshot after a fresh connection.
    FreshSnapshotDue { connection_id: ConnectionId },
}

/// Snapshot of coordinator state (for health and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub connection_count: usize,
    pub session_count: usize,
    pub streaming_count: usize,
    pub is_shutting_down: bool,
    pub mailbox_depth: usize,
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Push an event to the client.
    Event(ServerEvent),

    /// Answer a request that carried a correlation id.
    Response { id: u64, result: Value },

    /// Send `evicted`, then close.
    Evict { reason: String },

    /// Close the channel.
    Close { reason: String },
}
