//! Signaling wire protocol.
//!
//! JSON text frames over a WebSocket:
//!
//! - request: `{"id": 7, "method": "produce", "params": {...}}` (`id` optional)
//! - response: `{"type": "response", "id": 7, "result": {...}}`
//! - event: `{"type": "event", "name": "newProducer", "data": {...}}`
//!
//! Failed requests answer `{"error": "<message>", "code": <i32>}` as their
//! result.

use crate::errors::PcError;
use crate::media::codecs::RtpCapabilities;
use crate::media::engine::{MediaKind, TransportDirection, TransportParams};
use crate::presence::{PeerInfo, PresenceDelta, PresenceSettings, PresenceUpdate};
use common::types::ConnectionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Raw inbound frame before method dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    /// Best-effort recovery of the correlation id from a frame that failed
    /// to parse, so the error can still be answered.
    pub fn recover_id(text: &str) -> Option<u64> {
        serde_json::from_str::<Value>(text)
            .ok()?
            .get("id")
            .and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stable_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTransportParams {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportParams {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub producer_id: String,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    pub connection_id: ConnectionId,
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Register(RegisterParams),
    GetCapabilities,
    OpenTransport(OpenTransportParams),
    ConnectTransport(ConnectTransportParams),
    Produce(ProduceParams),
    Consume(ConsumeParams),
    Resume(ConsumerRef),
    CloseProducer(ProducerRef),
    UpdateStreamState(PresenceUpdate),
    GetPeerProducers(PeerRef),
    GetPeersList,
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, PcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| PcError::Validation(format!("Invalid params for {method}: {e}")))
}

impl ClientRequest {
    /// Map a method name and its params onto a request.
    ///
    /// # Errors
    ///
    /// `PcError::Validation` for unknown methods or params that do not
    /// match the method's shape.
    pub fn parse(method: &str, raw: Value) -> Result<Self, PcError> {
        let request = match method {
            "register" => ClientRequest::Register(params(method, raw)?),
            "getCapabilities" => ClientRequest::GetCapabilities,
            "openTransport" => ClientRequest::OpenTransport(params(method, raw)?),
            "connectTransport" => ClientRequest::ConnectTransport(params(method, raw)?),
            "produce" => ClientRequest::Produce(params(method, raw)?),
            "consume" => ClientRequest::Consume(params(method, raw)?),
            "resume" => ClientRequest::Resume(params(method, raw)?),
            "closeProducer" => ClientRequest::CloseProducer(params(method, raw)?),
            "updateStreamState" => {
                let update: PresenceUpdate = params(method, raw)?;
                update.validate()?;
                ClientRequest::UpdateStreamState(update)
            }
            "getPeerProducers" => ClientRequest::GetPeerProducers(params(method, raw)?),
            "getPeersList" => ClientRequest::GetPeersList,
            other => return Err(PcError::Validation(format!("Unknown method: {other}"))),
        };
        Ok(request)
    }

    /// Method name, used as a metric label.
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Register(_) => "register",
            ClientRequest::GetCapabilities => "getCapabilities",
            ClientRequest::OpenTransport(_) => "openTransport",
            ClientRequest::ConnectTransport(_) => "connectTransport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::Consume(_) => "consume",
            ClientRequest::Resume(_) => "resume",
            ClientRequest::CloseProducer(_) => "closeProducer",
            ClientRequest::UpdateStreamState(_) => "updateStreamState",
            ClientRequest::GetPeerProducers(_) => "getPeerProducers",
            ClientRequest::GetPeersList => "getPeersList",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub owner_connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub id: String,
}

/// Successful request results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack(Ack),
    Capabilities(RtpCapabilities),
    Transport(TransportParams),
    Produced(Created),
    Consumed(ConsumeReply),
    PeerProducers(Vec<ProducerSummary>),
    Peers(Vec<PeerInfo>),
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Reply::Ack(Ack { ok: true })
    }
}

/// Events pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Welcome { connection_id: ConnectionId },

    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        kind: MediaKind,
        owner_connection_id: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        owner_connection_id: ConnectionId,
    },

    PresenceSnapshot { list: Vec<PeerInfo> },

    PresenceDelta(PresenceDelta),

    /// Asks the client to re-assert its stream state; carries what the
    /// coordinator currently holds for it.
    #[serde(rename_all = "camelCase")]
    ResyncStreamState {
        is_streaming: bool,
        settings: PresenceSettings,
        platform: Option<String>,
    },

    Evicted { reason: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Welcome { .. } => "welcome",
            ServerEvent::NewProducer { .. } => "newProducer",
            ServerEvent::ProducerClosed { .. } => "producerClosed",
            ServerEvent::PresenceSnapshot { .. } => "presenceSnapshot",
            ServerEvent::PresenceDelta(_) => "presenceDelta",
            ServerEvent::ResyncStreamState { .. } => "resyncStreamState",
            ServerEvent::Evicted { .. } => "evicted",
        }
    }
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Response { id: u64, result: Value },
    Event(ServerEvent),
}

impl ServerFrame {
    /// Serialize to the JSON text sent on the socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            ServerFrame::Response { id, result } => {
                json!({ "type": "response", "id": id, "result": result })
            }
            ServerFrame::Event(event) => {
                let mut value = serde_json::to_value(event)?;
                if let Some(object) = value.as_object_mut() {
                    object.insert("type".to_string(), Value::from("event"));
                }
                value
            }
        };
        serde_json::to_string(&value)
    }
}

/// Build a response `result` from a request outcome.
pub fn response_payload(result: Result<Reply, PcError>) -> Value {
    match result.and_then(|reply| {
        serde_json::to_value(reply).map_err(|e| PcError::Internal(e.to_string()))
    }) {
        Ok(value) => value,
        Err(e) => json!({ "error": e.client_message(), "code": e.error_code() }),
    }
}
