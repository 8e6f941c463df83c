//! External media engine seam.
//!
//! [`MediaEngine`] is the only way the coordinator touches media resources.
//! The production adapter is [`crate::media::http_engine::HttpMediaEngine`];
//! tests use [`mock::MockMediaEngine`].

use crate::media::codecs::{MediaCodec, RtpCapabilities};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors returned by the media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine answered and refused the call. The message is the
    /// engine's own and is surfaced to clients verbatim.
    #[error("{0}")]
    Rejected(String),

    /// The engine could not be reached.
    #[error("Media engine unavailable")]
    Unavailable(String),

    /// The call did not finish within the configured timeout.
    #[error("Media engine request timed out")]
    Timeout,

    /// The engine answered with a body we could not decode.
    #[error("Unexpected media engine response")]
    InvalidResponse(String),
}

/// Transport direction relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

/// Descriptor of a freshly created consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// A handle owned by a session, as needed to close it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EngineHandle {
    Transport(String),
    Producer(String),
    Consumer(String),
}

impl EngineHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineHandle::Transport(_) => "transport",
            EngineHandle::Producer(_) => "producer",
            EngineHandle::Consumer(_) => "consumer",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EngineHandle::Transport(id) | EngineHandle::Producer(id) | EngineHandle::Consumer(id) => {
                id
            }
        }
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Operations the coordinator needs from the selective-forwarding engine.
///
/// `close` must be idempotent: closing a handle the engine no longer knows
/// is not an error.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Configure the router with the fixed codec set. Called once at startup.
    async fn configure_router(&self, codecs: &[MediaCodec]) -> Result<(), EngineError>;

    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, EngineError>;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError>;

    /// Returns the new producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String, EngineError>;

    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError>;
}

/// In-memory media engine for tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Mutex, PoisonError};
    use tokio::sync::Notify;

    /// One recorded engine call.
    #[derive(Debug, Clone, PartialEq)]
    pub enum EngineCall {
        ConfigureRouter(usize),
        RtpCapabilities,
        CreateTransport(TransportDirection),
        ConnectTransport(String),
        Produce { transport_id: String, kind: MediaKind },
        CanConsume(String),
        Consume { transport_id: String, producer_id: String, paused: bool },
        ResumeConsumer(String),
        Close(EngineHandle),
    }

    /// Mock engine that hands out sequential ids and records every call.
    ///
    /// `hold_consume` parks `consume` until `release_consume` is called, so
    /// tests can change coordinator state while a consume is in flight.
    pub struct MockMediaEngine {
        next_id: AtomicU64,
        calls: Mutex<Vec<EngineCall>>,
        failures: Mutex<HashMap<&'static str, String>>,
        can_consume: AtomicBool,
        hold_consume: AtomicBool,
        /// Notified when a `consume` call enters the engine.
        pub consume_started: Notify,
        consume_gate: Notify,
        capabilities: Mutex<RtpCapabilities>,
    }

    impl Default for MockMediaEngine {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockMediaEngine {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                can_consume: AtomicBool::new(true),
                hold_consume: AtomicBool::new(false),
                consume_started: Notify::new(),
                consume_gate: Notify::new(),
                capabilities: Mutex::new(default_router_capabilities()),
            }
        }

        /// Make `can_consume` answer `value`.
        pub fn set_can_consume(&self, value: bool) {
            self.can_consume.store(value, Ordering::SeqCst);
        }

        /// Make every call to `operation` fail with `Rejected(message)`.
        ///
        /// Operation names match [`EngineCall`] in snake case
        /// (`create_transport`, `produce`, `consume`, ...).
        pub fn fail(&self, operation: &'static str, message: &str) {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(operation, message.to_string());
        }

        pub fn hold_consume(&self) {
            self.hold_consume.store(true, Ordering::SeqCst);
        }

        pub fn release_consume(&self) {
            self.hold_consume.store(false, Ordering::SeqCst);
            self.consume_gate.notify_waiters();
            self.consume_gate.notify_one();
        }

        pub fn set_router_capabilities(&self, capabilities: RtpCapabilities) {
            *self
                .capabilities
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = capabilities;
        }

        pub fn calls(&self) -> Vec<EngineCall> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Every handle closed so far, in close order.
        pub fn closed(&self) -> Vec<EngineHandle> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    EngineCall::Close(handle) => Some(handle),
                    _ => None,
                })
                .collect()
        }

        pub fn close_count(&self, handle: &EngineHandle) -> usize {
            self.closed().iter().filter(|h| *h == handle).count()
        }

        fn record(&self, call: EngineCall) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
        }

        fn check(&self, operation: &'static str) -> Result<(), EngineError> {
            match self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(operation)
            {
                Some(message) => Err(EngineError::Rejected(message.clone())),
                None => Ok(()),
            }
        }

        fn mint(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn default_router_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: crate::media::codecs::configured_codecs(1000)
                .into_iter()
                .zip([100u8, 101u8])
                .map(|(mut codec, pt)| {
                    codec.preferred_payload_type = Some(pt);
                    codec
                })
                .collect(),
            header_extensions: Vec::new(),
        }
    }

    #[async_trait::async_trait]
    impl MediaEngine for MockMediaEngine {
        async fn configure_router(&self, codecs: &[MediaCodec]) -> Result<(), EngineError> {
            self.record(EngineCall::ConfigureRouter(codecs.len()));
            self.check("configure_router")
        }

        async fn rtp_capabilities(&self) -> Result<RtpCapabilities, EngineError> {
            self.record(EngineCall::RtpCapabilities);
            self.check("rtp_capabilities")?;
            Ok(self
                .capabilities
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        }

        async fn create_transport(
            &self,
            direction: TransportDirection,
        ) -> Result<TransportParams, EngineError> {
            self.record(EngineCall::CreateTransport(direction));
            self.check("create_transport")?;
            Ok(TransportParams {
                id: self.mint("transport"),
                ice_parameters: serde_json::json!({"usernameFragment": "mock", "password": "mock"}),
                ice_candidates: serde_json::json!([]),
                dtls_parameters: serde_json::json!({"role": "auto", "fingerprints": []}),
                sctp_parameters: None,
            })
        }

        async fn connect_transport(
            &self,
            transport_id: &str,
            _dtls_parameters: Value,
        ) -> Result<(), EngineError> {
            self.record(EngineCall::ConnectTransport(transport_id.to_string()));
            self.check("connect_transport")
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            _rtp_parameters: Value,
        ) -> Result<String, EngineError> {
            self.record(EngineCall::Produce {
                transport_id: transport_id.to_string(),
                kind,
            });
            self.check("produce")?;
            Ok(self.mint("producer"))
        }

        async fn can_consume(
            &self,
            producer_id: &str,
            _rtp_capabilities: &Value,
        ) -> Result<bool, EngineError> {
            self.record(EngineCall::CanConsume(producer_id.to_string()));
            self.check("can_consume")?;
            Ok(self.can_consume.load(Ordering::SeqCst))
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            _rtp_capabilities: Value,
            paused: bool,
        ) -> Result<ConsumerParams, EngineError> {
            self.record(EngineCall::Consume {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused,
            });
            self.consume_started.notify_one();
            if self.hold_consume.load(Ordering::SeqCst) {
                self.consume_gate.notified().await;
            }
            self.check("consume")?;
            Ok(ConsumerParams {
                id: self.mint("consumer"),
                producer_id: producer_id.to_string(),
                kind: MediaKind::Video,
                rtp_parameters: serde_json::json!({"codecs": []}),
            })
        }

        async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
            self.record(EngineCall::ResumeConsumer(consumer_id.to_string()));
            self.check("resume_consumer")
        }

        async fn close(&self, handle: EngineHandle) -> Result<(), EngineError> {
            self.record(EngineCall::Close(handle));
            self.check("close")
        }
    }

}
