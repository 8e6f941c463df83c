//! HTTP adapter for the media server's control API.
//!
//! Every call carries the optional bearer token and is bounded by the
//! configured request timeout. A 404 on `DELETE` means the handle is already
//! gone and counts as a successful close.

use crate::media::codecs::{MediaCodec, RtpCapabilities};
use crate::media::engine::{
    ConsumerParams, EngineError, EngineHandle, MediaEngine, MediaKind, TransportDirection,
    TransportParams,
};
use crate::observability::metrics;
use common::secret::{ExposeSecret, SecretString};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Connect timeout for the engine API.
const ENGINE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Media engine client over JSON/HTTP.
#[derive(Clone)]
pub struct HttpMediaEngine {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanConsumeBody {
    can_consume: bool,
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

impl HttpMediaEngine {
    /// Create a new engine client.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(ENGINE_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                error!(target: "pc.media.engine", error = %e, "Failed to build HTTP client");
                EngineError::Unavailable(e.to_string())
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Send a request, timing it and mapping transport failures.
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, EngineError> {
        let started = Instant::now();
        let result = self.authorize(request).send().await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                let status = response.status();
                metrics::record_engine_call(
                    operation,
                    status.is_success() || status == StatusCode::NOT_FOUND,
                    elapsed,
                );
                Ok(response)
            }
            Err(e) => {
                metrics::record_engine_call(operation, false, elapsed);
                if e.is_timeout() {
                    warn!(target: "pc.media.engine", operation, "Engine request timed out");
                    Err(EngineError::Timeout)
                } else {
                    warn!(target: "pc.media.engine", operation, error = %e, "Engine request failed");
                    Err(EngineError::Unavailable(e.to_string()))
                }
            }
        }
    }

    /// Map a non-success status to `Rejected` with the engine's message.
    async fn check_status(
        operation: &'static str,
        response: Response,
    ) -> Result<Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("{operation} failed with status {}", status.as_u16()));

        debug!(target: "pc.media.engine", operation, status = %status, message = %message, "Engine rejected call");
        Err(EngineError::Rejected(message))
    }

    async fn decode<T: DeserializeOwned>(
        operation: &'static str,
        response: Response,
    ) -> Result<T, EngineError> {
        let response = Self::check_status(operation, response).await?;
        response.json::<T>().await.map_err(|e| {
            error!(target: "pc.media.engine", operation, error = %e, "Failed to parse engine response");
            EngineError::InvalidResponse(e.to_string())
        })
    }
}

#[async_trait::async_trait]
impl MediaEngine for HttpMediaEngine {
    #[instrument(skip_all, fields(codecs = codecs.len()))]
    async fn configure_router(&self, codecs: &[MediaCodec]) -> Result<(), EngineError> {
        let request = self
            .client
            .post(self.url("/router"))
            .json(&json!({ "mediaCodecs": codecs }));
        let response = self.send("configure_router", request).await?;
        Self::check_status("configure_router", response).await?;
        Ok(())
    }

    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, EngineError> {
        let request = self.client.get(self.url("/router/rtp-capabilities"));
        let response = self.send("rtp_capabilities", request).await?;
        Self::decode("rtp_capabilities", response).await
    }

    #[instrument(skip(self), fields(direction = direction.as_str()))]
    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportParams, EngineError> {
        let request = self
            .client
            .post(self.url("/transports"))
            .json(&json!({ "direction": direction }));
        let response = self.send("create_transport", request).await?;
        Self::decode("create_transport", response).await
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/connect")))
            .json(&json!({ "dtlsParameters": dtls_parameters }));
        let response = self.send("connect_transport", request).await?;
        Self::check_status("connect_transport", response).await?;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String, EngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/produce")))
            .json(&json!({ "kind": kind, "rtpParameters": rtp_parameters }));
        let response = self.send("produce", request).await?;
        let body: IdBody = Self::decode("produce", response).await?;
        Ok(body.id)
    }

    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, EngineError> {
        let request = self
            .client
            .post(self.url("/router/can-consume"))
            .json(&json!({ "producerId": producer_id, "rtpCapabilities": rtp_capabilities }));
        let response = self.send("can_consume", request).await?;
        let body: CanConsumeBody = Self::decode("can_consume", response).await?;
        Ok(body.can_consume)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/consume")))
            .json(&json!({
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities,
                "paused": paused,
            }));
        let response = self.send("consume", request).await?;
        Self::decode("consume", response).await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let request = self
            .client
            .post(self.url(&format!("/consumers/{consumer_id}/resume")));
        let response = self.send("resume_consumer", request).await?;
        Self::check_status("resume_consumer", response).await?;
        Ok(())
    }

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let path = match &handle {
            EngineHandle::Transport(id) => format!("/transports/{id}"),
            EngineHandle::Producer(id) => format!("/producers/{id}"),
            EngineHandle::Consumer(id) => format!("/consumers/{id}"),
        };
        let request = self.client.delete(self.url(&path));
        let response = self.send("close", request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(target: "pc.media.engine", handle = %handle, "Handle already closed at engine");
            return Ok(());
        }
        Self::check_status("close", response).await?;
        Ok(())
    }
}
