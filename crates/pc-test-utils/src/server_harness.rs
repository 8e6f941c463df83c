//! Test server harness for E2E testing
//!
//! Provides `TestPcServer` for spawning a real signaling server backed by a
//! [`MockMediaEngine`].

use crate::ws_client::TestClient;
use pc_service::actors::{ActorMetrics, CoordinatorActor, CoordinatorConfig, CoordinatorHandle};
use pc_service::config::Config;
use pc_service::media::engine::mock::MockMediaEngine;
use pc_service::media::MediaEngine;
use pc_service::signaling::{signaling_router, SignalingState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Test harness for spawning the Presence Coordinator in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_welcome() -> Result<(), anyhow::Error> {
///     let server = TestPcServer::spawn().await?;
///     let client = server.connect_client().await?;
///     assert!(!client.connection_id().as_str().is_empty());
///     Ok(())
/// }
/// ```
pub struct TestPcServer {
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
    engine: Arc<MockMediaEngine>,
    _handle: JoinHandle<()>,
}

impl TestPcServer {
    /// Coordinator settings built from a test environment.
    ///
    /// Delays are short so timer-driven behavior is observable in real time.
    pub fn test_config() -> Result<CoordinatorConfig, anyhow::Error> {
        let vars = HashMap::from([
            (
                "PC_MEDIA_ENGINE_URL".to_string(),
                "http://127.0.0.1:1".to_string(),
            ),
            ("PC_INSTANCE_ID".to_string(), "pc-test".to_string()),
            ("PC_CONSUMER_RESUME_DELAY_MS".to_string(), "50".to_string()),
            ("PC_FRESH_SNAPSHOT_DELAY_MS".to_string(), "50".to_string()),
        ]);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;
        Ok(CoordinatorConfig::from_config(&config))
    }

    /// Spawn a server with [`Self::test_config`].
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(Self::test_config()?).await
    }

    /// Spawn a server with explicit coordinator settings.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the signaling server in the background
    pub async fn spawn_with(config: CoordinatorConfig) -> Result<Self, anyhow::Error> {
        let engine = Arc::new(MockMediaEngine::new());
        let metrics = ActorMetrics::new();

        let (coordinator, _coordinator_task) = CoordinatorActor::start(
            config,
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::clone(&metrics),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start coordinator: {}", e))?;

        let app = signaling_router(SignalingState {
            coordinator: coordinator.clone(),
            metrics,
        });

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            coordinator,
            engine,
            _handle: handle,
        })
    }

    /// WebSocket URL of the signaling endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The mock engine behind the server.
    pub fn engine(&self) -> &MockMediaEngine {
        &self.engine
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Open a client connection and consume its `welcome` frame.
    pub async fn connect_client(&self) -> Result<TestClient, anyhow::Error> {
        TestClient::connect(&self.ws_url()).await
    }

    /// Poll the coordinator until `check` holds or `timeout` passes.
    pub async fn wait_for_status(
        &self,
        timeout: Duration,
        check: impl Fn(&pc_service::actors::CoordinatorStatus) -> bool,
    ) -> Result<pc_service::actors::CoordinatorStatus, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self
                .coordinator
                .get_status()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to get status: {}", e))?;
            if check(&status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Timed out waiting for status, last: {:?}", status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestPcServer {
    fn drop(&mut self) {
        self.coordinator.cancel();
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_and_welcomes() -> Result<(), anyhow::Error> {
        let server = TestPcServer::spawn().await?;

        assert!(server.addr().ip().is_loopback());
        assert!(server.ws_url().starts_with("ws://127.0.0.1:"));

        let client = server.connect_client().await?;
        assert!(!client.connection_id().as_str().is_empty());

        let status = server
            .wait_for_status(Duration::from_secs(2), |s| s.connection_count == 1)
            .await?;
        assert_eq!(status.session_count, 0);
        Ok(())
    }
}
