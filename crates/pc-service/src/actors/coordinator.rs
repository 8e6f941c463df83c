//! `CoordinatorActor` - singleton owner of all presence and session state.
//!
//! The coordinator is the single logical thread of the service:
//!
//! - Owns the identity registry, the session store and the connection map
//! - Runs every state transition to completion inside one message handler
//! - Hands engine calls to spawned tasks; their results come back on an
//!   internal channel and are re-validated before registration
//! - Owns the root `CancellationToken`; connection actors hold children
//!
//! # Graceful Shutdown
//!
//! On cancellation the coordinator:
//! 1. Removes every session and releases its engine handles
//! 2. Closes every connection
//! 3. Waits (bounded) for the engine closes to finish

use crate::config::Config;
use crate::errors::PcError;
use crate::media::codecs::{configured_codecs, MediaCodec};
use crate::media::engine::{EngineError, MediaEngine, MediaKind};
use crate::media::lifecycle::MediaLifecycle;
use crate::observability::metrics;
use crate::presence::{self, compute_roster, compute_snapshot, PeerInfo, PresenceDelta};
use crate::registry::IdentityRegistry;
use crate::sessions::{ConsumerHandle, PeerSession, SessionStore};
use crate::signaling::protocol::{ClientRequest, ProducerSummary, RegisterParams, Reply, ServerEvent};

use super::connection::ConnectionHandle;
use super::messages::{CoordinatorMessage, CoordinatorStatus, InternalEvent, Responder};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 1000;

/// Buffer for engine completions and timers.
const INTERNAL_CHANNEL_BUFFER: usize = 1000;

/// Upper bound on waiting for engine closes during shutdown.
const SHUTDOWN_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent to a connection replaced by a newer one of the same identity.
pub const EVICTION_REASON: &str = "Signed in from another connection";

/// Coordinator settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub max_connections: usize,
    pub consumer_resume_delay: Duration,
    pub fresh_snapshot_delay: Duration,
    pub codecs: Vec<MediaCodec>,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            max_connections: config.max_connections,
            consumer_resume_delay: config.consumer_resume_delay,
            fresh_snapshot_delay: config.fresh_snapshot_delay,
            codecs: configured_codecs(config.video_start_bitrate_kbps),
        }
    }
}

/// Handle to the `CoordinatorActor`.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl CoordinatorHandle {
    async fn send(&self, message: CoordinatorMessage) -> Result<(), PcError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| PcError::Internal(format!("channel send failed: {e}")))
    }

    /// Attach a freshly opened channel.
    ///
    /// Fails with `CapacityExceeded` when the connection cap is reached.
    pub async fn connect(&self, connection: ConnectionHandle) -> Result<(), PcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Connect {
            connection,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| PcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Detach a closed channel and tear down its session. Idempotent.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        if let Err(e) = self
            .send(CoordinatorMessage::Disconnect {
                connection_id: connection_id.clone(),
            })
            .await
        {
            debug!(
                target: "pc.actor.coordinator",
                connection_id = %connection_id,
                error = %e,
                "Disconnect after coordinator stopped"
            );
        }
    }

    /// Queue a request and return its reply channel.
    ///
    /// Requests are handled in the order they were submitted; the reply
    /// may arrive later if the request needs an engine round-trip.
    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        request: ClientRequest,
    ) -> Result<oneshot::Receiver<Result<Reply, PcError>>, PcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Request {
            connection_id,
            request,
            respond_to: tx,
        })
        .await?;
        Ok(rx)
    }

    /// Submit a request and wait for its reply.
    pub async fn request(
        &self,
        connection_id: ConnectionId,
        request: ClientRequest,
    ) -> Result<Reply, PcError> {
        self.submit(connection_id, request)
            .await?
            .await
            .map_err(|e| PcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<CoordinatorStatus, PcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| PcError::Internal(format!("response receive failed: {e}")))
    }

    /// The current deduplicated "who is live" list.
    pub async fn presence_snapshot(&self) -> Result<Vec<PeerInfo>, PcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetPresenceSnapshot { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| PcError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor. It releases all sessions before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for a connection actor.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `CoordinatorActor` implementation.
pub struct CoordinatorActor {
    instance_id: String,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Completions from spawned engine calls and timers.
    internal_rx: mpsc::Receiver<InternalEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,
    cancel_token: CancellationToken,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    registry: IdentityRegistry,
    store: SessionStore,
    lifecycle: MediaLifecycle,
    max_connections: usize,
    fresh_snapshot_delay: Duration,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl CoordinatorActor {
    /// Configure the engine router, then spawn the actor.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the router cannot be configured; nothing
    /// is spawned in that case.
    pub async fn start(
        config: CoordinatorConfig,
        engine: Arc<dyn MediaEngine>,
        metrics: Arc<ActorMetrics>,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>), EngineError> {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let lifecycle = MediaLifecycle::new(
            engine,
            internal_tx.clone(),
            config.codecs,
            config.consumer_resume_delay,
        );
        lifecycle.configure_router().await?;

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Coordinator, config.instance_id.as_str()),
            instance_id: config.instance_id,
            receiver,
            internal_rx,
            internal_tx,
            cancel_token: cancel_token.clone(),
            connections: HashMap::new(),
            registry: IdentityRegistry::new(),
            store: SessionStore::new(),
            lifecycle,
            max_connections: config.max_connections,
            fresh_snapshot_delay: config.fresh_snapshot_delay,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        Ok((
            CoordinatorHandle {
                sender,
                cancel_token,
            },
            task_handle,
        ))
    }

    #[instrument(skip_all, name = "pc.actor.coordinator", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "pc.actor.coordinator",
            instance_id = %self.instance_id,
            "CoordinatorActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "pc.actor.coordinator",
                        instance_id = %self.instance_id,
                        "CoordinatorActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message);
                        }
                        None => {
                            info!(
                                target: "pc.actor.coordinator",
                                instance_id = %self.instance_id,
                                "CoordinatorActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event);
                }
            }
        }

        info!(
            target: "pc.actor.coordinator",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "CoordinatorActor stopped"
        );
    }

    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Connect {
                connection,
                respond_to,
            } => {
                let result = self.connect(connection);
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::Disconnect { connection_id } => {
                self.disconnect(&connection_id);
            }

            CoordinatorMessage::Request {
                connection_id,
                request,
                respond_to,
            } => {
                self.handle_request(&connection_id, request, respond_to);
            }

            CoordinatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            CoordinatorMessage::GetPresenceSnapshot { respond_to } => {
                let _ = respond_to.send(compute_snapshot(self.store.presence_states()));
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TransportCreated {
                ticket,
                direction,
                params,
                respond_to,
            } => {
                self.lifecycle.complete_transport(
                    &mut self.store,
                    &ticket,
                    direction,
                    params,
                    respond_to,
                );
            }

            InternalEvent::ProducerCreated {
                ticket,
                transport_id,
                kind,
                producer_id,
                respond_to,
            } => {
                let created = self.lifecycle.complete_produce(
                    &mut self.store,
                    &ticket,
                    transport_id,
                    kind,
                    producer_id,
                    respond_to,
                );
                if let Some(created) = created {
                    self.announce_producer(&created.owner, &created.producer.id, created.producer.kind);
                }
            }

            InternalEvent::ConsumerCreated {
                ticket,
                transport_id,
                consumer,
                respond_to,
            } => {
                self.lifecycle.complete_consume(
                    &mut self.store,
                    &ticket,
                    transport_id,
                    consumer,
                    respond_to,
                );
            }

            InternalEvent::ResumeDue {
                ticket,
                consumer_id,
            } => {
                self.lifecycle.resume_due(&self.store, &ticket, consumer_id);
            }

            InternalEvent::FreshSnapshotDue { connection_id } => {
                if self.connections.contains_key(&connection_id) {
                    self.broadcast_snapshot();
                }
            }
        }
    }

    fn handle_request(
        &mut self,
        connection_id: &ConnectionId,
        request: ClientRequest,
        respond_to: Responder,
    ) {
        match request {
            ClientRequest::Register(params) => {
                let _ = respond_to.send(self.register(connection_id, params));
            }
            ClientRequest::GetCapabilities => {
                self.lifecycle.get_capabilities(respond_to);
            }
            ClientRequest::OpenTransport(params) => {
                self.lifecycle
                    .open_transport(&self.store, connection_id, params.direction, respond_to);
            }
            ClientRequest::ConnectTransport(params) => {
                self.lifecycle.connect_transport(
                    &self.store,
                    connection_id,
                    params.transport_id,
                    params.dtls_parameters,
                    respond_to,
                );
            }
            ClientRequest::Produce(params) => {
                self.lifecycle.produce(
                    &self.store,
                    connection_id,
                    params.kind,
                    params.rtp_parameters,
                    respond_to,
                );
            }
            ClientRequest::Consume(params) => {
                self.lifecycle.consume(
                    &self.store,
                    connection_id,
                    params.producer_id,
                    params.rtp_capabilities,
                    respond_to,
                );
            }
            ClientRequest::Resume(params) => {
                self.lifecycle
                    .resume(&self.store, connection_id, params.consumer_id, respond_to);
            }
            ClientRequest::CloseProducer(params) => {
                let _ = respond_to.send(self.close_producer(connection_id, &params.producer_id));
            }
            ClientRequest::UpdateStreamState(update) => {
                let result = match self.store.update_presence(connection_id, &update) {
                    None => Err(PcError::SessionGone),
                    Some(changed) => {
                        if changed {
                            self.broadcast_update(connection_id);
                        }
                        Ok(Reply::ok())
                    }
                };
                let _ = respond_to.send(result);
            }
            ClientRequest::GetPeerProducers(params) => {
                let producers = self.peer_producers(&params.connection_id);
                let _ = respond_to.send(Ok(Reply::PeerProducers(producers)));
            }
            ClientRequest::GetPeersList => {
                let roster = compute_roster(self.store.presence_states());
                let _ = respond_to.send(Ok(Reply::Peers(roster)));
            }
        }
    }

    fn connect(&mut self, connection: ConnectionHandle) -> Result<(), PcError> {
        if self.connections.len() >= self.max_connections {
            warn!(
                target: "pc.actor.coordinator",
                connection_id = %connection.connection_id(),
                max_connections = self.max_connections,
                "Connection rejected, at capacity"
            );
            return Err(PcError::CapacityExceeded);
        }

        let connection_id = connection.connection_id().clone();
        connection.deliver(ServerEvent::Welcome {
            connection_id: connection_id.clone(),
        });
        self.connections.insert(connection_id.clone(), connection);
        self.update_gauges();

        let internal = self.internal_tx.clone();
        let delay = self.fresh_snapshot_delay;
        let timer_connection_id = connection_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal
                .send(InternalEvent::FreshSnapshotDue {
                    connection_id: timer_connection_id,
                })
                .await;
        });

        debug!(
            target: "pc.actor.coordinator",
            connection_id = %connection_id,
            total_connections = self.connections.len(),
            "Connection attached"
        );
        Ok(())
    }

    fn disconnect(&mut self, connection_id: &ConnectionId) {
        let attached = self.connections.remove(connection_id);
        let _ = self.disconnect_flow(connection_id);

        if let Some(handle) = attached {
            handle.cancel();
            self.update_gauges();
            debug!(
                target: "pc.actor.coordinator",
                connection_id = %connection_id,
                total_connections = self.connections.len(),
                "Connection detached"
            );
        }
    }

    /// Register (or re-register) a connection under a durable identity.
    ///
    /// Runs start to finish without suspending: resolve, evict the previous
    /// owner of the identity, install the session, announce.
    fn register(
        &mut self,
        connection_id: &ConnectionId,
        params: RegisterParams,
    ) -> Result<Reply, PcError> {
        if !self.connections.contains_key(connection_id) {
            return Err(PcError::SessionGone);
        }

        let identity = self.registry.resolve(
            connection_id,
            params.stable_user_id.as_deref(),
            params.name.as_deref(),
        );

        // Captured before eviction removes the previous owner's presence.
        let carried = self
            .store
            .presence_for_identity(&identity.stable_id)
            .cloned();

        let evicted = self
            .registry
            .eviction_target(&identity.stable_id, connection_id)
            .cloned();
        if let Some(target) = &evicted {
            self.evict(target);
        }

        let previous_stable_id = self
            .store
            .session(connection_id)
            .map(|session| session.stable_id.clone());
        if let Some(previous) = &previous_stable_id {
            if *previous != identity.stable_id {
                self.registry.unbind(previous, connection_id);
            }
        }
        self.registry.bind(&identity.stable_id, connection_id);

        let (_, replaced) = self.store.create_or_replace(
            connection_id,
            identity.stable_id.clone(),
            identity.display_name.clone(),
            carried.as_ref(),
        );
        if let Some(mut replaced) = replaced {
            let _ = self.release_session(&mut replaced);
        }

        if let Some(state) = self.store.presence(connection_id) {
            let peer = state.peer_info();
            let delta = if previous_stable_id.is_some() {
                PresenceDelta::Update { peer }
            } else {
                PresenceDelta::Join { peer }
            };
            presence::broadcast_delta(&self.connections, connection_id, &delta);

            if let Some(handle) = self.connections.get(connection_id) {
                handle.deliver(ServerEvent::ResyncStreamState {
                    is_streaming: state.is_streaming,
                    settings: state.settings,
                    platform: state.platform.clone(),
                });
            }
        }
        self.broadcast_snapshot();
        self.update_gauges();

        info!(
            target: "pc.actor.coordinator",
            connection_id = %connection_id,
            stable_id = %identity.stable_id,
            re_register = previous_stable_id.is_some(),
            evicted = evicted.is_some(),
            carried_forward = carried.is_some(),
            "Connection registered"
        );

        Ok(Reply::ok())
    }

    /// Force a connection off. A no-op if it is already gone.
    fn evict(&mut self, target: &ConnectionId) {
        metrics::record_eviction();
        if let Some(handle) = self.connections.remove(target) {
            handle.evict(EVICTION_REASON);
        }
        let _ = self.disconnect_flow(target);

        info!(
            target: "pc.actor.coordinator",
            connection_id = %target,
            "Evicted connection replaced by a newer one"
        );
    }

    /// Remove the connection's session and announce its departure.
    ///
    /// The session leaves the store before any handle is closed. Returns
    /// the release task, if there was anything to release.
    fn disconnect_flow(&mut self, connection_id: &ConnectionId) -> Option<JoinHandle<()>> {
        let mut removed = self.store.remove(connection_id)?;
        self.registry
            .unbind(&removed.session.stable_id, connection_id);

        let release = self.release_session(&mut removed.session);

        presence::broadcast_delta(
            &self.connections,
            connection_id,
            &PresenceDelta::Leave {
                id: connection_id.clone(),
            },
        );
        self.broadcast_snapshot();
        self.update_gauges();

        release
    }

    /// Close everything a removed session owned, including other sessions'
    /// consumers of its producers.
    fn release_session(&mut self, session: &mut PeerSession) -> Option<JoinHandle<()>> {
        let teardown = self.lifecycle.release_all(&mut self.store, session);
        self.notify_producer_closed(&session.connection_id, &teardown.detached);
        teardown.task
    }

    fn notify_producer_closed(
        &self,
        owner: &ConnectionId,
        detached: &[(ConnectionId, ConsumerHandle)],
    ) {
        for (viewer, consumer) in detached {
            if let Some(handle) = self.connections.get(viewer) {
                handle.deliver(ServerEvent::ProducerClosed {
                    producer_id: consumer.producer_id.clone(),
                    owner_connection_id: owner.clone(),
                });
            }
        }
    }

    fn close_producer(
        &mut self,
        connection_id: &ConnectionId,
        producer_id: &str,
    ) -> Result<Reply, PcError> {
        let teardown = self
            .lifecycle
            .close_producer(&mut self.store, connection_id, producer_id)?;
        self.notify_producer_closed(connection_id, &teardown.detached);

        debug!(
            target: "pc.actor.coordinator",
            connection_id = %connection_id,
            producer_id = %producer_id,
            viewers = teardown.detached.len(),
            "Producer closed by owner"
        );
        Ok(Reply::ok())
    }

    fn announce_producer(
        &self,
        owner: &ConnectionId,
        producer_id: &str,
        kind: MediaKind,
    ) {
        for (connection_id, handle) in &self.connections {
            if connection_id != owner {
                handle.deliver(ServerEvent::NewProducer {
                    producer_id: producer_id.to_string(),
                    kind,
                    owner_connection_id: owner.clone(),
                });
            }
        }
    }

    fn peer_producers(&self, connection_id: &ConnectionId) -> Vec<ProducerSummary> {
        let mut producers: Vec<ProducerSummary> = self
            .store
            .session(connection_id)
            .map(|session| {
                session
                    .producers
                    .values()
                    .map(|producer| ProducerSummary {
                        producer_id: producer.id.clone(),
                        kind: producer.kind,
                    })
                    .collect()
            })
            .unwrap_or_default();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        producers
    }

    fn broadcast_update(&self, connection_id: &ConnectionId) {
        if let Some(state) = self.store.presence(connection_id) {
            presence::broadcast_delta(
                &self.connections,
                connection_id,
                &PresenceDelta::Update {
                    peer: state.peer_info(),
                },
            );
        }
        self.broadcast_snapshot();
    }

    fn broadcast_snapshot(&self) {
        let snapshot = compute_snapshot(self.store.presence_states());
        presence::broadcast_snapshot(&self.connections, &snapshot);
    }

    fn update_gauges(&self) {
        self.metrics.set_connections(self.connections.len());
        self.metrics.set_sessions(self.store.len());
    }

    fn get_status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            connection_count: self.connections.len(),
            session_count: self.store.len(),
            streaming_count: compute_snapshot(self.store.presence_states()).len(),
            is_shutting_down: self.cancel_token.is_cancelled(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "pc.actor.coordinator",
            instance_id = %self.instance_id,
            connections = self.connections.len(),
            sessions = self.store.len(),
            "Releasing all sessions"
        );

        let mut releases = Vec::new();
        for connection_id in self.store.connection_ids() {
            if let Some(mut removed) = self.store.remove(&connection_id) {
                self.registry
                    .unbind(&removed.session.stable_id, &connection_id);
                if let Some(release) = self.release_session(&mut removed.session) {
                    releases.push(release);
                }
            }
        }

        for (_, handle) in self.connections.drain() {
            handle.close("Server shutting down");
        }
        self.update_gauges();

        let pending = releases.len();
        match tokio::time::timeout(
            SHUTDOWN_RELEASE_TIMEOUT,
            futures::future::join_all(releases),
        )
        .await
        {
            Ok(_) => {
                debug!(
                    target: "pc.actor.coordinator",
                    releases = pending,
                    "Session releases completed"
                );
            }
            Err(_) => {
                warn!(
                    target: "pc.actor.coordinator",
                    releases = pending,
                    "Session releases timed out during shutdown"
                );
            }
        }
    }
}
