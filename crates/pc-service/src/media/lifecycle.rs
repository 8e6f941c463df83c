//! Media resource lifecycle manager.
//!
//! The only caller of [`MediaEngine`]. Validation and registration run
//! synchronously inside the coordinator's message loop; engine calls run in
//! spawned tasks and report back as [`InternalEvent`]s. A result whose
//! session is gone (or was replaced) is closed instead of registered.
//!
//! Every registered handle leaves its session exactly once: either through
//! an explicit close or through [`MediaLifecycle::release_all`], which drains
//! the session's maps before closing anything.

use crate::actors::messages::{InternalEvent, Responder};
use crate::errors::PcError;
use crate::media::codecs::{filter_capabilities, MediaCodec};
use crate::media::engine::{
    ConsumerParams, EngineError, EngineHandle, MediaEngine, MediaKind, TransportDirection,
    TransportParams,
};
use crate::observability::metrics;
use crate::sessions::{
    ConsumerHandle, PeerSession, ProducerHandle, SessionStore, SessionTicket, TransportHandle,
};
use crate::signaling::protocol::{ConsumeReply, Created, Reply};
use common::types::ConnectionId;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A producer registered by [`MediaLifecycle::complete_produce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProducer {
    pub owner: ConnectionId,
    pub producer: ProducerHandle,
}

/// Result of closing producers.
///
/// `detached` lists consumers removed from other sessions, keyed by the
/// viewer's connection, so their owners can be told.
#[derive(Debug)]
pub struct Teardown {
    pub task: Option<JoinHandle<()>>,
    pub detached: Vec<(ConnectionId, ConsumerHandle)>,
}

pub struct MediaLifecycle {
    engine: Arc<dyn MediaEngine>,
    internal: mpsc::Sender<InternalEvent>,
    codecs: Vec<MediaCodec>,
    resume_delay: Duration,
}

fn reply(respond_to: Responder, result: Result<Reply, PcError>) {
    let _ = respond_to.send(result);
}

impl MediaLifecycle {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        internal: mpsc::Sender<InternalEvent>,
        codecs: Vec<MediaCodec>,
        resume_delay: Duration,
    ) -> Self {
        Self {
            engine,
            internal,
            codecs,
            resume_delay,
        }
    }

    /// Configure the engine router with the fixed codec set.
    pub async fn configure_router(&self) -> Result<(), EngineError> {
        self.engine.configure_router(&self.codecs).await?;
        info!(
            target: "pc.media.lifecycle",
            codecs = self.codecs.len(),
            "Media engine router configured"
        );
        Ok(())
    }

    /// Router capabilities narrowed to the configured codecs.
    pub fn get_capabilities(&self, respond_to: Responder) {
        let engine = Arc::clone(&self.engine);
        let codecs = self.codecs.clone();
        tokio::spawn(async move {
            let result = engine
                .rtp_capabilities()
                .await
                .map(|caps| Reply::Capabilities(filter_capabilities(&caps, &codecs)))
                .map_err(PcError::from);
            reply(respond_to, result);
        });
    }

    pub fn open_transport(
        &self,
        store: &SessionStore,
        connection_id: &ConnectionId,
        direction: TransportDirection,
        respond_to: Responder,
    ) {
        let Some(session) = store.session(connection_id) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        let ticket = session.ticket();

        let engine = Arc::clone(&self.engine);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            match engine.create_transport(direction).await {
                Ok(params) => {
                    let event = InternalEvent::TransportCreated {
                        ticket,
                        direction,
                        params,
                        respond_to,
                    };
                    deliver_or_close(&engine, &internal, event).await;
                }
                Err(e) => reply(respond_to, Err(e.into())),
            }
        });
    }

    /// Register a created transport, or close it if its session is gone.
    pub fn complete_transport(
        &self,
        store: &mut SessionStore,
        ticket: &SessionTicket,
        direction: TransportDirection,
        params: TransportParams,
        respond_to: Responder,
    ) {
        let Some(session) = store.current_mut(ticket) else {
            self.close_orphan(EngineHandle::Transport(params.id), ticket);
            return reply(respond_to, Err(PcError::SessionGone));
        };

        session.add_transport(TransportHandle {
            id: params.id.clone(),
            direction,
        });
        debug!(
            target: "pc.media.lifecycle",
            connection_id = %ticket.connection_id,
            transport_id = %params.id,
            direction = direction.as_str(),
            "Transport registered"
        );
        reply(respond_to, Ok(Reply::Transport(params)));
    }

    pub fn connect_transport(
        &self,
        store: &SessionStore,
        connection_id: &ConnectionId,
        transport_id: String,
        dtls_parameters: Value,
        respond_to: Responder,
    ) {
        let Some(session) = store.session(connection_id) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        if !session.transports.contains_key(&transport_id) {
            return reply(respond_to, Err(PcError::TransportNotFound(transport_id)));
        }

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let result = engine
                .connect_transport(&transport_id, dtls_parameters)
                .await
                .map(|()| Reply::ok())
                .map_err(PcError::from);
            reply(respond_to, result);
        });
    }

    pub fn produce(
        &self,
        store: &SessionStore,
        connection_id: &ConnectionId,
        kind: MediaKind,
        rtp_parameters: Value,
        respond_to: Responder,
    ) {
        let Some(session) = store.session(connection_id) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        let Some(transport_id) = session.send_transport_id.clone() else {
            return reply(respond_to, Err(PcError::NoSendTransport));
        };
        let ticket = session.ticket();

        let engine = Arc::clone(&self.engine);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            match engine.produce(&transport_id, kind, rtp_parameters).await {
                Ok(producer_id) => {
                    let event = InternalEvent::ProducerCreated {
                        ticket,
                        transport_id,
                        kind,
                        producer_id,
                        respond_to,
                    };
                    deliver_or_close(&engine, &internal, event).await;
                }
                Err(e) => reply(respond_to, Err(e.into())),
            }
        });
    }

    /// Register a created producer. Returns it so the coordinator can
    /// announce it; `None` if the session was gone and it was closed.
    pub fn complete_produce(
        &self,
        store: &mut SessionStore,
        ticket: &SessionTicket,
        transport_id: String,
        kind: MediaKind,
        producer_id: String,
        respond_to: Responder,
    ) -> Option<NewProducer> {
        let Some(session) = store.current_mut(ticket) else {
            self.close_orphan(EngineHandle::Producer(producer_id), ticket);
            reply(respond_to, Err(PcError::SessionGone));
            return None;
        };

        let producer = ProducerHandle {
            id: producer_id.clone(),
            kind,
            transport_id,
        };
        session.producers.insert(producer_id.clone(), producer.clone());
        reply(respond_to, Ok(Reply::Produced(Created { id: producer_id })));

        Some(NewProducer {
            owner: ticket.connection_id.clone(),
            producer,
        })
    }

    pub fn consume(
        &self,
        store: &SessionStore,
        connection_id: &ConnectionId,
        producer_id: String,
        rtp_capabilities: Value,
        respond_to: Responder,
    ) {
        let Some(session) = store.session(connection_id) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        let Some(transport_id) = session.recv_transport_id.clone() else {
            return reply(respond_to, Err(PcError::NoRecvTransport));
        };
        if store.producer_owner(&producer_id).is_none() {
            return reply(respond_to, Err(PcError::ProducerNotFound(producer_id)));
        }
        let ticket = session.ticket();

        let engine = Arc::clone(&self.engine);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            match engine.can_consume(&producer_id, &rtp_capabilities).await {
                Ok(true) => {}
                Ok(false) => {
                    return reply(
                        respond_to,
                        Err(PcError::IncompatibleCapabilities(producer_id)),
                    )
                }
                Err(e) => return reply(respond_to, Err(e.into())),
            }

            // Paused until the receiver has had time to set up its side.
            match engine
                .consume(&transport_id, &producer_id, rtp_capabilities, true)
                .await
            {
                Ok(consumer) => {
                    let event = InternalEvent::ConsumerCreated {
                        ticket,
                        transport_id,
                        consumer,
                        respond_to,
                    };
                    deliver_or_close(&engine, &internal, event).await;
                }
                Err(e) => reply(respond_to, Err(e.into())),
            }
        });
    }

    /// Register a created consumer and schedule its resume.
    ///
    /// Both ends are re-validated: the consuming session must still be the
    /// one that asked, and the producer must still exist.
    pub fn complete_consume(
        &self,
        store: &mut SessionStore,
        ticket: &SessionTicket,
        transport_id: String,
        consumer: ConsumerParams,
        respond_to: Responder,
    ) {
        if !store.is_current(ticket) {
            self.close_orphan(EngineHandle::Consumer(consumer.id), ticket);
            return reply(respond_to, Err(PcError::SessionGone));
        }
        let Some((owner, _)) = store.producer_owner(&consumer.producer_id) else {
            self.close_orphan(EngineHandle::Consumer(consumer.id), ticket);
            return reply(respond_to, Err(PcError::ProducerNotFound(consumer.producer_id)));
        };
        let owner_connection_id = owner.clone();

        let Some(session) = store.current_mut(ticket) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        session.consumers.insert(
            consumer.id.clone(),
            ConsumerHandle {
                id: consumer.id.clone(),
                producer_id: consumer.producer_id.clone(),
                kind: consumer.kind,
                transport_id,
            },
        );
        self.schedule_resume(ticket.clone(), consumer.id.clone());

        reply(
            respond_to,
            Ok(Reply::Consumed(ConsumeReply {
                id: consumer.id,
                producer_id: consumer.producer_id,
                kind: consumer.kind,
                rtp_parameters: consumer.rtp_parameters,
                owner_connection_id,
            })),
        );
    }

    fn schedule_resume(&self, ticket: SessionTicket, consumer_id: String) {
        let internal = self.internal.clone();
        let delay = self.resume_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal
                .send(InternalEvent::ResumeDue {
                    ticket,
                    consumer_id,
                })
                .await;
        });
    }

    /// Timer-driven resume. Skipped if the consumer is no longer owned by
    /// the session it was created for.
    pub fn resume_due(&self, store: &SessionStore, ticket: &SessionTicket, consumer_id: String) {
        let still_owned = store.is_current(ticket)
            && store
                .session(&ticket.connection_id)
                .is_some_and(|s| s.consumers.contains_key(&consumer_id));
        if !still_owned {
            debug!(
                target: "pc.media.lifecycle",
                consumer_id = %consumer_id,
                "Consumer gone before scheduled resume"
            );
            return;
        }

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.resume_consumer(&consumer_id).await {
                warn!(
                    target: "pc.media.lifecycle",
                    consumer_id = %consumer_id,
                    error = %e,
                    "Scheduled consumer resume failed"
                );
            }
        });
    }

    /// Client-requested resume. Idempotent at the engine.
    pub fn resume(
        &self,
        store: &SessionStore,
        connection_id: &ConnectionId,
        consumer_id: String,
        respond_to: Responder,
    ) {
        let Some(session) = store.session(connection_id) else {
            return reply(respond_to, Err(PcError::SessionGone));
        };
        if !session.consumers.contains_key(&consumer_id) {
            return reply(respond_to, Err(PcError::ConsumerNotFound(consumer_id)));
        }

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let result = engine
                .resume_consumer(&consumer_id)
                .await
                .map(|()| Reply::ok())
                .map_err(PcError::from);
            reply(respond_to, result);
        });
    }

    /// Explicitly close one of the caller's producers.
    ///
    /// Consumers of the producer in other sessions are detached and closed
    /// in the same batch, ahead of the producer.
    pub fn close_producer(
        &self,
        store: &mut SessionStore,
        connection_id: &ConnectionId,
        producer_id: &str,
    ) -> Result<Teardown, PcError> {
        let session = store
            .session_mut(connection_id)
            .ok_or(PcError::SessionGone)?;
        let producer = session
            .producers
            .remove(producer_id)
            .ok_or_else(|| PcError::ProducerNotFound(producer_id.to_string()))?;

        let detached = store.detach_consumers_of(&producer.id);
        let mut handles = consumer_handles(&detached);
        handles.push(EngineHandle::Producer(producer.id));

        Ok(Teardown {
            task: Some(self.close_in_background(handles)),
            detached,
        })
    }

    /// Close everything a removed session owned.
    ///
    /// Other sessions' consumers of its producers close first, then the
    /// session's own handles in drain order, all in one batch. The session's
    /// maps are drained first, so a second call closes nothing.
    pub fn release_all(&self, store: &mut SessionStore, session: &mut PeerSession) -> Teardown {
        let mut detached = Vec::new();
        for producer_id in session.producers.keys() {
            detached.extend(store.detach_consumers_of(producer_id));
        }

        let mut handles = consumer_handles(&detached);
        handles.extend(session.drain_handles());
        if handles.is_empty() {
            return Teardown {
                task: None,
                detached,
            };
        }

        debug!(
            target: "pc.media.lifecycle",
            connection_id = %session.connection_id,
            handles = handles.len(),
            dependents = detached.len(),
            "Releasing session handles"
        );
        Teardown {
            task: Some(self.close_in_background(handles)),
            detached,
        }
    }

    fn close_orphan(&self, handle: EngineHandle, ticket: &SessionTicket) {
        metrics::record_orphaned_handle(handle.kind());
        info!(
            target: "pc.media.lifecycle",
            connection_id = %ticket.connection_id,
            handle = %handle,
            "Session gone before engine call completed, closing handle"
        );
        self.close_in_background(vec![handle]);
    }

    /// Close handles sequentially in the given order. Errors are logged;
    /// teardown always runs to completion.
    fn close_in_background(&self, handles: Vec<EngineHandle>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(close_all(engine, handles))
    }
}

fn consumer_handles(detached: &[(ConnectionId, ConsumerHandle)]) -> Vec<EngineHandle> {
    detached
        .iter()
        .map(|(_, consumer)| EngineHandle::Consumer(consumer.id.clone()))
        .collect()
}

async fn close_all(engine: Arc<dyn MediaEngine>, handles: Vec<EngineHandle>) {
    for handle in handles {
        let label = handle.to_string();
        if let Err(e) = engine.close(handle).await {
            warn!(
                target: "pc.media.lifecycle",
                handle = %label,
                error = %e,
                "Engine close failed"
            );
        }
    }
}

/// Hand a result back to the coordinator. If the coordinator has stopped,
/// the handle it carries can never be registered, so close it here.
async fn deliver_or_close(
    engine: &Arc<dyn MediaEngine>,
    internal: &mpsc::Sender<InternalEvent>,
    event: InternalEvent,
) {
    if let Err(mpsc::error::SendError(event)) = internal.send(event).await {
        let handle = match event {
            InternalEvent::TransportCreated { params, .. } => {
                Some(EngineHandle::Transport(params.id))
            }
            InternalEvent::ProducerCreated { producer_id, .. } => {
                Some(EngineHandle::Producer(producer_id))
            }
            InternalEvent::ConsumerCreated { consumer, .. } => {
                Some(EngineHandle::Consumer(consumer.id))
            }
            InternalEvent::ResumeDue { .. } | InternalEvent::FreshSnapshotDue { .. } => None,
        };
        if let Some(handle) = handle {
            metrics::record_orphaned_handle(handle.kind());
            close_all(Arc::clone(engine), vec![handle]).await;
        }
    }
}
