//! Peer session store.
//!
//! Authoritative per-connection state: the [`PeerSession`] with its media
//! handles and the [`PresenceState`] read by the broadcast engine. Owned by
//! the coordinator actor and mutated only from its message loop.
//!
//! Every installed session gets a new generation. Engine results carry a
//! [`SessionTicket`] and are only accepted while that exact session is
//! installed.

use crate::media::engine::{EngineHandle, MediaKind, TransportDirection};
use crate::presence::{PresenceState, PresenceUpdate};
use common::types::{ConnectionId, StableUserId};
use std::collections::HashMap;

/// Identifies one installed session of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTicket {
    pub connection_id: ConnectionId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub id: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub transport_id: String,
}

/// Media session of one registered connection.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub connection_id: ConnectionId,
    pub stable_id: StableUserId,
    pub display_name: String,
    pub generation: u64,
    pub send_transport_id: Option<String>,
    pub recv_transport_id: Option<String>,
    pub transports: HashMap<String, TransportHandle>,
    pub producers: HashMap<String, ProducerHandle>,
    pub consumers: HashMap<String, ConsumerHandle>,
}

impl PeerSession {
    #[must_use]
    pub fn ticket(&self) -> SessionTicket {
        SessionTicket {
            connection_id: self.connection_id.clone(),
            generation: self.generation,
        }
    }

    /// Register a new transport and make it current for its direction. A
    /// previous transport of the same direction stays registered (it may be
    /// mid-negotiation) and is released with the session.
    pub fn add_transport(&mut self, handle: TransportHandle) {
        match handle.direction {
            TransportDirection::Send => self.send_transport_id = Some(handle.id.clone()),
            TransportDirection::Recv => self.recv_transport_id = Some(handle.id.clone()),
        }
        self.transports.insert(handle.id.clone(), handle);
    }

    /// Drain every owned handle in close order: consumers, producers,
    /// transports. A drained session has nothing left to release.
    pub fn drain_handles(&mut self) -> Vec<EngineHandle> {
        let consumers = self.consumers.drain().map(|(id, _)| EngineHandle::Consumer(id));
        let producers = self.producers.drain().map(|(id, _)| EngineHandle::Producer(id));
        let transports = self
            .transports
            .drain()
            .map(|(id, _)| EngineHandle::Transport(id));

        let handles = consumers.chain(producers).chain(transports).collect();
        self.send_transport_id = None;
        self.recv_transport_id = None;
        handles
    }
}

/// Result of removing a connection from the store.
#[derive(Debug)]
pub struct RemovedSession {
    pub session: PeerSession,
    pub presence: PresenceState,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<ConnectionId, PeerSession>,
    presence: HashMap<ConnectionId, PresenceState>,
    next_generation: u64,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh session for `connection_id`.
    ///
    /// `carried` is a previous presence of the same identity whose broadcast
    /// status is taken over. A session already installed on this connection
    /// is replaced and returned so its handles can be released.
    pub fn create_or_replace(
        &mut self,
        connection_id: &ConnectionId,
        stable_id: StableUserId,
        display_name: String,
        carried: Option<&PresenceState>,
    ) -> (SessionTicket, Option<PeerSession>) {
        self.next_generation += 1;
        let session = PeerSession {
            connection_id: connection_id.clone(),
            stable_id: stable_id.clone(),
            display_name: display_name.clone(),
            generation: self.next_generation,
            send_transport_id: None,
            recv_transport_id: None,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };
        let ticket = session.ticket();

        let mut presence = PresenceState::new(connection_id.clone(), stable_id, display_name);
        if let Some(previous) = carried {
            presence.carry_forward(previous);
        }

        let replaced = self.sessions.insert(connection_id.clone(), session);
        self.presence.insert(connection_id.clone(), presence);

        (ticket, replaced)
    }

    /// Shallow-merge a presence update. Returns `None` if the connection is
    /// not registered, otherwise whether anything visible changed.
    pub fn update_presence(
        &mut self,
        connection_id: &ConnectionId,
        update: &PresenceUpdate,
    ) -> Option<bool> {
        self.presence
            .get_mut(connection_id)
            .map(|state| state.apply(update))
    }

    /// Delete the connection's session and presence together.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<RemovedSession> {
        let session = self.sessions.remove(connection_id)?;
        let presence = self.presence.remove(connection_id)?;
        Some(RemovedSession { session, presence })
    }

    #[must_use]
    pub fn session(&self, connection_id: &ConnectionId) -> Option<&PeerSession> {
        self.sessions.get(connection_id)
    }

    pub fn session_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(connection_id)
    }

    /// The session the ticket was issued for, if it is still installed.
    pub fn current_mut(&mut self, ticket: &SessionTicket) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(&ticket.connection_id)
            .filter(|session| session.generation == ticket.generation)
    }

    #[must_use]
    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.sessions
            .get(&ticket.connection_id)
            .is_some_and(|session| session.generation == ticket.generation)
    }

    #[must_use]
    pub fn presence(&self, connection_id: &ConnectionId) -> Option<&PresenceState> {
        self.presence.get(connection_id)
    }

    /// Any live presence of `stable_id`, preferring a streaming one.
    #[must_use]
    pub fn presence_for_identity(&self, stable_id: &StableUserId) -> Option<&PresenceState> {
        self.presence
            .values()
            .filter(|state| &state.stable_id == stable_id)
            .max_by_key(|state| state.is_streaming)
    }

    pub fn presence_states(&self) -> impl Iterator<Item = &PresenceState> {
        self.presence.values()
    }

    /// Find the session owning `producer_id` by scanning producer maps.
    #[must_use]
    pub fn producer_owner(&self, producer_id: &str) -> Option<(&ConnectionId, &ProducerHandle)> {
        self.sessions.values().find_map(|session| {
            session
                .producers
                .get(producer_id)
                .map(|producer| (&session.connection_id, producer))
        })
    }

    /// Remove every consumer of `producer_id` from every session.
    pub fn detach_consumers_of(&mut self, producer_id: &str) -> Vec<(ConnectionId, ConsumerHandle)> {
        let mut detached = Vec::new();
        for session in self.sessions.values_mut() {
            let ids: Vec<String> = session
                .consumers
                .values()
                .filter(|consumer| consumer.producer_id == producer_id)
                .map(|consumer| consumer.id.clone())
                .collect();
            for id in ids {
                if let Some(consumer) = session.consumers.remove(&id) {
                    detached.push((session.connection_id.clone(), consumer));
                }
            }
        }
        detached
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().cloned().collect()
    }
}
