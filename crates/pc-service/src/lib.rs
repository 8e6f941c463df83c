//! Presence Coordinator (PC) Service Library
//!
//! Real-time presence and media-session signaling for a many-to-many live
//! broadcast application:
//!
//! - Resolves ephemeral connections to durable identities, evicting stale
//!   duplicates
//! - Tracks per-connection media sessions and presence
//! - Creates and tears down transports, producers and consumers on an
//!   external selective-forwarding media engine
//! - Publishes deduplicated "who is live" snapshots and presence deltas
//!
//! # Architecture
//!
//! ```text
//! signaling (WebSocket /ws)
//! └── CoordinatorActor (singleton, owns all state)
//!     ├── IdentityRegistry
//!     ├── SessionStore (sessions + presence)
//!     ├── MediaLifecycle ──► MediaEngine (HTTP control API)
//!     └── N ConnectionActors (outbound frames)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Coordinator and connection actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with protocol error codes
//! - [`media`] - Codec set, engine seam and handle lifecycle
//! - [`observability`] - Metrics and health endpoints
//! - [`presence`] - Presence state and broadcast engine
//! - [`registry`] - Connection and identity registry
//! - [`sessions`] - Peer session store
//! - [`signaling`] - Wire protocol and WebSocket endpoint

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod presence;
pub mod registry;
pub mod sessions;
pub mod signaling;
