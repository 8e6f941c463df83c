//! Actor model implementation for the presence coordinator.
//!
//! ```text
//! CoordinatorActor (singleton)
//! ├── owns registry, session store, presence state
//! ├── drives the media engine through MediaLifecycle
//! └── holds a handle to N ConnectionActors
//!     └── ConnectionActor (one per signaling channel, writes frames)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner**: all shared state lives in the coordinator; no locks
//! - **No waiting on clients**: connection mailboxes are bounded and full
//!   mailboxes drop events instead of stalling the coordinator
//! - **CancellationToken propagation**: connections hold child tokens of the
//!   coordinator's root token
//!
//! # Modules
//!
//! - [`coordinator`] - `CoordinatorActor` and its handle
//! - [`connection`] - `ConnectionActor` per signaling channel
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod coordinator;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionHandle, FrameSink};
pub use coordinator::{CoordinatorActor, CoordinatorConfig, CoordinatorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
