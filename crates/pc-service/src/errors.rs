//! Presence Coordinator error types.
//!
//! Every request failure is a [`PcError`]. The signaling layer maps it to a
//! protocol error payload via [`PcError::error_code`] and
//! [`PcError::client_message`]; internal details stay in the server logs.

use crate::media::engine::EngineError;
use thiserror::Error;

/// Protocol error codes carried in `{"error", "code"}` payloads.
pub mod codes {
    pub const INVALID_REQUEST: i32 = 1;
    pub const NOT_FOUND: i32 = 4;
    pub const INTERNAL_ERROR: i32 = 6;
    pub const CAPACITY_EXCEEDED: i32 = 7;
    pub const INCOMPATIBLE: i32 = 8;
    pub const ENGINE_ERROR: i32 = 9;
}

/// Presence Coordinator error type.
///
/// Maps to protocol codes:
/// - `Validation`: `INVALID_REQUEST` (1)
/// - `SessionGone`, `*NotFound`, `NoSendTransport`, `NoRecvTransport`: `NOT_FOUND` (4)
/// - `Config`, `Internal`: `INTERNAL_ERROR` (6)
/// - `CapacityExceeded`: `CAPACITY_EXCEEDED` (7)
/// - `IncompatibleCapabilities`: `INCOMPATIBLE` (8)
/// - `Engine`: `ENGINE_ERROR` (9)
#[derive(Debug, Error)]
pub enum PcError {
    /// Malformed request (bad JSON, unknown method, invalid params).
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The caller's session is not (or no longer) installed.
    #[error("Session not found")]
    SessionGone,

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("No send transport")]
    NoSendTransport,

    #[error("No recv transport")]
    NoRecvTransport,

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The engine's compatibility check rejected the receiver's capabilities.
    #[error("Cannot consume producer {0}")]
    IncompatibleCapabilities(String),

    /// The media engine rejected or failed a call.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection cap reached.
    #[error("Coordinator at capacity")]
    CapacityExceeded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PcError {
    /// Returns the protocol error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            PcError::Validation(_) => codes::INVALID_REQUEST,
            PcError::SessionGone
            | PcError::TransportNotFound(_)
            | PcError::NoSendTransport
            | PcError::NoRecvTransport
            | PcError::ProducerNotFound(_)
            | PcError::ConsumerNotFound(_) => codes::NOT_FOUND,
            PcError::Config(_) | PcError::Internal(_) => codes::INTERNAL_ERROR,
            PcError::CapacityExceeded => codes::CAPACITY_EXCEEDED,
            PcError::IncompatibleCapabilities(_) => codes::INCOMPATIBLE,
            PcError::Engine(_) => codes::ENGINE_ERROR,
        }
    }

    /// Returns a client-safe error message.
    ///
    /// Engine errors are surfaced verbatim; everything else uses a fixed
    /// message without ids or internal detail.
    pub fn client_message(&self) -> String {
        match self {
            PcError::Validation(msg) => msg.clone(),
            PcError::SessionGone => "Session not found".to_string(),
            PcError::TransportNotFound(_) => "Transport not found".to_string(),
            PcError::NoSendTransport => "No send transport".to_string(),
            PcError::NoRecvTransport => "No recv transport".to_string(),
            PcError::ProducerNotFound(_) => "Producer not found".to_string(),
            PcError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            PcError::IncompatibleCapabilities(_) => "Cannot consume".to_string(),
            PcError::Engine(e) => e.to_string(),
            PcError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            PcError::Config(_) | PcError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
