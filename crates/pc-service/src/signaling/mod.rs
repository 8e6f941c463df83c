//! Signaling protocol and the WebSocket endpoint that serves it.

pub mod handler;
pub mod protocol;

pub use handler::{signaling_router, SignalingState};
