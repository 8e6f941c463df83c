//! Media plane: codec set, the engine seam and handle lifecycle.

pub mod codecs;
pub mod engine;
pub mod http_engine;
pub mod lifecycle;

pub use engine::{EngineError, MediaEngine};
pub use lifecycle::MediaLifecycle;
