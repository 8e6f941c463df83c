//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types. Anything that authenticates the
//! coordinator against an external collaborator (for example the media
//! engine control API token) is held as a [`SecretString`] so that a derived
//! `Debug` or a `tracing` field can never print it.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct EngineCredentials {
//!     base_url: String,
//!     token: SecretString,
//! }
//!
//! let creds = EngineCredentials {
//!     base_url: "http://engine:4000".to_string(),
//!     token: SecretString::from("engine-token"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("engine-token"));
//! assert_eq!(creds.token.expose_secret(), "engine-token");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
