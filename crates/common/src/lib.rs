//! Common utilities and types shared across presence coordinator crates.

#![warn(clippy::pedantic)]

/// Module for connection and identity identifier types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
