//! Identifier types shared by the coordinator and its test harness.
//!
//! Connection identifiers are ephemeral (one per channel) while stable user
//! identifiers survive reconnects. Both are plain strings on the wire, so the
//! newtypes serialize transparently.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one live client channel.
///
/// Minted once per channel and never reused, so a lookup by connection ID
/// cannot resolve to a later connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh random connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable per-user identifier, either client-supplied or minted from the
/// first connection ID the user registered with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableUserId(String);

impl StableUserId {
    /// Borrow the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&ConnectionId> for StableUserId {
    fn from(value: &ConnectionId) -> Self {
        Self(value.0.clone())
    }
}

impl From<&str> for StableUserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StableUserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StableUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
