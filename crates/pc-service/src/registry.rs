//! Connection and identity registry.
//!
//! Maps durable stable user ids to their last known display name and to the
//! connection currently bound to them. At most one connection is bound to a
//! stable id at a time; the coordinator evicts the previous one before
//! binding a new connection.

use common::types::{ConnectionId, StableUserId};
use std::collections::HashMap;

/// Name given to identities that never supplied one.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Outcome of [`IdentityRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub stable_id: StableUserId,
    pub display_name: String,
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    /// Last known display name per identity. Survives disconnects.
    names: HashMap<StableUserId, String>,
    /// Live connection bound to each identity.
    bindings: HashMap<StableUserId, ConnectionId>,
}

impl IdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a registering connection to a durable identity.
    ///
    /// - A claimed id is used as-is, known or not. Without one, the
    ///   connection id is minted as the stable id.
    /// - A non-blank supplied name wins and is remembered. Otherwise the
    ///   identity's last known name is restored, falling back to
    ///   [`ANONYMOUS_NAME`].
    pub fn resolve(
        &mut self,
        connection_id: &ConnectionId,
        claimed_stable_id: Option<&str>,
        claimed_name: Option<&str>,
    ) -> ResolvedIdentity {
        let stable_id = match claimed_stable_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(claimed) => StableUserId::from(claimed),
            None => StableUserId::from(connection_id),
        };

        let supplied = claimed_name.map(str::trim).filter(|s| !s.is_empty());
        let display_name = match supplied {
            Some(name) => {
                self.names.insert(stable_id.clone(), name.to_string());
                name.to_string()
            }
            None => self
                .names
                .get(&stable_id)
                .cloned()
                .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
        };

        ResolvedIdentity {
            stable_id,
            display_name,
        }
    }

    /// Bind `stable_id` to `connection_id`, replacing any previous binding.
    ///
    /// Callers evict [`Self::eviction_target`] first.
    pub fn bind(&mut self, stable_id: &StableUserId, connection_id: &ConnectionId) {
        self.bindings.insert(stable_id.clone(), connection_id.clone());
    }

    /// The connection that must be evicted before `except` may own
    /// `stable_id`, if any.
    #[must_use]
    pub fn eviction_target(
        &self,
        stable_id: &StableUserId,
        except: &ConnectionId,
    ) -> Option<&ConnectionId> {
        self.bindings.get(stable_id).filter(|bound| *bound != except)
    }

    /// Release the binding, but only if `stable_id` is still bound to
    /// `connection_id`. A late unbind from an evicted connection must not
    /// clear its successor's binding.
    ///
    /// A minted identity cannot outlive its connection, so its name is
    /// forgotten with the binding.
    pub fn unbind(&mut self, stable_id: &StableUserId, connection_id: &ConnectionId) -> bool {
        if self.bindings.get(stable_id) != Some(connection_id) {
            return false;
        }
        self.bindings.remove(stable_id);
        if stable_id.as_str() == connection_id.as_str() {
            self.names.remove(stable_id);
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_without_claim_mints_connection_id() {
        let mut registry = IdentityRegistry::new();
        let conn = ConnectionId::from("conn-1");

        let resolved = registry.resolve(&conn, None, None);

        assert_eq!(resolved.stable_id.as_str(), "conn-1");
        assert_eq!(resolved.display_name, ANONYMOUS_NAME);
    }

    #[test]
    fn test_resolve_known_identity_restores_name() {
        let mut registry = IdentityRegistry::new();

        registry.resolve(&ConnectionId::from("conn-1"), Some("u1"), Some("Ann"));
        let resolved = registry.resolve(&ConnectionId::from("conn-2"), Some("u1"), None);

        assert_eq!(resolved.stable_id.as_str(), "u1");
        assert_eq!(resolved.display_name, "Ann");
    }

    #[test]
    fn test_resolve_supplied_name_overrides_and_is_remembered() {
        let mut registry = IdentityRegistry::new();

        registry.resolve(&ConnectionId::from("conn-1"), Some("u1"), Some("Ann"));
        let renamed = registry.resolve(&ConnectionId::from("conn-2"), Some("u1"), Some("Annie"));
        assert_eq!(renamed.display_name, "Annie");

        let restored = registry.resolve(&ConnectionId::from("conn-3"), Some("u1"), Some("   "));
        assert_eq!(restored.display_name, "Annie", "Blank names do not overwrite");
    }

    #[test]
    fn test_resolve_unknown_claim_is_accepted() {
        let mut registry = IdentityRegistry::new();

        let resolved = registry.resolve(&ConnectionId::from("conn-1"), Some("device-42"), None);

        assert_eq!(resolved.stable_id.as_str(), "device-42");
        assert_eq!(resolved.display_name, ANONYMOUS_NAME);
    }

    #[test]
    fn test_bind_replaces_previous_connection() {
        let mut registry = IdentityRegistry::new();
        let u1 = StableUserId::from("u1");
        let a = ConnectionId::from("conn-a");
        let b = ConnectionId::from("conn-b");

        registry.bind(&u1, &a);
        assert_eq!(registry.eviction_target(&u1, &a), None, "Own binding");
        assert_eq!(registry.eviction_target(&u1, &b), Some(&a));

        registry.bind(&u1, &b);
        assert_eq!(registry.eviction_target(&u1, &a), Some(&b));
        assert_eq!(registry.eviction_target(&u1, &b), None);
    }

    #[test]
    fn test_unbind_ignores_stale_connection() {
        let mut registry = IdentityRegistry::new();
        let u1 = StableUserId::from("u1");
        let a = ConnectionId::from("conn-a");
        let b = ConnectionId::from("conn-b");

        registry.bind(&u1, &a);
        registry.bind(&u1, &b);

        assert!(!registry.unbind(&u1, &a), "Evicted connection must not unbind successor");
        assert_eq!(registry.eviction_target(&u1, &a), Some(&b));

        assert!(registry.unbind(&u1, &b));
        assert!(registry.bindings.is_empty());
    }

    #[test]
    fn test_unbind_forgets_minted_identity_name() {
        let mut registry = IdentityRegistry::new();
        let minted_conn = ConnectionId::from("conn-1");
        let claimed_conn = ConnectionId::from("conn-2");

        let minted = registry.resolve(&minted_conn, None, Some("Bob"));
        let claimed = registry.resolve(&claimed_conn, Some("u1"), Some("Ann"));
        registry.bind(&minted.stable_id, &minted_conn);
        registry.bind(&claimed.stable_id, &claimed_conn);

        assert!(registry.unbind(&minted.stable_id, &minted_conn));
        assert!(registry.unbind(&claimed.stable_id, &claimed_conn));

        assert!(!registry.names.contains_key(&minted.stable_id));
        assert_eq!(
            registry.names.get(&claimed.stable_id).map(String::as_str),
            Some("Ann"),
            "Claimed identities keep their name across disconnects"
        );
    }
}
