//! Presence state and the presence broadcast engine.
//!
//! A [`PresenceState`] exists for every registered connection. Clients see
//! presence as [`PeerInfo`] entries, either as full snapshots of who is live
//! or as [`PresenceDelta`] events on each transition.

use crate::actors::connection::ConnectionHandle;
use crate::errors::PcError;
use crate::observability::metrics;
use crate::signaling::protocol::ServerEvent;
use common::types::{ConnectionId, StableUserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Version of the presence settings flag set.
pub const SETTINGS_VERSION: u8 = 1;

/// Maximum length of the opaque platform tag, in characters.
pub const MAX_PLATFORM_LEN: usize = 32;

fn settings_version() -> u8 {
    SETTINGS_VERSION
}

/// Closed set of presence flags.
///
/// `microphone`, `camera` and `screenShare` are publishable; `audioMuted` is
/// informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSettings {
    #[serde(default = "settings_version")]
    pub settings_version: u8,
    #[serde(default)]
    pub microphone: bool,
    #[serde(default)]
    pub camera: bool,
    #[serde(default)]
    pub screen_share: bool,
    #[serde(default)]
    pub audio_muted: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            settings_version: SETTINGS_VERSION,
            microphone: false,
            camera: false,
            screen_share: false,
            audio_muted: false,
        }
    }
}

impl PresenceSettings {
    #[must_use]
    pub fn any_publishable(&self) -> bool {
        self.microphone || self.camera || self.screen_share
    }

    /// Shallow merge: flags present in the patch override, others are kept.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.microphone {
            self.microphone = v;
        }
        if let Some(v) = patch.camera {
            self.camera = v;
        }
        if let Some(v) = patch.screen_share {
            self.screen_share = v;
        }
        if let Some(v) = patch.audio_muted {
            self.audio_muted = v;
        }
    }
}

/// Partial settings as sent by clients. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    pub settings_version: Option<u8>,
    pub microphone: Option<bool>,
    pub camera: Option<bool>,
    pub screen_share: Option<bool>,
    pub audio_muted: Option<bool>,
}

/// Params of `updateStreamState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PresenceUpdate {
    pub is_streaming: Option<bool>,
    pub settings: Option<SettingsPatch>,
    pub platform: Option<String>,
}

impl PresenceUpdate {
    pub fn validate(&self) -> Result<(), PcError> {
        if let Some(version) = self.settings.as_ref().and_then(|s| s.settings_version) {
            if version != SETTINGS_VERSION {
                return Err(PcError::Validation(format!(
                    "Unsupported settingsVersion {version}"
                )));
            }
        }
        if let Some(platform) = &self.platform {
            if platform.chars().count() > MAX_PLATFORM_LEN {
                return Err(PcError::Validation(format!(
                    "platform must be at most {MAX_PLATFORM_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

/// Per-connection presence, owned by the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceState {
    pub connection_id: ConnectionId,
    pub stable_id: StableUserId,
    pub display_name: String,
    /// Whether the client has explicitly gone live.
    pub live_requested: bool,
    /// Derived: `live_requested` and at least one publishable flag.
    pub is_streaming: bool,
    pub settings: PresenceSettings,
    pub platform: Option<String>,
}

impl PresenceState {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        stable_id: StableUserId,
        display_name: String,
    ) -> Self {
        Self {
            connection_id,
            stable_id,
            display_name,
            live_requested: false,
            is_streaming: false,
            settings: PresenceSettings::default(),
            platform: None,
        }
    }

    /// Take over broadcast status from a previous presence of the same
    /// identity.
    pub fn carry_forward(&mut self, previous: &PresenceState) {
        self.live_requested = previous.live_requested;
        self.settings = previous.settings;
        self.platform.clone_from(&previous.platform);
        self.recompute();
    }

    /// Apply a validated update. Returns true if anything visible changed.
    pub fn apply(&mut self, update: &PresenceUpdate) -> bool {
        let before = self.peer_info();

        if let Some(live) = update.is_streaming {
            self.live_requested = live;
        }
        if let Some(patch) = &update.settings {
            self.settings.apply(patch);
        }
        if let Some(platform) = &update.platform {
            self.platform = Some(platform.clone());
        }
        self.recompute();

        self.peer_info() != before
    }

    fn recompute(&mut self) {
        self.is_streaming = self.live_requested && self.settings.any_publishable();
    }

    #[must_use]
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            connection_id: self.connection_id.clone(),
            stable_id: self.stable_id.clone(),
            display_name: self.display_name.clone(),
            is_streaming: self.is_streaming,
            platform: self.platform.clone(),
            settings: self.settings,
        }
    }
}

/// Presence entry as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub stable_id: StableUserId,
    pub display_name: String,
    pub is_streaming: bool,
    #[serde(default)]
    pub platform: Option<String>,
    pub settings: PresenceSettings,
}

/// Incremental presence event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PresenceDelta {
    Join { peer: PeerInfo },
    Update { peer: PeerInfo },
    Leave { id: ConnectionId },
}

impl PresenceDelta {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PresenceDelta::Join { .. } => "join",
            PresenceDelta::Update { .. } => "update",
            PresenceDelta::Leave { .. } => "leave",
        }
    }
}

/// One entry per stable identity, preferring a streaming entry; ties go to
/// the lower connection id so the choice is stable.
fn dedupe<'a>(
    states: impl Iterator<Item = &'a PresenceState>,
) -> HashMap<&'a StableUserId, &'a PresenceState> {
    let mut chosen: HashMap<&StableUserId, &PresenceState> = HashMap::new();
    for state in states {
        chosen
            .entry(&state.stable_id)
            .and_modify(|current| {
                let better = (state.is_streaming && !current.is_streaming)
                    || (state.is_streaming == current.is_streaming
                        && state.connection_id < current.connection_id);
                if better {
                    *current = state;
                }
            })
            .or_insert(state);
    }
    chosen
}

fn sorted(mut peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
    peers.sort_by(|a, b| {
        a.display_name
            .cmp(&b.display_name)
            .then_with(|| a.stable_id.cmp(&b.stable_id))
    });
    peers
}

/// Who is live: deduplicated by identity, streaming entries only.
pub fn compute_snapshot<'a>(states: impl Iterator<Item = &'a PresenceState>) -> Vec<PeerInfo> {
    sorted(
        dedupe(states)
            .into_values()
            .filter(|state| state.is_streaming)
            .map(PresenceState::peer_info)
            .collect(),
    )
}

/// Every registered peer, deduplicated by identity.
pub fn compute_roster<'a>(states: impl Iterator<Item = &'a PresenceState>) -> Vec<PeerInfo> {
    sorted(
        dedupe(states)
            .into_values()
            .map(PresenceState::peer_info)
            .collect(),
    )
}

/// Send a full snapshot to every connection.
pub fn broadcast_snapshot(
    connections: &HashMap<ConnectionId, ConnectionHandle>,
    snapshot: &[PeerInfo],
) {
    metrics::record_presence_broadcast("snapshot");
    metrics::set_streaming_peers(snapshot.len());
    debug!(
        target: "pc.presence",
        peers = snapshot.len(),
        recipients = connections.len(),
        "Broadcasting presence snapshot"
    );

    for handle in connections.values() {
        handle.deliver(ServerEvent::PresenceSnapshot {
            list: snapshot.to_vec(),
        });
    }
}

/// Send a delta to every connection except its subject.
pub fn broadcast_delta(
    connections: &HashMap<ConnectionId, ConnectionHandle>,
    subject: &ConnectionId,
    delta: &PresenceDelta,
) {
    metrics::record_presence_broadcast(delta.kind());
    debug!(
        target: "pc.presence",
        kind = delta.kind(),
        subject = %subject,
        "Broadcasting presence delta"
    );

    for (connection_id, handle) in connections {
        if connection_id != subject {
            handle.deliver(ServerEvent::PresenceDelta(delta.clone()));
        }
    }
}
