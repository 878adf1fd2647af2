use mesh_protocol::ParticipantId;
use std::env;
use std::time::Duration;

use crate::session::join::DEFAULT_MAX_PEERS;
use crate::transport::OfferOptions;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8084";
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.services.mozilla.com",
    "stun:stunserver.org",
];
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Mesh client configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Relay WebSocket url
    pub relay_url: String,
    /// Fixed local id; a random one is generated when unset
    pub participant_id: Option<ParticipantId>,
    pub max_peers: usize,
    pub ice_servers: Vec<String>,
    /// Interval between WebSocket pings; zero disables them
    pub heartbeat: Duration,
    pub offer: OfferOptions,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            participant_id: None,
            max_peers: DEFAULT_MAX_PEERS,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            heartbeat: DEFAULT_HEARTBEAT,
            offer: OfferOptions::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = non_empty(lookup("MESH_RELAY_URL")) {
            config.relay_url = url;
        }
        if let Some(id) = non_empty(lookup("MESH_PARTICIPANT_ID")) {
            config.participant_id = Some(ParticipantId::new(id));
        }
        if let Some(raw) = non_empty(lookup("MESH_MAX_PEERS")) {
            match raw.parse::<usize>() {
                Ok(max) if max > 0 => config.max_peers = max,
                _ => tracing::warn!(
                    target = "mesh",
                    value = %raw,
                    "ignoring invalid MESH_MAX_PEERS"
                ),
            }
        }
        if let Some(raw) = lookup("MESH_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if lookup("MESH_DISABLE_STUN").is_some_and(|v| v != "0" && !v.is_empty()) {
            config.ice_servers.clear();
        }
        if let Some(raw) = non_empty(lookup("MESH_HEARTBEAT_SECS")) {
            match raw.parse::<u64>() {
                Ok(secs) => config.heartbeat = Duration::from_secs(secs),
                Err(_) => tracing::warn!(
                    target = "mesh",
                    value = %raw,
                    "ignoring invalid MESH_HEARTBEAT_SECS"
                ),
            }
        }
        config
    }

    /// The configured local id, or a freshly generated one.
    pub fn local_id(&self) -> ParticipantId {
        self.participant_id
            .clone()
            .unwrap_or_else(ParticipantId::generate)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
