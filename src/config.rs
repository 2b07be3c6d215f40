// Session and logging configuration
// Logging is on by default only in debug builds; RUST_LOG still overrides it

use crate::error::SessionError;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "peerlink=debug,webrtc=warn";

pub const DEFAULT_CHANNEL_LABEL: &str = "chat-channel";

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Per-session settings handed to the transport and the coordinator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub channel_label: String,
    /// First id handed out by the session's channel allocator
    pub first_channel_id: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: 10,
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            first_channel_id: 1,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config and validate it
    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        let config: SessionConfig =
            serde_json::from_str(raw).map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(SessionError::InvalidConfig(format!(
                    "server {} has an empty URL",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SessionError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.first_channel_id == u16::MAX {
            return Err(SessionError::InvalidConfig(
                "first channel id 65535 is reserved".into(),
            ));
        }

        if self.channel_label.is_empty() {
            return Err(SessionError::InvalidConfig(
                "channel label cannot be empty".into(),
            ));
        }

        Ok(())
    }
}
