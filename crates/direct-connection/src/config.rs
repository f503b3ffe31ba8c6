use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "direct-data";
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 5_000;

/// A STUN or TURN server the transport may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.to_ascii_lowercase().starts_with("turn"))
    }
}

/// Copy of `servers` without any TURN entries, used when the transport
/// refuses to start with them.
pub fn without_turn_servers(servers: &[IceServer]) -> Vec<IceServer> {
    servers
        .iter()
        .filter(|server| !server.is_turn())
        .cloned()
        .collect()
}

/// Per-connection negotiation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub ice_servers: Vec<IceServer>,
    /// Only relay candidates are signaled.
    pub force_relay: bool,
    pub data_channel_label: String,
    pub stats_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_URL)],
            force_relay: false,
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
        }
    }
}

impl ConnectionSettings {
    /// Localhost-only settings (no STUN/TURN).
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if env::var("DIRECT_LOCALHOST_ONLY").is_ok() {
            settings.ice_servers.clear();
        } else if let Ok(urls) = env::var("DIRECT_ICE_SERVERS") {
            settings.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::new)
                .collect();
        }
        if let Ok(value) = env::var("DIRECT_FORCE_RELAY") {
            settings.force_relay = parse_flag("DIRECT_FORCE_RELAY", &value)?;
        }
        Ok(settings)
    }

    pub fn from_toml_str(body: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(body)?)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn with_force_relay(mut self, force_relay: bool) -> Self {
        self.force_relay = force_relay;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}
