use serde::Deserialize;

use stagehand_sync::ServerConfig;

/// Relay settings, loaded from `STAGEHAND_RELAY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_max_peers_per_room")]
    pub max_peers_per_room: usize,

    /// Frames buffered per peer before it lags and gets a full resync.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Seconds between WebSocket pings; 0 disables them.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl RelayConfig {
    /// Read an optional `.env` file, then the environment. Falls back to
    /// defaults if the variables do not parse.
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            log::debug!("Loaded .env file");
        }
        match envy::prefixed("STAGEHAND_RELAY_").from_env::<RelayConfig>() {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load relay configuration, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            max_peers_per_room: self.max_peers_per_room,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_peers_per_room: default_max_peers_per_room(),
            broadcast_capacity: default_broadcast_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_max_peers_per_room() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server() {
        let config = RelayConfig::default().server_config();
        let server = ServerConfig::default();
        assert_eq!(config.bind_addr, server.bind_addr);
        assert_eq!(config.max_peers_per_room, server.max_peers_per_room);
        assert_eq!(config.broadcast_capacity, server.broadcast_capacity);
        assert_eq!(config.heartbeat_interval_secs, server.heartbeat_interval_secs);
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("STAGEHAND_RELAY_BIND_ADDR".to_string(), "0.0.0.0:8080".to_string()),
            ("STAGEHAND_RELAY_MAX_PEERS_PER_ROOM".to_string(), "12".to_string()),
        ];
        let config: RelayConfig = envy::prefixed("STAGEHAND_RELAY_").from_iter(vars).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_peers_per_room, 12);
        assert_eq!(config.broadcast_capacity, 256);
    }
}
