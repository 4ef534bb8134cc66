use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::UpdateClass;

/// Client-side tuning, loaded from `STAGEHAND_*` environment variables.
///
/// All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Flush delay for marker drags and other entity streams.
    #[serde(default = "default_continuous_delay_ms")]
    pub continuous_delay_ms: u64,

    /// Flush delay for slider/toggle changes.
    #[serde(default = "default_discrete_delay_ms")]
    pub discrete_delay_ms: u64,

    /// Flush delay for scene-wide settings.
    #[serde(default = "default_structural_delay_ms")]
    pub structural_delay_ms: u64,

    /// How often the retry queue checks whether the provider is connected.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_drift_poll_interval_ms")]
    pub drift_poll_interval_ms: u64,

    #[serde(default = "default_ephemeral_sweep_interval_ms")]
    pub ephemeral_sweep_interval_ms: u64,

    /// Age after which another client's saver claim counts as abandoned.
    /// Zero disables takeover.
    #[serde(default = "default_saver_lease_ms")]
    pub saver_lease_ms: u64,

    /// Wait between claiming the saver role and checking the claim still
    /// names this client, so a concurrent claim from a peer can arrive.
    #[serde(default = "default_saver_settle_ms")]
    pub saver_settle_ms: u64,

    #[serde(default = "default_removed_marker_ttl_ms")]
    pub removed_marker_ttl_ms: u64,

    /// Base URL of the persistence API (scenes, markers, masks).
    #[serde(default = "default_persistence_url")]
    pub persistence_url: String,

    /// WebSocket URL of the relay.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl SyncConfig {
    /// Load from `STAGEHAND_*` variables; falls back to defaults on error.
    pub fn from_env() -> Self {
        match envy::prefixed("STAGEHAND_").from_env::<SyncConfig>() {
            Ok(config) => {
                log::info!("Sync configuration loaded");
                config
            }
            Err(e) => {
                log::error!("Failed to load sync configuration, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn throttle_delay(&self, class: UpdateClass) -> Duration {
        let ms = match class {
            UpdateClass::Continuous => self.continuous_delay_ms,
            UpdateClass::Discrete => self.discrete_delay_ms,
            UpdateClass::Structural => self.structural_delay_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn drift_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drift_poll_interval_ms)
    }

    pub fn ephemeral_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ephemeral_sweep_interval_ms)
    }

    /// Saver lease in milliseconds, `None` when takeover is disabled.
    pub fn saver_lease(&self) -> Option<i64> {
        match self.saver_lease_ms {
            0 => None,
            ms => Some(i64::try_from(ms).unwrap_or(i64::MAX)),
        }
    }

    pub fn saver_settle(&self) -> Duration {
        Duration::from_millis(self.saver_settle_ms)
    }

    pub fn removed_marker_ttl(&self) -> Duration {
        Duration::from_millis(self.removed_marker_ttl_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            continuous_delay_ms: default_continuous_delay_ms(),
            discrete_delay_ms: default_discrete_delay_ms(),
            structural_delay_ms: default_structural_delay_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            drift_poll_interval_ms: default_drift_poll_interval_ms(),
            ephemeral_sweep_interval_ms: default_ephemeral_sweep_interval_ms(),
            saver_lease_ms: default_saver_lease_ms(),
            saver_settle_ms: default_saver_settle_ms(),
            removed_marker_ttl_ms: default_removed_marker_ttl_ms(),
            persistence_url: default_persistence_url(),
            relay_url: default_relay_url(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_continuous_delay_ms() -> u64 {
    50
}

fn default_discrete_delay_ms() -> u64 {
    150
}

fn default_structural_delay_ms() -> u64 {
    500
}

fn default_retry_interval_ms() -> u64 {
    250
}

fn default_drift_poll_interval_ms() -> u64 {
    10_000
}

fn default_ephemeral_sweep_interval_ms() -> u64 {
    1_000
}

fn default_saver_lease_ms() -> u64 {
    30_000
}

fn default_saver_settle_ms() -> u64 {
    200
}

fn default_removed_marker_ttl_ms() -> u64 {
    5_000
}

fn default_persistence_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:9090".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}
