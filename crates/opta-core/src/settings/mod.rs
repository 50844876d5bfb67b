//! Daemon configuration.
//!
//! Layers, lowest to highest priority:
//! 1. Compiled defaults ([`DaemonSettings::default()`])
//! 2. `~/.config/opta/daemon/config.json`, deep-merged over the defaults
//! 3. `OPTA_*` environment variables
//! 4. Command-line flags, applied by the binary
//!
//! Every section deserializes with `#[serde(default)]`, so the user file may
//! be partial.

pub mod loader;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::{
    apply_env_overrides, apply_env_overrides_from, daemon_dir, deep_merge, load_settings,
    load_settings_from_path, settings_path, SettingsError,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonSettings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub sessions: SessionSettings,
    pub tools: ToolSettings,
    pub watchdog: WatchdogSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Bearer token clients must present. Generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Per-connection outbound buffer before a slow client is dropped.
    pub max_send_queue: usize,
    pub heartbeat_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            token: None,
            max_send_queue: 1024,
            heartbeat_secs: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    pub preferred_host: String,
    /// Tried in order when the preferred host is down. Entries may carry an
    /// explicit `host:port`.
    pub fallback_hosts: Vec<String>,
    pub port: u16,
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub cooldown_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            preferred_host: "localhost".to_string(),
            fallback_hosts: Vec::new(),
            port: 1234,
            scheme: "http".to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.2,
            cooldown_ms: 30_000,
        }
    }
}

impl UpstreamSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub default_model: String,
    pub max_queued_turns_per_session: usize,
    pub abort_grace_ms: u64,
    pub max_agent_iterations: u32,
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            max_queued_turns_per_session: 32,
            abort_grace_ms: 2_000,
            max_agent_iterations: 8,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub workers: usize,
    pub timeout_ms: u64,
    pub permission_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_ms: 120_000,
            permission_timeout_ms: 60_000,
            working_directory: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub threshold: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            threshold: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Defaults to `daemon.log` in the daemon directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub stdout: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            stdout: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Defaults to `sessions.db` in the daemon directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Keep everything in memory; nothing survives a restart.
    pub ephemeral: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = DaemonSettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.watchdog.threshold, 2);
        assert_eq!(s.upstream.scheme, "http");
        assert!(s.upstream.fallback_hosts.is_empty());
        assert!(s.tools.workers > 0);
        assert!(!s.storage.ephemeral);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let s: DaemonSettings =
            serde_json::from_str(r#"{"upstream":{"preferredHost":"mono512.local"}}"#).unwrap();
        assert_eq!(s.upstream.preferred_host, "mono512.local");
        assert_eq!(s.upstream.port, 1234);
        assert_eq!(s.server.port, 9999);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(DaemonSettings::default()).unwrap();
        assert!(json["sessions"]["maxQueuedTurnsPerSession"].is_number());
        assert!(json["server"].get("token").is_none());
    }
}
