use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::DaemonSettings;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// `$XDG_CONFIG_HOME/opta/daemon`, falling back to `~/.config/opta/daemon`.
pub fn daemon_dir() -> PathBuf {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    config_home.join("opta").join("daemon")
}

pub fn settings_path() -> PathBuf {
    daemon_dir().join("config.json")
}

pub fn load_settings() -> Result<DaemonSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DaemonSettings, SettingsError> {
    let defaults = serde_json::to_value(DaemonSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DaemonSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, nulls in `source` are
/// skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut DaemonSettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup. Invalid values
/// are logged and ignored.
pub fn apply_env_overrides_from(
    settings: &mut DaemonSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, min: u64, max: u64| -> Option<u64> {
        let raw = string(name)?;
        let parsed = raw.parse::<u64>().ok().filter(|n| (min..=max).contains(n));
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("OPTA_DAEMON_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = number("OPTA_DAEMON_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = string("OPTA_DAEMON_TOKEN") {
        settings.server.token = Some(v);
    }

    if let Some(v) = string("OPTA_UPSTREAM_HOST") {
        settings.upstream.preferred_host = v;
    }
    if let Some(v) = string("OPTA_UPSTREAM_FALLBACKS") {
        settings.upstream.fallback_hosts = v
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = number("OPTA_UPSTREAM_PORT", 1, 65_535) {
        settings.upstream.port = v as u16;
    }
    if let Some(v) = string("OPTA_UPSTREAM_API_KEY") {
        settings.upstream.api_key = Some(v);
    }
    if let Some(v) = number("OPTA_UPSTREAM_TIMEOUT_MS", 100, 3_600_000) {
        settings.upstream.request_timeout_ms = v;
    }

    if let Some(v) = string("OPTA_DEFAULT_MODEL") {
        settings.sessions.default_model = v;
    }
    if let Some(v) = number("OPTA_TOOL_WORKERS", 1, 256) {
        settings.tools.workers = v as usize;
    }
    if let Some(v) = string("OPTA_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = string("OPTA_EPHEMERAL") {
        match parse_bool(&v) {
            Some(b) => settings.storage.ephemeral = b,
            None => warn!(key = "OPTA_EPHEMERAL", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
