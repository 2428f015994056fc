//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerSettings::default()`]
//! 2. If `~/.roomcast/settings.json` exists, deep-merge its values over defaults
//! 3. Apply `ROOMCAST_*` environment variable overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ServerSettings;

/// Resolve the path to the settings file (`~/.roomcast/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".roomcast").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ServerSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
/// The result is not validated; call [`ServerSettings::validate`] before use.
pub fn load_settings_from_path(path: &Path) -> Result<ServerSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<ServerSettings> {
    let defaults = serde_json::to_value(ServerSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ROOMCAST_*` environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_env_overrides(settings: &mut ServerSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
///
/// Booleans accept `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
/// Integers must parse and fall within the documented range.
pub fn apply_overrides_from<F>(settings: &mut ServerSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("ROOMCAST_HOSTNAME") {
        settings.hostname = v;
    }
    if let Some(v) = env.u16("ROOMCAST_PORT", 0, 65535) {
        settings.port = v;
    }
    if let Some(v) = env.bool("ROOMCAST_SECURE") {
        settings.secure = v;
    }
    if let Some(v) = env.string("ROOMCAST_CERT_FILE") {
        settings.cert_file = Some(PathBuf::from(v));
    }
    if let Some(v) = env.string("ROOMCAST_KEY_FILE") {
        settings.key_file = Some(PathBuf::from(v));
    }
    if let Some(v) = env.string("ROOMCAST_WS_PATH") {
        settings.ws_path = v;
    }
    if let Some(v) = env.usize("ROOMCAST_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.max_connections = v;
    }
    if let Some(v) = env.usize("ROOMCAST_MAX_MESSAGE_SIZE", 1024, 1_073_741_824) {
        settings.max_message_size = v;
    }
    if let Some(v) = env.usize("ROOMCAST_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("ROOMCAST_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("ROOMCAST_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        settings.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env.bool("ROOMCAST_DISPATCH_ON_HALT") {
        settings.dispatch_on_halt = v;
    }
    if let Some(v) = env.string("ROOMCAST_LOG_LEVEL") {
        settings.log_level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
