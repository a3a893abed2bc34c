//! Settings resolution with deep merge and environment variable overrides.
//!
//! Resolution flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. Deep-merge caller-supplied JSON over the defaults (optional)
//! 3. Apply `FERRULE_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ClientSettings;

/// Maximum accepted value for `FERRULE_MAX_POOL_SIZE`.
const MAX_POOL_SIZE_LIMIT: usize = 10_000;

/// One hour, the upper bound for every millisecond override.
const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Defaults with environment overrides applied, validated.
pub fn load_settings() -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Deep-merge `user` over the defaults, apply env overrides, validate.
pub fn settings_from_json(user: Value) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;
    let merged = deep_merge(defaults, user);
    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    debug!(max_pool_size = settings.pool.max_pool_size, "settings resolved");
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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

/// Apply `FERRULE_*` environment variables to `settings`.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` (an env-var reader in production).
///
/// Invalid values are logged and ignored, leaving the previous value.
pub fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read_usize = |name: &str, min: usize, max: usize| {
        let val = lookup(name)?;
        let parsed = parse_usize_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };
    let read_u64 = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };

    if let Some(v) = read_usize("FERRULE_MAX_POOL_SIZE", 1, MAX_POOL_SIZE_LIMIT) {
        settings.pool.max_pool_size = v;
    }
    if let Some(v) = read_u64("FERRULE_POOL_IDLE_TIMEOUT_MS", 1, MAX_TIMEOUT_MS) {
        settings.pool.idle_timeout_ms = v;
    }
    if let Some(v) = read_u64("FERRULE_CONTAINER_IDLE_TIMEOUT_MS", 1, MAX_TIMEOUT_MS) {
        settings.container.idle_timeout_ms = Some(v);
    }
    if let Some(v) = read_u64("FERRULE_HANDSHAKE_TIMEOUT_MS", 1, MAX_TIMEOUT_MS) {
        settings.handshake_timeout_ms = v;
    }
    if let Some(val) = lookup("FERRULE_SHARED_CONTAINER") {
        match parse_bool(&val) {
            Some(shared) => settings.container.shared = shared,
            None => warn!(key = "FERRULE_SHARED_CONTAINER", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
