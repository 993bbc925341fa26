//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TailwebSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TAILWEB_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tailweb_core::AllowList;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TailwebSettings;

/// Resolve the default settings path (`~/.tailweb/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tailweb").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TailwebSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error. Validation is left to the caller so
/// CLI flags can still be layered on top.
pub fn load_settings_from_path(path: &Path) -> Result<TailwebSettings> {
    let defaults = serde_json::to_value(TailwebSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TailwebSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply `TAILWEB_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut TailwebSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are ignored
/// with a warning.
pub fn apply_overrides_from<F>(settings: &mut TailwebSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TAILWEB_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("TAILWEB_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("TAILWEB_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v;
    }

    // ── Tail ────────────────────────────────────────────────────────
    if let Some(v) = env.u64("TAILWEB_POLL_INTERVAL_MS", 50, 5_000) {
        settings.tail.poll_interval_ms = v;
    }
    if let Some(v) = env.usize("TAILWEB_BACKFILL_LINES", 0, 100_000) {
        settings.tail.backfill_lines = v;
    }
    if let Some(v) = env.u64("TAILWEB_IDLE_TIMEOUT_SECS", 1, 86_400) {
        settings.tail.idle_timeout_secs = v;
    }
    if let Some(v) = env.bool("TAILWEB_USE_NOTIFY") {
        settings.tail.use_notify = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = env.usize("TAILWEB_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.hub.queue_capacity = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TAILWEB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TAILWEB_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Files ───────────────────────────────────────────────────────
    if let Some(v) = env.string("TAILWEB_FILES") {
        match parse_file_list(&v) {
            Some(files) => settings.files = files,
            None => warn!(key = "TAILWEB_FILES", value = %v, "invalid file list, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse `name=/abs/path,name2=/abs/path2`. All-or-nothing.
pub fn parse_file_list(val: &str) -> Option<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in val.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, path) = AllowList::parse_entry(entry).ok()?;
        let _ = files.insert(name, path.to_string_lossy().into_owned());
    }
    (!files.is_empty()).then_some(files)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.raw(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.raw(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> TailwebSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = TailwebSettings::default();
        apply_overrides_from(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8000, "host": "127.0.0.1"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"a": [1, 2, 3]}),
            serde_json::json!({"a": [9]}),
        );
        assert_eq!(merged["a"], serde_json::json!([9]));
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.tail.poll_interval_ms, 250);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"tail": {"backfillLines": 10}, "files": {"app": "/var/log/app.log"}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.tail.backfill_lines, 10);
        assert_eq!(settings.tail.poll_interval_ms, 250);
        assert_eq!(settings.files["app"], "/var/log/app.log");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let settings = overrides(&[
            ("TAILWEB_HOST", "0.0.0.0"),
            ("TAILWEB_PORT", "9000"),
            ("TAILWEB_POLL_INTERVAL_MS", "100"),
            ("TAILWEB_BACKFILL_LINES", "10"),
            ("TAILWEB_QUEUE_CAPACITY", "64"),
            ("TAILWEB_IDLE_TIMEOUT_SECS", "5"),
            ("TAILWEB_LOG_LEVEL", "debug"),
            ("TAILWEB_LOG_JSON", "yes"),
        ]);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.tail.poll_interval_ms, 100);
        assert_eq!(settings.tail.backfill_lines, 10);
        assert_eq!(settings.hub.queue_capacity, 64);
        assert_eq!(settings.tail.idle_timeout_secs, 5);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let settings = overrides(&[
            ("TAILWEB_PORT", "99999"),
            ("TAILWEB_POLL_INTERVAL_MS", "1"),
            ("TAILWEB_QUEUE_CAPACITY", "zero"),
            ("TAILWEB_LOG_JSON", "maybe"),
            ("TAILWEB_FILES", "app"),
        ]);
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.tail.poll_interval_ms, 250);
        assert_eq!(settings.hub.queue_capacity, 1024);
        assert!(!settings.logging.json);
        assert!(settings.files.is_empty());
    }

    #[test]
    fn env_files_replace_allow_list() {
        let settings = overrides(&[("TAILWEB_FILES", "app=/var/log/app.log, sys=/var/log/syslog")]);
        assert_eq!(settings.files.len(), 2);
        assert_eq!(settings.files["sys"], "/var/log/syslog");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("49", 50, 5000), None);
        assert_eq!(parse_usize_range("abc", 0, 10), None);
    }

    #[test]
    fn parse_file_list_is_all_or_nothing() {
        assert!(parse_file_list("a=/x,bad").is_none());
        assert!(parse_file_list("").is_none());
        assert_eq!(parse_file_list("a=/x,").unwrap().len(), 1);
    }
}
