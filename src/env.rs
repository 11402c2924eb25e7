//! Environment construction for child processes.
//!
//! A child sees the supervisor's inherited environment overlaid with the
//! entry's own mapping; the entry wins on collision. Values may hold secrets
//! and are never logged, only keys are.
use std::collections::BTreeMap;

use tracing::warn;

/// Captures the supervisor's current environment, skipping non UTF-8 pairs.
pub fn inherited() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Overlays `overrides` on top of `base`; keys are case-sensitive.
pub fn overlay(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Checks that a key can be placed into an OS environment block.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("environment key must not be empty".into());
    }
    if key.contains('=') {
        return Err(format!("environment key '{key}' must not contain '='"));
    }
    if key.contains('\0') {
        return Err(format!("environment key '{key}' must not contain NUL"));
    }
    Ok(())
}

/// Checks that a value can be placed into an OS environment block.
pub fn validate_value(key: &str, value: &str) -> Result<(), String> {
    if value.contains('\0') {
        return Err(format!("value of environment key '{key}' must not contain NUL"));
    }
    Ok(())
}

/// Parses `KEY=VALUE` lines from an env file.
///
/// Blank lines and `#` comments are skipped; matching surrounding double
/// quotes are stripped. The first occurrence of a key wins.
pub fn parse_env_file(content: &str, entry: &str) -> BTreeMap<String, String> {
    let mut resolved = BTreeMap::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            resolved.entry(key).or_insert_with(|| value.to_string());
        } else {
            warn!("Ignoring malformed env file line for '{entry}'");
        }
    }

    resolved
}

/// Keys of an environment mapping, for logging.
pub fn keys(env: &BTreeMap<String, String>) -> Vec<&str> {
    env.keys().map(String::as_str).collect()
}
