//! Config file/env loading, modeled on the teacher's layered loader.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};

use crate::{validate_config, RuntimeConfig};

const ENV_PREFIX: &str = "LOGAGENT_";

/// Load from an explicit path, applying env overrides and validating.
pub fn load_from_path(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load from default file locations, falling back to built-in defaults if
/// none are found. Always applies env overrides and validates.
pub fn load_or_default() -> Result<RuntimeConfig> {
    let mut config = match find_default_file()? {
        Some(content) => toml::from_str(&content).context("failed to parse config file")?,
        None => RuntimeConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

fn find_default_file() -> Result<Option<String>> {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG")) {
        return Ok(Some(std::fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file: {path}")
        })?));
    }

    for path in ["./config.toml", "./.logagent.toml"] {
        if Path::new(path).exists() {
            return Ok(Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {path}"))?,
            ));
        }
    }

    Ok(None)
}

/// Environment overrides, highest priority. Only the handful of settings
/// an operator is most likely to want to flip without editing the config
/// file are exposed this way — matching the teacher's selective override
/// set rather than a blanket field-by-field mapping.
fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    if let Some(v) = get_env_u32("DISPATCHER_RATE_LIMIT_PER_SEC")? {
        config.dispatcher.rate_limit_per_sec = v;
    }
    if let Some(v) = get_env_u64("DEDUP_TTL_SECS")? {
        config.dedup.ttl_secs = v;
    }
    if let Some(v) = get_env_u64("TIMESTAMP_MAX_ACCEPTABLE_AGE_SECS")? {
        config.timestamp_guard.max_acceptable_age_secs = v;
    }
    if let Some(v) = get_env_u32("CIRCUIT_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = get_env_string("LOG_LEVEL")? {
        config.admin.log_level = v;
    }
    if let Some(v) = get_env_bool("ADMIN_ENABLED")? {
        config.admin.enabled = v;
    }
    if let Some(v) = get_env_string("ADMIN_LISTEN_ADDR")? {
        config.admin.listen_addr = v;
    }
    Ok(())
}

fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read env var {full_key}")),
    }
}

fn get_env_u32(key: &str) -> Result<Option<u32>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match get_env_string(key)? {
        Some(v) => Ok(Some(
            v.parse().with_context(|| format!("{full_key} must be a valid number"))?,
        )),
        None => Ok(None),
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match get_env_string(key)? {
        Some(v) => Ok(Some(
            v.parse().with_context(|| format!("{full_key} must be a valid number"))?,
        )),
        None => Ok(None),
    }
}

fn get_env_bool(key: &str) -> Result<Option<bool>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match get_env_string(key)? {
        Some(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("{full_key} must be true or false"),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = RuntimeConfig::default();
        assert!(validate_config(&config).is_err(), "no sinks configured must fail validation");
    }

    #[test]
    fn loads_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[sinks]]
            type = "local_file"
            name = "disk"
            directory = "/tmp/logagent-test"
            "#
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.sinks.len(), 1);
        assert_eq!(config.sinks[0].name(), "disk");
    }
}
