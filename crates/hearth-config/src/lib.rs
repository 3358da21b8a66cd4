//! Environment configuration for the hearth bridge daemon.
//!
//! The daemon is configured entirely through environment variables
//! (`HOME_HOST`, `MQTT_BROKER_HOST`, ...), validated here into the
//! runtime [`BridgeConfig`] that `hearth-core` consumes. Missing
//! required values are the one startup error allowed to terminate the
//! process, so they get a precise diagnostic.

use std::path::PathBuf;
use std::time::Duration;

use figment::{Figment, providers::Env};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use hearth_core::BridgeConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {name} is not set")]
    MissingVar { name: &'static str },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Raw environment shape ───────────────────────────────────────────

/// Environment variables as figment extracts them (names lowercased).
/// Everything is optional here; [`load`] decides what is required.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    home_host: Option<String>,
    home_port: Option<u16>,
    home_username: Option<String>,
    home_password: Option<String>,
    api_prefix: Option<String>,
    mqtt_broker_host: Option<String>,
    mqtt_broker_port: Option<u16>,
    device_id: Option<String>,
    local_server_port: Option<u16>,
    health_check_interval_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    cache_snapshot_path: Option<PathBuf>,
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load and validate the bridge configuration from the environment.
pub fn load() -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = Figment::new().merge(Env::raw()).extract()?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<BridgeConfig, ConfigError> {
    let remote_host = raw
        .home_host
        .filter(|h| !h.is_empty())
        .ok_or(ConfigError::MissingVar { name: "HOME_HOST" })?;
    let username = raw
        .home_username
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingVar { name: "HOME_USERNAME" })?;
    let password = raw
        .home_password
        .ok_or(ConfigError::MissingVar { name: "HOME_PASSWORD" })?;

    let health_secs = raw.health_check_interval_secs.unwrap_or(30);
    if health_secs == 0 {
        return Err(ConfigError::Validation {
            field: "HEALTH_CHECK_INTERVAL_SECS".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    Ok(BridgeConfig {
        remote_host,
        remote_port: raw.home_port.unwrap_or(8000),
        username,
        password: SecretString::from(password),
        api_prefix: raw.api_prefix.unwrap_or_else(|| "/api".into()),
        mqtt_host: raw.mqtt_broker_host.unwrap_or_else(|| "localhost".into()),
        mqtt_port: raw.mqtt_broker_port.unwrap_or(1883),
        device_id: raw.device_id.unwrap_or_else(|| "controller".into()),
        local_port: raw.local_server_port.unwrap_or(8080),
        health_interval: Duration::from_secs(health_secs),
        reconnect_delay: Duration::from_secs(raw.reconnect_delay_secs.unwrap_or(5)),
        cache_snapshot: raw.cache_snapshot_path,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn full_environment_loads() {
        Jail::expect_with(|jail| {
            jail.set_env("HOME_HOST", "192.168.1.10");
            jail.set_env("HOME_PORT", "9000");
            jail.set_env("HOME_USERNAME", "controller");
            jail.set_env("HOME_PASSWORD", "hunter2");
            jail.set_env("MQTT_BROKER_HOST", "broker.local");
            jail.set_env("MQTT_BROKER_PORT", "1884");
            jail.set_env("DEVICE_ID", "bridge-7");
            jail.set_env("LOCAL_SERVER_PORT", "8088");
            jail.set_env("HEALTH_CHECK_INTERVAL_SECS", "15");

            let config = load().expect("config loads");
            assert_eq!(config.remote_host, "192.168.1.10");
            assert_eq!(config.remote_port, 9000);
            assert_eq!(config.mqtt_host, "broker.local");
            assert_eq!(config.mqtt_port, 1884);
            assert_eq!(config.device_id, "bridge-7");
            assert_eq!(config.local_port, 8088);
            assert_eq!(config.health_interval, Duration::from_secs(15));
            assert_eq!(config.remote_url().as_str(), "http://192.168.1.10:9000/");
            Ok(())
        });
    }

    #[test]
    fn defaults_fill_the_optional_values() {
        Jail::expect_with(|jail| {
            jail.set_env("HOME_HOST", "10.0.0.2");
            jail.set_env("HOME_USERNAME", "controller");
            jail.set_env("HOME_PASSWORD", "pw");

            let config = load().expect("config loads");
            assert_eq!(config.remote_port, 8000);
            assert_eq!(config.mqtt_host, "localhost");
            assert_eq!(config.mqtt_port, 1883);
            assert_eq!(config.api_prefix, "/api");
            assert_eq!(config.device_id, "controller");
            assert!(config.cache_snapshot.is_none());
            Ok(())
        });
    }

    #[test]
    fn missing_host_is_a_precise_error() {
        let result = validate(RawConfig {
            home_username: Some("u".into()),
            home_password: Some("p".into()),
            ..RawConfig::default()
        });
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar { name: "HOME_HOST" })
        ));
    }

    #[test]
    fn zero_health_interval_is_rejected() {
        let result = validate(RawConfig {
            home_host: Some("h".into()),
            home_username: Some("u".into()),
            home_password: Some("p".into()),
            health_check_interval_secs: Some(0),
            ..RawConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }
}
