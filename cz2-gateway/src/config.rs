//! Environment-driven configuration.
//!
//! Every knob has a default suitable for a LAN deployment next to a
//! serial-over-IP bridge; range checks reject values the controller or the
//! service cannot honor.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// `host:port` of a serial bridge, or a serial device path.
    pub cz_connect: String,
    /// Configured zone count, 1-8.
    pub cz_zones: u8,
    /// Optional display names, one per zone.
    pub cz_zone_names: Option<Vec<String>>,
    /// Our address on the bus, 1-255.
    pub cz_id: u8,

    pub api_host: String,
    pub api_port: u16,

    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,

    pub enable_cache: bool,
    pub cache_stale_seconds: u64,
    pub cache_db_path: Option<PathBuf>,
    pub cache_refresh_interval: u64,

    pub enable_sse: bool,
    pub sse_heartbeat_interval: u64,
    pub sse_max_subscribers_per_ip: usize,

    pub command_timeout_seconds: u64,

    /// Optional monitoring endpoint pinged after successful refreshes.
    pub healthcheck_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cz_connect: "localhost:8899".to_string(),
            cz_zones: 1,
            cz_zone_names: None,
            cz_id: 99,
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            mqtt_enabled: false,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            mqtt_topic_prefix: "hvac/cz2".to_string(),
            enable_cache: true,
            cache_stale_seconds: 300,
            cache_db_path: None,
            cache_refresh_interval: 300,
            enable_sse: true,
            sse_heartbeat_interval: 30,
            sse_max_subscribers_per_ip: 5,
            command_timeout_seconds: 30,
            healthcheck_url: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let cz_zones = parse_or("CZ_ZONES", defaults.cz_zones)?;
        range_check("CZ_ZONES", cz_zones as i64, 1, 8)?;

        let cz_id = parse_or("CZ_ID", defaults.cz_id)?;
        range_check("CZ_ID", cz_id as i64, 1, 255)?;

        let cache_stale_seconds = parse_or("CACHE_STALE_SECONDS", defaults.cache_stale_seconds)?;
        range_check("CACHE_STALE_SECONDS", cache_stale_seconds as i64, 10, i64::MAX)?;

        let cache_refresh_interval =
            parse_or("CACHE_REFRESH_INTERVAL", defaults.cache_refresh_interval)?;
        range_check(
            "CACHE_REFRESH_INTERVAL",
            cache_refresh_interval as i64,
            30,
            i64::MAX,
        )?;

        let sse_heartbeat_interval =
            parse_or("SSE_HEARTBEAT_INTERVAL", defaults.sse_heartbeat_interval)?;
        range_check(
            "SSE_HEARTBEAT_INTERVAL",
            sse_heartbeat_interval as i64,
            10,
            i64::MAX,
        )?;

        let sse_max_subscribers_per_ip = parse_or(
            "SSE_MAX_SUBSCRIBERS_PER_IP",
            defaults.sse_max_subscribers_per_ip,
        )?;
        range_check(
            "SSE_MAX_SUBSCRIBERS_PER_IP",
            sse_max_subscribers_per_ip as i64,
            1,
            i64::MAX,
        )?;

        let command_timeout_seconds =
            parse_or("COMMAND_TIMEOUT_SECONDS", defaults.command_timeout_seconds)?;
        range_check(
            "COMMAND_TIMEOUT_SECONDS",
            command_timeout_seconds as i64,
            5,
            i64::MAX,
        )?;

        let cz_zone_names = match env::var("CZ_ZONE_NAMES") {
            Ok(raw) => {
                let names: Vec<String> = raw
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect();
                if names.is_empty() {
                    None
                } else {
                    if names.len() != cz_zones as usize {
                        return Err(ConfigError::Invalid {
                            key: "CZ_ZONE_NAMES",
                            message: format!(
                                "{} names given but CZ_ZONES is {}",
                                names.len(),
                                cz_zones
                            ),
                        });
                    }
                    Some(names)
                }
            }
            Err(_) => None,
        };

        Ok(Settings {
            cz_connect: string_or("CZ_CONNECT", &defaults.cz_connect),
            cz_zones,
            cz_zone_names,
            cz_id,
            api_host: string_or("API_HOST", &defaults.api_host),
            api_port: parse_or("API_PORT", defaults.api_port)?,
            mqtt_enabled: truthy_or("MQTT_ENABLED", defaults.mqtt_enabled),
            mqtt_host: string_or("MQTT_HOST", &defaults.mqtt_host),
            mqtt_port: parse_or("MQTT_PORT", defaults.mqtt_port)?,
            mqtt_user: env::var("MQTT_USER").ok(),
            mqtt_password: env::var("MQTT_PASSWORD").ok(),
            mqtt_topic_prefix: string_or("MQTT_TOPIC_PREFIX", &defaults.mqtt_topic_prefix),
            enable_cache: truthy_or("ENABLE_CACHE", defaults.enable_cache),
            cache_stale_seconds,
            cache_db_path: env::var("CACHE_DB_PATH").ok().map(PathBuf::from),
            cache_refresh_interval,
            enable_sse: truthy_or("ENABLE_SSE", defaults.enable_sse),
            sse_heartbeat_interval,
            sse_max_subscribers_per_ip,
            command_timeout_seconds,
            healthcheck_url: env::var("HEALTHCHECK_URL").ok(),
        })
    }

    /// Global subscriber cap, derived from the per-IP cap.
    pub fn sse_max_subscribers(&self) -> usize {
        self.sse_max_subscribers_per_ip * 20
    }

    /// Cache database location; falls back to a dotfile in the home
    /// directory.
    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_db_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cz2_cache.db")
        })
    }
}

fn string_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn truthy_or(key: &'static str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn range_check(key: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{value} outside [{min}, {max}]"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.cz_connect, "localhost:8899");
        assert_eq!(settings.cz_zones, 1);
        assert_eq!(settings.cz_id, 99);
        assert_eq!(settings.command_timeout_seconds, 30);
        assert_eq!(settings.sse_max_subscribers(), 100);
    }

    #[test]
    fn truthy_parsing() {
        std::env::set_var("CZ2_TEST_TRUTHY", "yes");
        assert!(truthy_or("CZ2_TEST_TRUTHY", false));
        std::env::set_var("CZ2_TEST_TRUTHY", "0");
        assert!(!truthy_or("CZ2_TEST_TRUTHY", true));
        std::env::remove_var("CZ2_TEST_TRUTHY");
    }

    #[test]
    fn range_violations_are_rejected() {
        assert!(range_check("CZ_ZONES", 9, 1, 8).is_err());
        assert!(range_check("CZ_ZONES", 0, 1, 8).is_err());
        assert!(range_check("COMMAND_TIMEOUT_SECONDS", 4, 5, i64::MAX).is_err());
        assert!(range_check("CZ_ZONES", 4, 1, 8).is_ok());
    }
}
