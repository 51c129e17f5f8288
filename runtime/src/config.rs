//! Configuration management for the runtime.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transport protocol of the backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(ConfigError::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Network coordinates of the backend, consumed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl BackendEndpoint {
    /// Base URL without a trailing slash, e.g. `https://api.example.com:443`.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend host, port and protocol
    pub backend: BackendEndpoint,
    /// Identifies this device to the broker and names its reply inbox
    pub device_id: String,
    /// Capacity of the outbound buffer used while disconnected
    pub reconnect_buffer: usize,
    /// Whether to buffer publishes while disconnected instead of dropping them
    pub buffer_offline: bool,
    /// Timeout for request/reply calls and HTTP requests
    pub request_timeout: Duration,
    /// First delay between reconnect attempts
    pub retry_initial: Duration,
    /// Ceiling for the reconnect delay
    pub retry_max: Duration,
    /// Credentials for an interactive login when the cached session is gone
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendEndpoint {
                host: "localhost".to_string(),
                port: 8080,
                protocol: Protocol::Https,
            },
            device_id: uuid::Uuid::new_v4().to_string(),
            reconnect_buffer: fieldsync_engine::buffer::DEFAULT_BUFFER_CAPACITY,
            buffer_offline: true,
            request_timeout: Duration::from_secs(10),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
            username: None,
            password: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("FIELDSYNC_BACKEND_HOST").unwrap_or(defaults.backend.host);
        if host.trim().is_empty() {
            return Err(ConfigError::MissingBackendHost);
        }

        let port = parse(&lookup, "FIELDSYNC_BACKEND_PORT", defaults.backend.port)?;

        let protocol = match lookup("FIELDSYNC_BACKEND_PROTOCOL") {
            Some(value) => value.parse()?,
            None => defaults.backend.protocol,
        };

        let device_id = lookup("FIELDSYNC_DEVICE_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(defaults.device_id);

        let reconnect_buffer = parse(
            &lookup,
            "FIELDSYNC_RECONNECT_BUFFER",
            defaults.reconnect_buffer,
        )?;
        if reconnect_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FIELDSYNC_RECONNECT_BUFFER",
                value: "0".to_string(),
            });
        }

        let buffer_offline = parse(&lookup, "FIELDSYNC_BUFFER_OFFLINE", defaults.buffer_offline)?;
        let request_timeout = Duration::from_secs(parse(
            &lookup,
            "FIELDSYNC_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?);
        let retry_initial = Duration::from_millis(parse(
            &lookup,
            "FIELDSYNC_RETRY_INITIAL_MS",
            defaults.retry_initial.as_millis() as u64,
        )?);
        let retry_max = Duration::from_secs(parse(
            &lookup,
            "FIELDSYNC_RETRY_MAX_SECS",
            defaults.retry_max.as_secs(),
        )?);

        Ok(Self {
            backend: BackendEndpoint {
                host,
                port,
                protocol,
            },
            device_id,
            reconnect_buffer,
            buffer_offline,
            request_timeout,
            retry_initial,
            retry_max,
            username: lookup("FIELDSYNC_USERNAME"),
            password: lookup("FIELDSYNC_PASSWORD"),
        })
    }

    /// Username and password, when both are configured.
    pub fn login(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("FIELDSYNC_BACKEND_HOST must not be empty")]
    MissingBackendHost,

    #[error("Invalid protocol '{0}', expected http or https")]
    InvalidProtocol(String),

    #[error("Invalid {key} value '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend.base_url(), "https://localhost:8080");
        assert_eq!(config.reconnect_buffer, 100);
        assert!(config.buffer_offline);
        assert!(config.login().is_none());
        assert!(!config.device_id.is_empty());
    }

    #[test]
    fn overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FIELDSYNC_BACKEND_HOST", "sync.example.org"),
            ("FIELDSYNC_BACKEND_PORT", "9443"),
            ("FIELDSYNC_BACKEND_PROTOCOL", "HTTP"),
            ("FIELDSYNC_DEVICE_ID", "tablet-7"),
            ("FIELDSYNC_RECONNECT_BUFFER", "5"),
            ("FIELDSYNC_BUFFER_OFFLINE", "false"),
            ("FIELDSYNC_RETRY_INITIAL_MS", "20"),
            ("FIELDSYNC_USERNAME", "surveyor"),
            ("FIELDSYNC_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.backend.base_url(), "http://sync.example.org:9443");
        assert_eq!(config.device_id, "tablet-7");
        assert_eq!(config.reconnect_buffer, 5);
        assert!(!config.buffer_offline);
        assert_eq!(config.retry_initial, Duration::from_millis(20));
        assert_eq!(config.login(), Some(("surveyor", "secret")));
    }

    #[test]
    fn invalid_values() {
        let err = Config::from_lookup(lookup(&[("FIELDSYNC_BACKEND_PORT", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "FIELDSYNC_BACKEND_PORT",
                value: "eighty".to_string()
            }
        );

        let err =
            Config::from_lookup(lookup(&[("FIELDSYNC_BACKEND_PROTOCOL", "ftp")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidProtocol("ftp".to_string()));

        let err = Config::from_lookup(lookup(&[("FIELDSYNC_BACKEND_HOST", " ")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingBackendHost);

        let err =
            Config::from_lookup(lookup(&[("FIELDSYNC_RECONNECT_BUFFER", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
