//! Engine tunables loaded from a [`config::Config`].
//!
//! Lookup follows this priority:
//! 1. `{name}.{key}` (e.g., `lobby.send_queue_limit`)
//! 2. `{key}` (e.g., `send_queue_limit`)
//! 3. Hard-coded default

use crate::error::Error;
use crate::wire::MAX_FRAME_PAYLOAD;
use crate::IpFamily;
use ::config::Config;
use std::time::Duration;

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = MAX_FRAME_PAYLOAD;
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default, anything else is a real error.
pub(crate) fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Per-connection tunables shared by [`Connection`](crate::Connection) and
/// [`Listener`](crate::Listener).
///
/// # Configuration Keys
///
/// - `send_queue_limit`: maximum queued outbound messages, 0 for unbounded
/// - `recv_queue_limit`: maximum queued inbound messages, 0 for unbounded
/// - `max_message_size`: largest payload sent or accepted, in bytes. Defaults
///   to the 32-bit length limit; lower it to bound what a peer can make the
///   receiver allocate
/// - `send_backoff_us`: pause after every sent message, in microseconds
/// - `drain_timeout_ms`: how long a graceful close waits for the kernel send
///   queue to empty, 0 to skip
/// - `close_timeout_secs`: default bound of a graceful close
/// - `stop_timeout_secs`: how long stopping the engine waits for its threads
/// - `tcp_nodelay`: disable Nagle's algorithm on new sockets
/// - `ip_family`: `"any"`, `"v4"` or `"v6"`
///
/// # Example
///
/// ```toml
/// send_queue_limit = 1024
///
/// [lobby]
/// drain_timeout_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub send_queue_limit: Option<usize>,
    pub recv_queue_limit: Option<usize>,
    pub max_message_size: usize,
    pub send_backoff: Duration,
    pub drain_timeout: Duration,
    pub close_timeout: Duration,
    pub stop_timeout: Duration,
    pub tcp_nodelay: bool,
    pub ip_family: IpFamily,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_queue_limit: None,
            recv_queue_limit: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_backoff: Duration::ZERO,
            drain_timeout: Duration::ZERO,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            tcp_nodelay: true,
            ip_family: IpFamily::Any,
        }
    }
}

impl EngineConfig {
    /// Reads the engine tunables from configuration.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the engine tunables with configuration namespacing.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let limit = |key: &str| -> Result<Option<usize>, Error> {
            Ok(optional(get_namespaced_usize(config, name, key))?.filter(|&n| n > 0))
        };

        let ip_family = match optional(get_namespaced_string(config, name, "ip_family"))? {
            Some(value) => value.parse()?,
            None => defaults.ip_family,
        };

        Ok(Self {
            send_queue_limit: limit("send_queue_limit")?,
            recv_queue_limit: limit("recv_queue_limit")?,
            max_message_size: optional(get_namespaced_usize(config, name, "max_message_size"))?
                .unwrap_or(defaults.max_message_size),
            send_backoff: optional(get_namespaced_u64(config, name, "send_backoff_us"))?
                .map(Duration::from_micros)
                .unwrap_or(defaults.send_backoff),
            drain_timeout: optional(get_namespaced_u64(config, name, "drain_timeout_ms"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            close_timeout: optional(get_namespaced_u64(config, name, "close_timeout_secs"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.close_timeout),
            stop_timeout: optional(get_namespaced_u64(config, name, "stop_timeout_secs"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            tcp_nodelay: optional(get_namespaced_bool(config, name, "tcp_nodelay"))?
                .unwrap_or(defaults.tcp_nodelay),
            ip_family,
        })
    }
}
