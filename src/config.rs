//! Hub configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BRIDGE_CHANNEL_PREFIX: &str = "chathub";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_COLLABORATOR_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Per-connection transport limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub queue_capacity: usize,
    pub pong_wait: Duration,
    pub max_message_bytes: usize,
}

impl ConnectionLimits {
    /// Probe interval: 90% of the liveness window.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pong_wait: Duration::from_secs(DEFAULT_PONG_WAIT_SECS),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: Option<String>,
    pub bridge_channel_prefix: String,
    pub limits: ConnectionLimits,
    pub collaborator_timeout: Duration,
    pub max_content_chars: usize,
}

impl HubConfig {
    /// Build typed config from the process environment.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT` (3000), `DB_MAX_CONNECTIONS` (5)
    /// - `REDIS_URL`: enables the scale-out bridge
    /// - `BRIDGE_CHANNEL_PREFIX` (`chathub`)
    /// - `WS_QUEUE_CAPACITY` (256), `WS_PONG_WAIT_SECS` (60), `WS_MAX_MESSAGE_BYTES` (65536)
    /// - `COLLABORATOR_TIMEOUT_SECS` (5), `MAX_CONTENT_CHARS` (4000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = lookup("REDIS_URL").filter(|v| !v.trim().is_empty());
        let bridge_channel_prefix =
            lookup("BRIDGE_CHANNEL_PREFIX").unwrap_or_else(|| DEFAULT_BRIDGE_CHANNEL_PREFIX.to_string());

        let limits = ConnectionLimits {
            queue_capacity: parse_positive(&lookup, "WS_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            pong_wait: Duration::from_secs(parse_positive(&lookup, "WS_PONG_WAIT_SECS", DEFAULT_PONG_WAIT_SECS)?),
            max_message_bytes: parse_positive(&lookup, "WS_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
        };

        Ok(Self {
            port: parse_positive(&lookup, "PORT", DEFAULT_PORT)?,
            database_url,
            db_max_connections: parse_positive(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            redis_url,
            bridge_channel_prefix,
            limits,
            collaborator_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "COLLABORATOR_TIMEOUT_SECS",
                DEFAULT_COLLABORATOR_TIMEOUT_SECS,
            )?),
            max_content_chars: parse_positive(&lookup, "MAX_CONTENT_CHARS", DEFAULT_MAX_CONTENT_CHARS)?,
        })
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
