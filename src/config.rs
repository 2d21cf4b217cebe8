//! Client configuration.
//!
//! Defaults target a local server on the standard query port. Every field can
//! be loaded from JSON (missing fields fall back to the defaults) and the
//! endpoint can be overridden through the environment:
//!
//! | Variable                 | Field               |
//! |--------------------------|---------------------|
//! | `TS3_QUERY_HOST`         | `host`              |
//! | `TS3_QUERY_PORT`         | `port`              |
//! | `TS3_QUERY_IDLE_TIMEOUT` | `idle_timeout_secs` (`0` disables) |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::query::escape::EscapePolicy;
use crate::query::events::DEFAULT_EVENT_CAPACITY;
use crate::query::handshake::DEFAULT_GREETING;

/// Default ServerQuery host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default ServerQuery (raw) port.
pub const DEFAULT_PORT: u16 = 10011;
/// Default limit for TCP connect plus preamble, in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings for one query connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Limit for connecting and reading the preamble.
    pub connect_timeout_secs: u64,
    /// Close the connection after this long without socket activity.
    pub idle_timeout_secs: Option<u64>,
    pub escape_policy: EscapePolicy,
    /// Reject servers whose first line is not `greeting`.
    pub strict_greeting: bool,
    pub greeting: String,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
            escape_policy: EscapePolicy::Standard,
            strict_greeting: true,
            greeting: DEFAULT_GREETING.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Config for `host:port` with every other setting at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and
    /// ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("TS3_QUERY_HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }

        if let Some(port) = lookup("TS3_QUERY_PORT") {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring invalid TS3_QUERY_PORT value: {}", port),
            }
        }

        if let Some(secs) = lookup("TS3_QUERY_IDLE_TIMEOUT") {
            match secs.trim().parse::<u64>() {
                Ok(0) => self.idle_timeout_secs = None,
                Ok(secs) => self.idle_timeout_secs = Some(secs),
                Err(_) => warn!("Ignoring invalid TS3_QUERY_IDLE_TIMEOUT value: {}", secs),
            }
        }
    }

    /// Limit for TCP connect plus preamble.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle limit, if any. Zero disables it like an unset value.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
