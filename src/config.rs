//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::client::ClientConfig;
use crate::connection::ConnectionConfig;
use crate::fleet::{FleetConfig, DEFAULT_RELAY};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding `events.sqlite3` and `relays.json`.
    pub data_dir: PathBuf,
    /// Relay that is always configured and cannot be removed.
    pub default_relay: String,
    /// Seed relays used when no relay list has been saved yet.
    pub relays: Vec<String>,
    /// Optional REST gateway base URL.
    pub gateway_url: Option<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub heartbeat_secs: u64,
    pub pong_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub gateway_timeout_secs: u64,
    pub status_poll_secs: u64,
    /// Check ids and signatures of events from relays, the gateway and `ingest`.
    pub verify_sig: bool,
    /// Default tracing level; `RUST_LOG` wins when set.
    pub log_level: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let data_dir = PathBuf::from(env::var("DATA_DIR").context("DATA_DIR is not set")?);
        let default_relay = non_empty("DEFAULT_RELAY").unwrap_or_else(|| DEFAULT_RELAY.into());
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1";
        Ok(Self {
            data_dir,
            default_relay,
            relays,
            gateway_url: non_empty("GATEWAY_URL"),
            tor_socks: non_empty("TOR_SOCKS"),
            heartbeat_secs: number("HEARTBEAT_SECS", 30),
            pong_timeout_secs: number("PONG_TIMEOUT_SECS", 10),
            reconnect_base_ms: number("RECONNECT_BASE_MS", 1000),
            reconnect_cap_ms: number("RECONNECT_CAP_MS", 60_000),
            max_reconnect_attempts: number("MAX_RECONNECT_ATTEMPTS", 10),
            connect_timeout_secs: number("CONNECT_TIMEOUT_SECS", 10),
            query_timeout_secs: number("QUERY_TIMEOUT_SECS", 10),
            gateway_timeout_secs: number("GATEWAY_TIMEOUT_SECS", 5),
            status_poll_secs: number("STATUS_POLL_SECS", 5),
            verify_sig,
            log_level: non_empty("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("events.sqlite3")
    }

    /// Zero periods are raised to one unit; a zero heartbeat would stall the timer.
    pub fn connection_config(&self) -> ConnectionConfig {
        let reconnect_base_ms = self.reconnect_base_ms.max(1);
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs.max(1)),
            reconnect_base: Duration::from_millis(reconnect_base_ms),
            reconnect_cap: Duration::from_millis(self.reconnect_cap_ms.max(reconnect_base_ms)),
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            auto_reconnect: true,
            tor_socks: self.tor_socks.clone(),
        }
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            default_relay: self.default_relay.clone(),
            connection: self.connection_config(),
            status_poll: Duration::from_secs(self.status_poll_secs.max(1)),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            query_timeout: Duration::from_secs(self.query_timeout_secs.max(1)),
            gateway_timeout: Duration::from_secs(self.gateway_timeout_secs.max(1)),
            verify_signatures: self.verify_sig,
            ..ClientConfig::default()
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn number<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) const ENV_VARS: [&str; 17] = [
    "DATA_DIR",
    "DEFAULT_RELAY",
    "RELAYS",
    "GATEWAY_URL",
    "TOR_SOCKS",
    "HEARTBEAT_SECS",
    "PONG_TIMEOUT_SECS",
    "RECONNECT_BASE_MS",
    "RECONNECT_CAP_MS",
    "MAX_RECONNECT_ATTEMPTS",
    "CONNECT_TIMEOUT_SECS",
    "QUERY_TIMEOUT_SECS",
    "GATEWAY_TIMEOUT_SECS",
    "STATUS_POLL_SECS",
    "VERIFY_SIG",
    "LOG_LEVEL",
    "RUST_LOG",
];
