use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::ConnectOptions;

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Browser origin allowed by CORS.
    pub frontend_url: String,
    /// Maximum session age before the sweeper tears it down.
    pub session_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    /// Delay between delivering the session string and teardown.
    pub completion_grace_ms: u64,
    /// Root under which per-session credential directories are created.
    pub sessions_dir: PathBuf,
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            frontend_url: "http://localhost:3000".into(),
            session_timeout_ms: 300_000,
            sweep_interval_secs: 60,
            completion_grace_ms: 5_000,
            sessions_dir: PathBuf::from("./sessions"),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            browser: self.protocol.browser.clone(),
            connect_timeout: Duration::from_millis(self.protocol.connect_timeout_ms),
            query_timeout: Duration::from_millis(self.protocol.query_timeout_ms),
            keep_alive: Duration::from_millis(self.protocol.keep_alive_ms),
        }
    }
}

/// Settings for the sidecar that hosts the messaging-protocol library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub bridge_url: String,
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub keep_alive_ms: u64,
    /// Name, agent and version announced to the server.
    pub browser: [String; 3],
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let defaults = ConnectOptions::default();
        Self {
            bridge_url: "ws://127.0.0.1:5100/connect".into(),
            connect_timeout_ms: duration_ms(defaults.connect_timeout),
            query_timeout_ms: duration_ms(defaults.query_timeout),
            keep_alive_ms: duration_ms(defaults.keep_alive),
            browser: defaults.browser,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
