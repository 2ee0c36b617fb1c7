//! Service configuration.
//!
//! Layers, lowest priority first: built-in defaults, an optional TOML file,
//! environment variables, command-line flags (applied by `main`).

pub mod schema;

use anyhow::Context;
use std::path::Path;
use std::str::FromStr;

pub use schema::{Config, ProtocolConfig};

impl Config {
    /// Defaults, overlaid with `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment overrides read through `lookup`. Values that fail
    /// to parse are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        override_parsed(&lookup, "PORT", &mut self.port);
        if let Some(url) = lookup("FRONTEND_URL").filter(|u| !u.trim().is_empty()) {
            self.frontend_url = url.trim().to_string();
        }
        override_parsed(&lookup, "SESSION_TIMEOUT", &mut self.session_timeout_ms);
        override_parsed(&lookup, "SWEEP_INTERVAL", &mut self.sweep_interval_secs);
        override_parsed(&lookup, "COMPLETION_GRACE", &mut self.completion_grace_ms);
        if let Some(dir) = lookup("SESSIONS_DIR").filter(|d| !d.trim().is_empty()) {
            self.sessions_dir = dir.trim().into();
        }
        if let Some(url) = lookup("PROTOCOL_BRIDGE_URL").filter(|u| !u.trim().is_empty()) {
            self.protocol.bridge_url = url.trim().to_string();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_timeout_ms == 0 {
            anyhow::bail!("session_timeout_ms must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be greater than zero");
        }
        if self.protocol.connect_timeout_ms == 0 || self.protocol.query_timeout_ms == 0 {
            anyhow::bail!("protocol timeouts must be greater than zero");
        }
        if self.sessions_dir.as_os_str().is_empty() {
            anyhow::bail!("sessions_dir must not be empty");
        }
        let url = self.protocol.bridge_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("protocol.bridge_url must be a ws:// or wss:// URL, got {url:?}");
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring malformed environment value"),
    }
}
