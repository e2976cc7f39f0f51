//! Link configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::reconnect::ConnectBackoff;

/// Everything a [`Link`](crate::Link) needs to identify itself and reach
/// its broker.
///
/// ```toml
/// name = "rng"
/// broker_url = "http://broker.local:8080/conn"
/// connection_attempt_limit = 10
/// max_connection_cooldown = 30
/// load_nodes_json = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Link name; prefix of the dsId.
    #[serde(default = "d_name")]
    pub name: String,
    #[serde(default)]
    pub requester: bool,
    #[serde(default = "d_true")]
    pub responder: bool,
    /// Broker handshake endpoint.
    #[serde(default = "d_broker_url")]
    pub broker_url: String,
    /// File holding the link's key pair.  Created on first run.
    #[serde(default = "d_keys_path")]
    pub keys_path: PathBuf,
    #[serde(default = "d_nodes_path")]
    pub nodes_path: PathBuf,
    /// `json` or `msgpack` forces a payload format; empty takes whatever
    /// the broker negotiates.
    #[serde(default)]
    pub communication_format: String,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    /// Handshake attempts per connect cycle.  Negative is unlimited.
    #[serde(default = "d_attempt_limit")]
    pub connection_attempt_limit: i32,
    /// Cap on the delay between attempts, in seconds.  Must be at least 1.
    #[serde(default = "d_cooldown")]
    pub max_connection_cooldown: u64,
    /// Restore the tree from `nodes_path` at startup.
    #[serde(default)]
    pub load_nodes_json: bool,
    /// Seconds between keepalive pings.
    #[serde(default = "d_keepalive")]
    pub keepalive_interval: u64,
    /// Reconnect after an unexpected close.
    #[serde(default = "d_true")]
    pub auto_reconnect: bool,
    /// Free-form data forwarded to the broker in the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_data: Option<serde_json::Value>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: d_name(),
            requester: false,
            responder: true,
            broker_url: d_broker_url(),
            keys_path: d_keys_path(),
            nodes_path: d_nodes_path(),
            communication_format: String::new(),
            log_level: d_log_level(),
            connection_attempt_limit: d_attempt_limit(),
            max_connection_cooldown: d_cooldown(),
            load_nodes_json: false,
            keepalive_interval: d_keepalive(),
            auto_reconnect: true,
            link_data: None,
        }
    }
}

impl LinkConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, LinkError> {
        let config: LinkConfig =
            toml::from_str(raw).map_err(|e| LinkError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LinkError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.name.trim().is_empty() {
            return Err(LinkError::Config("name must not be empty".into()));
        }
        if self.broker_url.trim().is_empty() {
            return Err(LinkError::Config("broker_url must not be empty".into()));
        }
        if self.max_connection_cooldown < 1 {
            return Err(LinkError::Config(
                "max_connection_cooldown must be at least 1 second".into(),
            ));
        }
        if self.keepalive_interval < 1 {
            return Err(LinkError::Config("keepalive_interval must be at least 1 second".into()));
        }
        match self.communication_format.as_str() {
            "" | "json" | "msgpack" => Ok(()),
            other => Err(LinkError::Config(format!(
                "unknown communication_format {other:?} (expected json or msgpack)"
            ))),
        }
    }

    /// Apply command-line overrides.  `None` leaves the field alone.
    pub fn apply_overrides(&mut self, broker: Option<String>, log_level: Option<String>) {
        if let Some(broker) = broker {
            self.broker_url = broker;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
    }

    pub fn backoff(&self) -> ConnectBackoff {
        ConnectBackoff {
            attempt_limit: self.connection_attempt_limit,
            max_cooldown: Duration::from_secs(self.max_connection_cooldown),
            ..ConnectBackoff::default()
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    /// Explicitly configured payload format, if any.
    pub fn format_override(&self) -> Option<&str> {
        Some(self.communication_format.as_str()).filter(|f| !f.is_empty())
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_name() -> String {
    "dslink".into()
}

fn d_true() -> bool {
    true
}

fn d_broker_url() -> String {
    "http://localhost:8080/conn".into()
}

fn d_keys_path() -> PathBuf {
    PathBuf::from(".keys")
}

fn d_nodes_path() -> PathBuf {
    PathBuf::from("nodes.json")
}

fn d_log_level() -> String {
    "info".into()
}

fn d_attempt_limit() -> i32 {
    -1
}

fn d_cooldown() -> u64 {
    60
}

fn d_keepalive() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = LinkConfig::from_toml_str("").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert!(config.backoff().is_unlimited());
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert!(config.format_override().is_none());
    }

    #[test]
    fn toml_fields_are_read() {
        let config = LinkConfig::from_toml_str(
            r#"
            name = "rng"
            broker_url = "http://broker:9000/conn"
            communication_format = "json"
            connection_attempt_limit = 3
            max_connection_cooldown = 2
            load_nodes_json = true

            [link_data]
            site = "lab"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "rng");
        assert_eq!(config.format_override(), Some("json"));
        assert!(config.load_nodes_json);
        let backoff = config.backoff();
        assert_eq!(backoff.attempt_limit, 3);
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(config.link_data.unwrap()["site"], "lab");
    }

    #[test]
    fn zero_cooldown_is_rejected() {
        let err = LinkConfig::from_toml_str("max_connection_cooldown = 0").unwrap_err();
        assert!(matches!(err, LinkError::Config(m) if m.contains("max_connection_cooldown")));
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(LinkConfig::from_toml_str(r#"communication_format = "xml""#).is_err());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut config = LinkConfig::default();
        config.apply_overrides(Some("http://other/conn".into()), None);
        assert_eq!(config.broker_url, "http://other/conn");
        assert_eq!(config.log_level, "info");
        config.apply_overrides(None, Some("debug".into()));
        assert_eq!(config.log_level, "debug");
    }
}
