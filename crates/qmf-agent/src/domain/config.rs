//! Agent configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::value_objects::AgentName;

/// How to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// SASL mechanism, empty for the client default.
    pub mechanism: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            protocol: "tcp".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            username: String::new(),
            password: String::new(),
            mechanism: String::new(),
        }
    }
}

/// Everything `init` needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub connection: ConnectionSettings,
    /// Seconds between publication passes (and the advertised heartbeat
    /// interval).
    pub interval_secs: u16,
    /// Queue method requests for a host thread instead of invoking them
    /// on the connection thread.
    pub external_thread: bool,
    /// Identity store location; `None` keeps identity in memory only.
    pub store_file: Option<PathBuf>,
    /// Vendor/product/instance identity; defaults generate an instance
    /// UUID.
    pub name: AgentName,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            connection: ConnectionSettings::default(),
            interval_secs: 10,
            external_thread: false,
            store_file: None,
            name: AgentName::default(),
        }
    }
}

impl AgentConfig {
    /// A config suitable for tests: tight interval, no store file.
    pub fn for_testing() -> Self {
        AgentConfig {
            interval_secs: 1,
            name: AgentName::new("test-vendor", "test-product", "test-instance"),
            ..AgentConfig::default()
        }
    }
}
