//! Broker configuration, one TOML document covering the IPC front-end, the
//! authorization client and logging.

use serde_derive::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Path of the local stream socket the broker listens on.
    pub ipc_socket: String,

    #[serde(default = "defaults::backlog")]
    pub ipc_backlog: u32,
    /// Per-session socket read buffer capacity.
    #[serde(default = "defaults::buffersize")]
    pub ipc_buffersize: u32,
    /// Allocation granularity of the read-region allocator.
    #[serde(default = "defaults::minallocbuf")]
    pub ipc_minallocbuf: u32,
    /// Slice size requested for each READ chunk.
    #[serde(default = "defaults::newallocsize")]
    pub ipc_newallocsize: u32,
    #[serde(default = "defaults::readsmsize")]
    pub ipc_readsmsize: u32,
    #[serde(default = "defaults::writesmsize")]
    pub ipc_writesmsize: u32,

    pub auth_server_ip: String,
    pub auth_server_port: u16,
    /// Per-request ceiling in milliseconds; 0 disables the timeout.
    #[serde(default)]
    pub auth_timeout_ms: u64,
    /// Maximum open authz transactions; 0 leaves the window unbounded.
    #[serde(default)]
    pub auth_window_cap: u32,

    /// Worker pool size; 0 derives it from the core count.
    #[serde(default)]
    pub pool_size: u32,

    #[serde(default)]
    pub info_log_file: Option<String>,
    #[serde(default)]
    pub warning_log_file: Option<String>,
    #[serde(default)]
    pub error_log_file: Option<String>,
    #[serde(default)]
    pub fatal_log_file: Option<String>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

mod defaults {
    pub fn backlog() -> u32 {
        16
    }

    pub fn buffersize() -> u32 {
        64 * 1024
    }

    pub fn minallocbuf() -> u32 {
        4 * 1024
    }

    pub fn newallocsize() -> u32 {
        64 * 1024 - 1
    }

    pub fn readsmsize() -> u32 {
        16 * 1024 * 1024
    }

    pub fn writesmsize() -> u32 {
        16 * 1024 * 1024
    }

    pub fn log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<BrokerConfig, ConfigError> {
        serdeconv::from_toml_file(path).map_err(|err| ConfigError(err.to_string()))
    }

    pub fn from_toml_str(raw: &str) -> Result<BrokerConfig, ConfigError> {
        serdeconv::from_toml_str(raw).map_err(|err| ConfigError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
ipc_socket = "/tmp/broker.sock"
auth_server_ip = "127.0.0.1"
auth_server_port = 9090
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = BrokerConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.ipc_socket, "/tmp/broker.sock");
        assert_eq!(config.ipc_backlog, 16);
        assert_eq!(config.ipc_readsmsize, 16 * 1024 * 1024);
        assert_eq!(config.auth_timeout_ms, 0);
        assert_eq!(config.pool_size, 0);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_override_values() {
        let raw = format!(
            "{}\nipc_readsmsize = 1024\npool_size = 2\nlog_level = \"debug\"\n",
            MINIMAL
        );
        let config = BrokerConfig::from_toml_str(&raw).unwrap();

        assert_eq!(config.ipc_readsmsize, 1024);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_socket_is_error() {
        let raw = "auth_server_ip = \"127.0.0.1\"\nauth_server_port = 9090\n";

        assert!(BrokerConfig::from_toml_str(raw).is_err());
    }
}
