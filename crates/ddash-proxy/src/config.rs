//! Proxy configuration types.

use crate::prompt::DEFAULT_CONTROL_PATH;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    #[serde(default)]
    pub bind_port: u16,

    /// Display name of the sandboxed command, shown in prompts.
    #[serde(default = "default_command_name")]
    pub command_name: String,

    /// Pre-seeded domain -> decision tokens (`allow`, `deny`, `always`, `never`).
    /// Unrecognized tokens deny.
    #[serde(default)]
    pub domains: HashMap<String, String>,

    /// Timeout for dialing a destination, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Control channel device for interactive prompts.
    #[serde(default = "default_control_path")]
    pub control_path: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 0,
            command_name: default_command_name(),
            domains: HashMap::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_connections: default_max_connections(),
            control_path: default_control_path(),
        }
    }
}

impl ProxyConfig {
    /// Upstream dial timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_command_name() -> String {
    "command".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_control_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_PATH)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_eq!(config.bind_port, 0);
        assert!(config.domains.is_empty());
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.control_path, PathBuf::from("/dev/tty"));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"command_name": "npm install", "domains": {"registry.npmjs.org": "always"}}"#,
        )
        .unwrap();
        assert_eq!(config.command_name, "npm install");
        assert_eq!(config.domains["registry.npmjs.org"], "always");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.bind_port, 0);
    }
}
