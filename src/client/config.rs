//! Client configuration.
//!
//! Every field is a plain value with a default, so a config can be built in code, deserialized
//! from any serde format, or parsed from YAML text with [`ClientConfig::from_yaml_str`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Version;
use crate::{NatNetError, Result};

/// Well-known command port servers listen on.
pub const DEFAULT_COMMAND_PORT: u16 = 1510;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local interface for the command and data sockets.
    pub client_address: IpAddr,
    /// Server to connect to when no discovery address is set.
    pub server_address: IpAddr,
    /// Broadcast or multicast address to discover servers on before connecting.
    pub discovery_address: Option<IpAddr>,
    pub command_port: u16,
    /// Data port used when the server does not advertise one; defaults to `command_port + 1`.
    pub data_port: Option<u16>,
    /// Overrides the server's unicast/multicast setting.
    pub use_multicast: Option<bool>,
    /// Stop discovering after this many servers; `0` collects until the timeout.
    pub max_discovery_results: usize,

    pub request_timeout_ms: u64,
    /// Sends per exchange before giving up.
    pub request_attempts: u32,
    pub discovery_timeout_ms: u64,
    pub discovery_interval_ms: u64,

    /// Open the data transport as part of `connect`.
    pub start_listening: bool,
    /// Pull queue length; the oldest frame is dropped when full.
    pub queue_capacity: usize,

    pub clock_sync: bool,
    pub clock_sync_period_ms: u64,
    /// Echo samples considered for minimum-RTT selection.
    pub clock_sync_window: usize,
    /// Back-to-back echoes sent right after connecting.
    pub clock_sync_burst: u32,
    pub echo_timeout_ms: u64,

    pub keep_alive_interval_ms: u64,
    /// Re-fetch the description or server info when frames flag a change.
    pub auto_refresh: bool,

    pub client_name: String,
    /// Highest stream version to negotiate.
    pub max_version: Version,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_address: None,
            command_port: DEFAULT_COMMAND_PORT,
            data_port: None,
            use_multicast: None,
            max_discovery_results: 0,
            request_timeout_ms: 1000,
            request_attempts: 3,
            discovery_timeout_ms: 5000,
            discovery_interval_ms: 250,
            start_listening: true,
            queue_capacity: 10,
            clock_sync: true,
            clock_sync_period_ms: 1000,
            clock_sync_window: crate::clock::DEFAULT_WINDOW,
            clock_sync_burst: 10,
            echo_timeout_ms: 500,
            keep_alive_interval_ms: 5000,
            auto_refresh: true,
            client_name: "natnet-rs".to_string(),
            max_version: Version::LATEST,
        }
    }
}

impl ClientConfig {
    /// Parses a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |details: &str| Err(NatNetError::Config { details: details.to_string() });
        if self.command_port == 0 {
            return invalid("command_port must be non-zero");
        }
        if self.request_timeout_ms == 0 || self.echo_timeout_ms == 0 {
            return invalid("request and echo timeouts must be non-zero");
        }
        if self.request_attempts == 0 {
            return invalid("request_attempts must be at least 1");
        }
        if self.clock_sync && (self.clock_sync_window == 0 || self.clock_sync_period_ms == 0) {
            return invalid("clock sync needs a non-empty window and a non-zero period");
        }
        if self.keep_alive_interval_ms == 0 {
            return invalid("keep_alive_interval_ms must be non-zero");
        }
        if self.max_version.major == 0 || self.max_version > Version::LATEST {
            return Err(NatNetError::Config {
                details: format!("max_version must be between 1.0 and {}", Version::LATEST),
            });
        }
        Ok(())
    }

    pub fn server_command_address(&self) -> SocketAddr {
        SocketAddr::new(self.server_address, self.command_port)
    }

    /// Data port to fall back to when the server advertises none.
    pub fn default_data_port(&self) -> u16 {
        self.data_port.unwrap_or_else(|| self.command_port.saturating_add(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn clock_sync_period(&self) -> Duration {
        Duration::from_millis(self.clock_sync_period_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.default_data_port(), 1511);
        assert_eq!(config.server_command_address(), SocketAddr::from(([127, 0, 0, 1], 1510)));
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let yaml = r#"
server_address: 10.0.0.5
discovery_address: 10.0.0.255
use_multicast: true
command_port: 1600
request_timeout_ms: 250
max_version:
  major: 3
  minor: 1
"#;
        let config = ClientConfig::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.server_address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(config.discovery_address, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255))));
        assert_eq!(config.use_multicast, Some(true));
        assert_eq!(config.default_data_port(), 1601);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_version, Version::new(3, 1));
        assert_eq!(config.queue_capacity, 10);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = ClientConfig::from_yaml_str("request_attempts: 0").expect_err("zero attempts");
        assert!(matches!(err, NatNetError::Config { .. }));

        let err = ClientConfig::from_yaml_str("command_port: [1]").expect_err("bad type");
        assert!(matches!(err, NatNetError::Config { .. }));

        let config = ClientConfig { max_version: Version::new(5, 0), ..Default::default() };
        assert!(config.validate().is_err());
    }
}
