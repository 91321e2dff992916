//! Connection configuration

use std::path::Path;
use std::time::Duration;

use loco_protocol::Protocol;
use serde::{Deserialize, Serialize};

use crate::error::ThrottleError;
use crate::paths::PathResolver;

/// What happens when an exclusive address is requested while held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait in FIFO order until the holder releases
    #[default]
    Queue,
    /// Dispossess the current holder and grant immediately
    Steal,
}

/// Physical link to the command station
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Serial port
    Serial {
        /// Serial port path
        port: String,
        /// Baud rate
        #[serde(default = "default_baud")]
        baud_rate: u32,
    },
    /// TCP socket (network command stations, LocoNet-over-TCP bridges)
    Tcp {
        /// Host name or IP
        host: String,
        /// TCP port
        port: u16,
    },
    /// In-memory stream supplied by the embedder
    #[default]
    Virtual,
}

fn default_baud() -> u32 {
    115200
}

/// Configuration for one command-station connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Display name
    pub name: String,
    /// Protocol family spoken on the link
    pub protocol: Protocol,
    /// How to reach the command station
    pub transport: TransportConfig,
    /// Retransmissions after the first write
    pub max_retries: u32,
    /// Time to wait for a matching reply, in milliseconds
    pub request_timeout_ms: u64,
    /// Time after an unanswered release before the address is freed anyway
    pub release_grace_ms: u64,
    /// Exclusive contention policy
    pub contention: ContentionPolicy,
    /// Addresses that may be shared; `None` allows every address
    pub shared_addresses: Option<Vec<u16>>,
    /// Requests allowed in flight at once
    pub window_size: usize,
    /// Capacity of the connection task's command channel
    pub command_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "Command Station".to_string(),
            protocol: Protocol::DccEx,
            transport: TransportConfig::default(),
            max_retries: 2,
            request_timeout_ms: 500,
            release_grace_ms: 1000,
            contention: ContentionPolicy::Queue,
            shared_addresses: None,
            window_size: 1,
            command_queue: 64,
        }
    }
}

impl ConnectionConfig {
    /// Default configuration for a protocol
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            name: protocol.name().to_string(),
            protocol,
            ..Default::default()
        }
    }

    /// Reply timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Release grace period
    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    /// Whether shared control is configured for `number`
    pub fn allows_sharing(&self, number: u16) -> bool {
        self.shared_addresses
            .as_ref()
            .map_or(true, |list| list.contains(&number))
    }

    /// Reject values the connection task cannot run with
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.window_size == 0 {
            return Err(ThrottleError::InvalidValue(
                "window_size must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ThrottleError::InvalidValue(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.command_queue == 0 {
            return Err(ThrottleError::InvalidValue(
                "command_queue must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ThrottleError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ThrottleError::InvalidValue(format!("connection config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ThrottleError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ThrottleError::InvalidValue(format!("connection config: {}", e)))
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, ThrottleError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Load from a portable path such as `preference:connections/main.json`
    pub fn load_portable(resolver: &PathResolver, portable: &str) -> Result<Self, ThrottleError> {
        Self::load(&resolver.resolve(portable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = ConnectionConfig::from_json_str(
            r#"{ "protocol": "LocoNet", "contention": "steal", "max_retries": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.protocol, Protocol::LocoNet);
        assert_eq!(config.contention, ContentionPolicy::Steal);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.window_size, 1);
        assert_eq!(config.transport, TransportConfig::Virtual);
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_transport_variants() {
        let config = ConnectionConfig::from_json_str(
            r#"{ "transport": { "type": "serial", "port": "/dev/ttyACM0" } }"#,
        )
        .unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Serial {
                port: "/dev/ttyACM0".into(),
                baud_rate: 115200
            }
        );

        let config = ConnectionConfig::from_json_str(
            r#"{ "transport": { "type": "tcp", "host": "10.0.0.5", "port": 1234 } }"#,
        )
        .unwrap();
        assert!(matches!(config.transport, TransportConfig::Tcp { port: 1234, .. }));
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = ConnectionConfig::for_protocol(Protocol::LocoNet);
        config.shared_addresses = Some(vec![3, 7]);
        let json = config.to_json().unwrap();
        assert_eq!(ConnectionConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        assert!(ConnectionConfig::from_json_str(r#"{ "window_size": 0 }"#).is_err());
        assert!(ConnectionConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_shared_allow_list() {
        let mut config = ConnectionConfig::default();
        assert!(config.allows_sharing(9));
        config.shared_addresses = Some(vec![7]);
        assert!(config.allows_sharing(7));
        assert!(!config.allows_sharing(9));
    }
}
