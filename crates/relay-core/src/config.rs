use std::{fs, net::Ipv4Addr, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default from §7's resource cap: reject new clients past this many
/// concurrently open connections rather than letting memory grow
/// unbounded.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 128;

/// Default read-ahead size requested from the kernel on each readable
/// event, per connection, before shrinking the reservation back to the
/// number of bytes actually received.
pub const DEFAULT_READ_AHEAD_BYTES: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Plain,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub address: String,
    pub service: u16,
    pub is_tnt: bool,
    pub transport: TransportKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    pub max_connections: Option<u32>,
    pub read_ahead_bytes: Option<u32>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid listen address {0:?}: expected an IPv4 dotted-quad")]
    InvalidListenAddr(String),
    #[error("upstream {index} uses an unsupported transport (only \"plain\" is implemented)")]
    UnsupportedTransport { index: usize },
    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidListenAddr(self.listen_addr.clone()))?;
        for (index, upstream) in self.upstreams.iter().enumerate() {
            if upstream.transport != TransportKind::Plain {
                return Err(ConfigError::UnsupportedTransport { index });
            }
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::ZeroMaxConnections);
        }
        Ok(())
    }

    #[inline]
    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    #[inline]
    pub fn read_ahead_bytes(&self) -> u32 {
        self.read_ahead_bytes.unwrap_or(DEFAULT_READ_AHEAD_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_and_validates_a_well_formed_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_addr": "0.0.0.0",
                "listen_port": 3301,
                "upstreams": [
                    {{ "address": "10.0.0.1", "service": 3301, "is_tnt": true, "transport": "plain" }}
                ]
            }}"#
        )
        .unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_port, 3301);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.read_ahead_bytes(), DEFAULT_READ_AHEAD_BYTES);
    }

    #[test]
    fn rejects_non_ipv4_listen_addr() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen_addr": "not-an-ip", "listen_port": 3301, "upstreams": []}}"#).unwrap();
        assert!(matches!(RelayConfig::load(file.path()), Err(ConfigError::InvalidListenAddr(_))));
    }

    #[test]
    fn rejects_tls_transport_until_implemented() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_addr": "0.0.0.0",
                "listen_port": 3301,
                "upstreams": [
                    {{ "address": "10.0.0.1", "service": 3301, "is_tnt": true, "transport": "tls" }}
                ]
            }}"#
        )
        .unwrap();
        assert!(matches!(
            RelayConfig::load(file.path()),
            Err(ConfigError::UnsupportedTransport { index: 0 })
        ));
    }
}
