//! Validated listen/dial address.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Address used when validation fails or no address is given.
pub const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;
/// Port used when validation fails or no port is given.
pub const DEFAULT_PORT: u16 = 8888;

/// Why an address/port pair was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The address is not an IPv4 dotted quad.
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
    /// The port is outside `0..=65535`.
    #[error("port {0} is outside 0..=65535")]
    InvalidPort(i64),
}

/// Immutable IPv4 address and port of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointConfig {
    address: Ipv4Addr,
    port: u16,
}

impl EndpointConfig {
    /// Validate `address` (IPv4 dotted quad) and `port` (`0..=65535`).
    pub fn try_new(address: &str, port: i64) -> Result<Self, ValidationError> {
        let address = address
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ValidationError::InvalidAddress(address.to_string()))?;
        let port = u16::try_from(port).map_err(|_| ValidationError::InvalidPort(port))?;
        Ok(Self { address, port })
    }

    /// Validate the pair, substituting `127.0.0.1:8888` when either half is
    /// invalid. The rejection is logged, never returned.
    pub fn or_default(address: &str, port: i64) -> Self {
        match Self::try_new(address, port) {
            Ok(config) => config,
            Err(err) => {
                let fallback = Self::default();
                tracing::warn!("{err}; falling back to {fallback}");
                fallback
            }
        }
    }

    /// The IPv4 address.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The pair as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
