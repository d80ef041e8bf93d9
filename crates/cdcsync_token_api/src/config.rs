//! Endpoint configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the local token endpoint.
#[derive(Debug, Clone)]
pub struct TokenApiConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Upper bound on the `block` parameter.
    pub max_block: Duration,
}

impl TokenApiConfig {
    /// Creates a configuration bound to `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_block: Duration::from_secs(300),
        }
    }

    /// Sets the longest a request may wait for a new token.
    pub fn with_max_block(mut self, max_block: Duration) -> Self {
        self.max_block = max_block;
        self
    }
}

impl Default for TokenApiConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 9090)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TokenApiConfig::default();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.max_block, Duration::from_secs(300));
    }

    #[test]
    fn config_builder() {
        let config = TokenApiConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_block(Duration::from_secs(5));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_block, Duration::from_secs(5));
    }
}
