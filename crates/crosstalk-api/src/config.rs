//! API configuration: bind address plus the broker/store configs the
//! ingress and connections handlers need.

use std::env;

use crosstalk_adapters::{NatsConfig, PgConfig};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub nats: NatsConfig,
    pub pg: PgConfig,
}

impl ApiConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("API_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            log_level: env::var("API_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            nats: NatsConfig::from_env(),
            pg: PgConfig::from_env(),
        }
    }

    #[must_use]
    pub fn local_dev() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "debug".to_string(),
            nats: NatsConfig::local_dev(),
            pg: PgConfig::local_dev(),
        }
    }

    #[must_use]
    pub fn test() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_level: "debug".to_string(),
            nats: NatsConfig::local_dev(),
            pg: PgConfig::local_dev(),
        }
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
