//! Clusterer worker configuration.

use std::env;
use std::time::Duration;

use crosstalk_adapters::{ClusterConfig, NatsConfig, PgConfig};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub nats: NatsConfig,
    pub pg: PgConfig,
    pub cluster: ClusterConfig,
    pub fetch_batch_size: usize,
    pub fetch_expires: Duration,
    pub health_port: u16,
    pub log_level: String,
    pub service_name: &'static str,
}

impl WorkerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            nats: NatsConfig::from_env(),
            pg: PgConfig::from_env(),
            cluster: ClusterConfig::from_env(),
            fetch_batch_size: env::var("CLUSTERER_FETCH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            fetch_expires: Duration::from_secs(
                env::var("CLUSTERER_FETCH_EXPIRES_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            health_port: env::var("CLUSTERER_HEALTH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8082),
            log_level: env::var("API_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: "crosstalk-clusterer",
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_health_port_does_not_collide_with_embedder() {
        let config = WorkerConfig::default();
        assert_eq!(config.health_port, 8082);
    }
}
