//! Embedder worker configuration. All values can be set via environment
//! variables; see SPEC_FULL §6 for the full variable list.

use std::env;
use std::time::Duration;

use crosstalk_adapters::{EmbedConfig, NatsConfig, PgConfig};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub nats: NatsConfig,
    pub embed: EmbedConfig,
    pub pg: PgConfig,
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
            embed: EmbedConfig::from_env(),
            pg: PgConfig::from_env(),
            fetch_batch_size: env::var("EMBEDDER_FETCH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            fetch_expires: Duration::from_secs(
                env::var("EMBEDDER_FETCH_EXPIRES_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            health_port: env::var("EMBEDDER_HEALTH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8081),
            log_level: env::var("API_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: "crosstalk-embedder",
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
    fn default_fetch_batch_size_matches_spec_guidance() {
        let config = WorkerConfig::default();
        assert_eq!(config.fetch_batch_size, 10);
    }
}
