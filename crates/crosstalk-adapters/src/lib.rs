//! Crosstalk adapter implementations: NATS JetStream broker, Postgres +
//! pgvector store, and the stub/remote embedding backends. Wires the ports
//! defined in `crosstalk-ports` to real infrastructure.

pub mod bootstrap;
pub mod config;
pub mod embed;
pub mod nats;
pub mod postgres;

pub use config::{ClusterConfig, EmbedConfig, EmbedProvider, NatsConfig, PgConfig};
pub use embed::{RemoteEmbedder, StubEmbedder};
pub use nats::CrosstalkBroker;
pub use postgres::PostgresVectorStore;
