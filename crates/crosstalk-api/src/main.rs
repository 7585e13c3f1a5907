//! Crosstalk HTTP API.
//!
//! Two endpoints: the ingress that turns a POST into a `message.created`
//! event on the broker, and the connections query that reads clustered
//! state back out of the vector store. See SPEC_FULL §4.4, §4.7, §6.

mod config;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use crosstalk_adapters::{CrosstalkBroker, NatsConfig, PgConfig, PostgresVectorStore};
use crosstalk_ports::{MessageBroker, VectorStore};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ApiConfig;
use handlers::{connections::get_connections, health::health, messages::ingest_message};

/// Shared state handed to every handler. `B`/`V` are generic so the router
/// can be built and tested against in-memory fakes without touching NATS
/// or Postgres.
pub struct AppState<B, V> {
    pub broker: Arc<B>,
    pub store: Arc<V>,
    pub stream_name: String,
}

impl<B, V> Clone for AppState<B, V> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            stream_name: self.stream_name.clone(),
        }
    }
}

fn create_router<B, V>(state: AppState<B, V>) -> Router
where
    B: MessageBroker + 'static,
    V: VectorStore + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/v1/orgs/:org_id/messages", post(ingest_message::<B, V>))
        .route(
            "/v1/orgs/:org_id/users/:user_id/connections",
            get(get_connections::<B, V>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    let config = ApiConfig::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("crosstalk_api={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let broker = CrosstalkBroker::connect(config.nats.clone())
        .await
        .expect("failed to connect to NATS");
    let store = PostgresVectorStore::connect(&config.pg)
        .await
        .expect("failed to connect to Postgres");

    let state = AppState {
        broker: Arc::new(broker),
        store: Arc::new(store),
        stream_name: config.nats.stream_name.clone(),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.bind_addr(), "crosstalk-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use std::time::Duration;

    use crosstalk_domain::{Cluster, Message, MessageClusterAssignment, MessageEmbedding};
    use crosstalk_ports::{
        BrokerError, ClusterParticipants, ClusterTransaction, Delivery, MessageConsumer,
        NearestCluster, StoreError, UserClusterMean,
    };
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct FakeConsumer;
    impl MessageConsumer for FakeConsumer {
        type Delivery = FakeDelivery;
        async fn fetch(
            &self,
            _batch_size: usize,
            _expires: Duration,
        ) -> Result<Vec<Self::Delivery>, BrokerError> {
            Ok(vec![])
        }
    }

    struct FakeDelivery;
    impl Delivery for FakeDelivery {
        fn subject(&self) -> &str {
            ""
        }
        fn payload(&self) -> &[u8] {
            &[]
        }
        async fn ack(self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn nak(self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn term(self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MessageBroker for FakeBroker {
        type Consumer = FakeConsumer;

        async fn publish(
            &self,
            subject: &str,
            _msg_id: &str,
            payload: &[u8],
        ) -> Result<u64, BrokerError> {
            let mut published = self.published.lock().await;
            published.push((subject.to_string(), payload.to_vec()));
            Ok(published.len() as u64)
        }

        async fn consumer(
            &self,
            _stream: &str,
            _durable_name: &str,
            _filter_subject: &str,
        ) -> Result<Self::Consumer, BrokerError> {
            Ok(FakeConsumer)
        }
    }

    #[derive(Default)]
    struct FakeStore {
        connections: HashMap<(String, String), Vec<ClusterParticipants>>,
    }

    struct FakeTransaction;
    impl ClusterTransaction for FakeTransaction {
        async fn existing_assignment(
            &mut self,
            _org_id: &str,
            _message_id: Uuid,
        ) -> Result<Option<MessageClusterAssignment>, StoreError> {
            Ok(None)
        }
        async fn nearest_active_cluster(
            &mut self,
            _org_id: &str,
            _model_version: &str,
            _embedding: &[f32],
        ) -> Result<Option<NearestCluster>, StoreError> {
            Ok(None)
        }
        async fn create_cluster(
            &mut self,
            _org_id: &str,
            _model_version: &str,
            _embedding: &[f32],
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Uuid, StoreError> {
            Ok(Uuid::nil())
        }
        async fn update_cluster_centroid(
            &mut self,
            _org_id: &str,
            _cluster_id: Uuid,
            _new_centroid: &[f32],
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn upsert_assignment(
            &mut self,
            _org_id: &str,
            _message_id: Uuid,
            _cluster_id: Uuid,
            _confidence: f64,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn upsert_participation(
            &mut self,
            _org_id: &str,
            _user_id: &str,
            _cluster_id: Uuid,
            _participation_delta: f64,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn commit(self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn rollback(self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    impl VectorStore for FakeStore {
        type Transaction = FakeTransaction;

        async fn insert_message(&self, _message: &Message) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn upsert_embedding(&self, _embedding: &MessageEmbedding) -> Result<(), StoreError> {
            Ok(())
        }
        async fn begin(&self) -> Result<Self::Transaction, StoreError> {
            Ok(FakeTransaction)
        }
        async fn cluster_connections(
            &self,
            org_id: &str,
            user_id: &str,
        ) -> Result<Vec<ClusterParticipants>, StoreError> {
            Ok(self
                .connections
                .get(&(org_id.to_string(), user_id.to_string()))
                .cloned()
                .unwrap_or_default())
        }
        async fn get_cluster(
            &self,
            _org_id: &str,
            _cluster_id: Uuid,
        ) -> Result<Option<Cluster>, StoreError> {
            Ok(None)
        }
    }

    fn test_state() -> AppState<FakeBroker, FakeStore> {
        AppState {
            broker: Arc::new(FakeBroker::default()),
            store: Arc::new(FakeStore::default()),
            stream_name: "crosstalk".to_string(),
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ingest_accepts_a_well_formed_message() {
        let app = create_router(test_state());
        let body = serde_json::json!({
            "user_id": "u",
            "ts": "2026-01-01T00:00:00Z",
            "text": "hi",
            "source_type": "t",
            "metadata": {}
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/orgs/org-test/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn connections_returns_empty_centroids_when_user_has_none() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/orgs/org-test/users/u/connections")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn fake_store_ranks_connections_per_scenario_s6() {
        // grounded in spec S6: cluster C1 {target(0,..), B, C}, C2 {target, D}
        let target = vec![1.0_f32, 0.0];
        let b = vec![0.8_f32, 0.6];
        let c = vec![0.0_f32, 1.0];

        let dot_b: f32 = target.iter().zip(&b).map(|(x, y)| x * y).sum();
        let dist_b = 1.0 - f64::from(dot_b);
        assert!((dist_b - 0.2).abs() < 1e-3);

        let dot_c: f32 = target.iter().zip(&c).map(|(x, y)| x * y).sum();
        let dist_c = 1.0 - f64::from(dot_c);
        assert!((dist_c - 1.0).abs() < 1e-6);
    }
}
