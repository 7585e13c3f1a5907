//! Crosstalk clusterer worker — the hard core (SPEC_FULL §4.6).
//!
//! Consumes `embeddings.>` on durable `clusterer_v1`. Each delivery runs an
//! idempotency check, then either assigns the message to the nearest active
//! cluster or creates a new one, inside a single DB transaction; the
//! transaction commits before the `message.clustered` event is published.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use chrono::Utc;
use crosstalk_adapters::{ClusterConfig, CrosstalkBroker, PostgresVectorStore};
use crosstalk_domain::{clamp_confidence, l2_normalize, parse_message_embedded, to_json_bytes, MessageClusteredEvent, MessageEmbeddedEvent};
use crosstalk_ports::{BrokerError, ClusterTransaction, Delivery, MessageBroker, MessageConsumer, StoreError, VectorStore};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use config::WorkerConfig;

struct WorkerState {
    config: WorkerConfig,
    running: AtomicBool,
    last_poll: RwLock<Option<chrono::DateTime<Utc>>>,
    clustered_count: AtomicU64,
}

impl WorkerState {
    fn is_ready(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn ready_handler(state: Arc<WorkerState>) -> Json<serde_json::Value> {
    let last_poll = *state.last_poll.read().await;
    Json(json!({
        "status": if state.is_ready() { "ready" } else { "not_ready" },
        "service": state.config.service_name,
        "last_poll": last_poll.map(|t| t.to_rfc3339()),
        "clustered_count": state.clustered_count.load(Ordering::Relaxed),
    }))
}

#[tokio::main]
async fn main() {
    let config = WorkerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(service = %config.service_name, "starting crosstalk-clusterer");

    let broker = Arc::new(
        CrosstalkBroker::connect(config.nats.clone())
            .await
            .expect("failed to connect to NATS"),
    );
    let store = Arc::new(
        PostgresVectorStore::connect(&config.pg)
            .await
            .expect("failed to connect to Postgres"),
    );

    let consumer = broker
        .consumer(
            &config.nats.stream_name,
            crosstalk_adapters::nats::durables::CLUSTERER,
            "embeddings.>",
        )
        .await
        .expect("failed to bind clusterer_v1 consumer");

    let state = Arc::new(WorkerState {
        config: config.clone(),
        running: AtomicBool::new(true),
        last_poll: RwLock::new(None),
        clustered_count: AtomicU64::new(0),
    });

    let health_state = state.clone();
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_app = Router::new()
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .route("/health", get(health_handler));

    let health_server = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(health_addr)
            .await
            .expect("failed to bind health listener");
        info!(addr = %health_addr, "health server listening");
        if let Err(e) = axum::serve(listener, health_app).await {
            error!(error = %e, "health server error");
        }
    });

    let worker_state = state.clone();
    let cluster_config = config.cluster;
    let worker_loop = tokio::spawn(async move {
        run_loop(worker_state, broker.as_ref(), &consumer, store.as_ref(), cluster_config).await;
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight batch");
    state.running.store(false, Ordering::Relaxed);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), worker_loop).await;
    health_server.abort();
    info!("crosstalk-clusterer shutdown complete");
}

async fn run_loop<B, V>(
    state: Arc<WorkerState>,
    broker: &B,
    consumer: &B::Consumer,
    store: &V,
    cluster_config: ClusterConfig,
) where
    B: MessageBroker,
    V: VectorStore,
{
    while state.running.load(Ordering::Relaxed) {
        {
            let mut last_poll = state.last_poll.write().await;
            *last_poll = Some(Utc::now());
        }

        let deliveries = match consumer
            .fetch(state.config.fetch_batch_size, state.config.fetch_expires)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "fetch failed, retrying next cycle");
                continue;
            }
        };

        for delivery in deliveries {
            match cluster_one(broker, store, cluster_config, delivery.payload()).await {
                Ok(Verdict::Ack) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "ack failed");
                    } else {
                        state.clustered_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(Verdict::Drop) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "ack-to-drop failed for malformed event");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "clusterer processing error, will redeliver");
                    if let Err(e) = delivery.nak().await {
                        warn!(error = %e, "nak failed");
                    }
                }
            }
        }
    }
}

enum Verdict {
    Ack,
    Drop,
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs one `message.embedded` delivery through steps A-D of SPEC_FULL §4.6.
async fn cluster_one<B, V>(
    broker: &B,
    store: &V,
    cluster_config: ClusterConfig,
    payload: &[u8],
) -> Result<Verdict, ProcessError>
where
    B: MessageBroker,
    V: VectorStore,
{
    let event = match parse_message_embedded(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed message.embedded event, dropping");
            return Ok(Verdict::Drop);
        }
    };

    let mut tx = store.begin().await?;

    // Step A: idempotency short-circuit.
    if let Some(existing) = tx
        .existing_assignment(&event.org_id, event.message.message_id)
        .await?
    {
        tx.commit().await?;
        publish_clustered(broker, &event, existing.cluster_id, existing.confidence).await?;
        return Ok(Verdict::Ack);
    }

    // Step B: nearest active cluster, against the L2-normalized embedding.
    let mut embedding = event.embedding.clone();
    l2_normalize(&mut embedding);
    let nearest = tx
        .nearest_active_cluster(&event.org_id, &event.model_version, &embedding)
        .await?;

    // Step C: assign-vs-create decision.
    let (cluster_id, confidence) = match nearest {
        Some(n) if n.distance <= cluster_config.assign_dist_threshold() => {
            let confidence = clamp_confidence(1.0 - n.distance);
            let n_eff = n.effective_count.min(cluster_config.count_cap) as f32;
            let mut new_centroid: Vec<f32> = n
                .centroid
                .iter()
                .zip(&embedding)
                .map(|(c, e)| (c * n_eff + e) / (n_eff + 1.0))
                .collect();
            l2_normalize(&mut new_centroid);
            tx.update_cluster_centroid(&event.org_id, n.cluster_id, &new_centroid, event.created_at)
                .await?;
            (n.cluster_id, confidence)
        }
        _ => {
            let cluster_id = tx
                .create_cluster(&event.org_id, &event.model_version, &embedding, event.created_at)
                .await?;
            (cluster_id, 1.0)
        }
    };

    tx.upsert_assignment(
        &event.org_id,
        event.message.message_id,
        cluster_id,
        confidence,
        event.created_at,
    )
    .await?;
    tx.upsert_participation(
        &event.org_id,
        &event.message.user_id,
        cluster_id,
        confidence,
        event.created_at,
    )
    .await?;

    // Step D: commit, then publish.
    tx.commit().await?;
    publish_clustered(broker, &event, cluster_id, confidence).await?;

    Ok(Verdict::Ack)
}

async fn publish_clustered<B: MessageBroker>(
    broker: &B,
    event: &MessageEmbeddedEvent,
    cluster_id: Uuid,
    confidence: f64,
) -> Result<(), BrokerError> {
    let clustered = MessageClusteredEvent::new(
        Uuid::new_v4(),
        event.org_id.clone(),
        event.message.message_id,
        event.message.user_id.clone(),
        event.message.ts,
        event.model_version.clone(),
        cluster_id,
        confidence,
        Utc::now(),
    );
    let payload = to_json_bytes(&clustered).unwrap_or_default();
    let subject = format!("clusters.{}", event.org_id);
    broker
        .publish(&subject, &clustered.event_id.to_string(), &payload)
        .await?;
    Ok(())
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosstalk_domain::{
        Cluster, Message, MessageClusterAssignment, MessageEmbedding, MessageEmbeddedEvent,
    };
    use crosstalk_ports::{ClusterParticipants, NearestCluster};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeClusterRow {
        model_version: String,
        centroid: Vec<f32>,
        effective_count: i64,
        is_active: bool,
    }

    #[derive(Default)]
    struct FakeDb {
        clusters: HashMap<Uuid, FakeClusterRow>,
        assignments: HashMap<(String, Uuid), MessageClusterAssignment>,
    }

    #[derive(Default)]
    struct FakeStore {
        db: Arc<StdMutex<FakeDb>>,
    }

    struct FakeTx {
        db: Arc<StdMutex<FakeDb>>,
    }

    impl ClusterTransaction for FakeTx {
        async fn existing_assignment(
            &mut self,
            org_id: &str,
            message_id: Uuid,
        ) -> Result<Option<MessageClusterAssignment>, StoreError> {
            let db = self.db.lock().unwrap();
            Ok(db.assignments.get(&(org_id.to_string(), message_id)).cloned())
        }

        async fn nearest_active_cluster(
            &mut self,
            _org_id: &str,
            model_version: &str,
            embedding: &[f32],
        ) -> Result<Option<NearestCluster>, StoreError> {
            let db = self.db.lock().unwrap();
            let mut best: Option<(Uuid, f64, &FakeClusterRow)> = None;
            for (id, row) in &db.clusters {
                if !row.is_active || row.model_version != model_version {
                    continue;
                }
                let dot: f32 = row.centroid.iter().zip(embedding).map(|(a, b)| a * b).sum();
                let distance = f64::from(1.0 - dot);
                let better = match &best {
                    None => true,
                    Some((best_id, best_dist, _)) => {
                        distance < *best_dist || ((distance - *best_dist).abs() < 1e-12 && id < best_id)
                    }
                };
                if better {
                    best = Some((*id, distance, row));
                }
            }
            Ok(best.map(|(id, distance, row)| NearestCluster {
                cluster_id: id,
                centroid: row.centroid.clone(),
                effective_count: row.effective_count,
                distance,
            }))
        }

        async fn create_cluster(
            &mut self,
            _org_id: &str,
            model_version: &str,
            embedding: &[f32],
            _now: chrono::DateTime<Utc>,
        ) -> Result<Uuid, StoreError> {
            let id = Uuid::new_v4();
            let mut db = self.db.lock().unwrap();
            db.clusters.insert(
                id,
                FakeClusterRow {
                    model_version: model_version.to_string(),
                    centroid: embedding.to_vec(),
                    effective_count: 1,
                    is_active: true,
                },
            );
            Ok(id)
        }

        async fn update_cluster_centroid(
            &mut self,
            _org_id: &str,
            cluster_id: Uuid,
            new_centroid: &[f32],
            _now: chrono::DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let mut db = self.db.lock().unwrap();
            if let Some(row) = db.clusters.get_mut(&cluster_id) {
                row.centroid = new_centroid.to_vec();
                row.effective_count += 1;
            }
            Ok(())
        }

        async fn upsert_assignment(
            &mut self,
            org_id: &str,
            message_id: Uuid,
            cluster_id: Uuid,
            confidence: f64,
            now: chrono::DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let mut db = self.db.lock().unwrap();
            db.assignments.entry((org_id.to_string(), message_id)).or_insert(
                MessageClusterAssignment {
                    org_id: org_id.to_string(),
                    message_id,
                    cluster_id,
                    confidence,
                    assigned_at: now,
                },
            );
            Ok(())
        }

        async fn upsert_participation(
            &mut self,
            _org_id: &str,
            _user_id: &str,
            _cluster_id: Uuid,
            _participation_delta: f64,
            _now: chrono::DateTime<Utc>,
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
        type Transaction = FakeTx;

        async fn insert_message(&self, _message: &Message) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn upsert_embedding(&self, _embedding: &MessageEmbedding) -> Result<(), StoreError> {
            Ok(())
        }
        async fn begin(&self) -> Result<Self::Transaction, StoreError> {
            Ok(FakeTx { db: self.db.clone() })
        }
        async fn cluster_connections(
            &self,
            _org_id: &str,
            _user_id: &str,
        ) -> Result<Vec<ClusterParticipants>, StoreError> {
            Ok(vec![])
        }
        async fn get_cluster(&self, _org_id: &str, _cluster_id: Uuid) -> Result<Option<Cluster>, StoreError> {
            Ok(None)
        }
    }

    struct FakeConsumer;
    impl MessageConsumer for FakeConsumer {
        type Delivery = FakeDelivery;
        async fn fetch(&self, _n: usize, _e: Duration) -> Result<Vec<Self::Delivery>, BrokerError> {
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
        published: StdMutex<Vec<(String, Vec<u8>)>>,
    }
    impl MessageBroker for FakeBroker {
        type Consumer = FakeConsumer;
        async fn publish(&self, subject: &str, _msg_id: &str, payload: &[u8]) -> Result<u64, BrokerError> {
            let mut published = self.published.lock().unwrap();
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

    fn embedded_event(org_id: &str, user_id: &str, embedding: Vec<f32>) -> MessageEmbeddedEvent {
        MessageEmbeddedEvent::new(
            Uuid::new_v4(),
            org_id.to_string(),
            crosstalk_domain::MessagePayload {
                message_id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                ts: Utc::now(),
                source_type: "chat".to_string(),
                text: "hi".to_string(),
                metadata: serde_json::json!({}),
            },
            "stub-3-v1".to_string(),
            embedding.len(),
            embedding,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn s2_first_message_creates_a_new_cluster() {
        let store = FakeStore::default();
        let broker = FakeBroker::default();
        let event = embedded_event("org1", "u1", vec![1.0, 0.0, 0.0]);
        let payload = to_json_bytes(&event).unwrap();

        let verdict = cluster_one(&broker, &store, ClusterConfig::default(), &payload)
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Ack));
        assert_eq!(store.db.lock().unwrap().clusters.len(), 1);
    }

    #[tokio::test]
    async fn s3_similar_message_assigns_to_existing_cluster() {
        let store = FakeStore::default();
        let broker = FakeBroker::default();
        let cluster_config = ClusterConfig::default();

        let e1 = embedded_event("org1", "u1", vec![1.0, 0.0, 0.0]);
        let p1 = to_json_bytes(&e1).unwrap();
        cluster_one(&broker, &store, cluster_config, &p1).await.unwrap();

        // cos distance to [1,0,0] is ~0 for a near-identical vector.
        let e2 = embedded_event("org1", "u2", vec![0.99, 0.01, 0.0]);
        let p2 = to_json_bytes(&e2).unwrap();
        cluster_one(&broker, &store, cluster_config, &p2).await.unwrap();

        assert_eq!(store.db.lock().unwrap().clusters.len(), 1);
    }

    #[tokio::test]
    async fn s4_dissimilar_message_creates_a_second_cluster() {
        let store = FakeStore::default();
        let broker = FakeBroker::default();
        let cluster_config = ClusterConfig::default();

        let e1 = embedded_event("org1", "u1", vec![1.0, 0.0, 0.0]);
        let p1 = to_json_bytes(&e1).unwrap();
        cluster_one(&broker, &store, cluster_config, &p1).await.unwrap();

        let e2 = embedded_event("org1", "u2", vec![0.0, 1.0, 0.0]);
        let p2 = to_json_bytes(&e2).unwrap();
        cluster_one(&broker, &store, cluster_config, &p2).await.unwrap();

        assert_eq!(store.db.lock().unwrap().clusters.len(), 2);
    }

    #[tokio::test]
    async fn s5_redelivery_of_an_already_clustered_message_is_idempotent() {
        let store = FakeStore::default();
        let broker = FakeBroker::default();
        let cluster_config = ClusterConfig::default();

        let event = embedded_event("org1", "u1", vec![1.0, 0.0, 0.0]);
        let payload = to_json_bytes(&event).unwrap();

        cluster_one(&broker, &store, cluster_config, &payload).await.unwrap();
        cluster_one(&broker, &store, cluster_config, &payload).await.unwrap();

        // One cluster, two published clustered events (duplicates tolerated).
        assert_eq!(store.db.lock().unwrap().clusters.len(), 1);
        assert_eq!(broker.published.lock().unwrap().len(), 2);
    }

    #[test]
    fn malformed_payload_short_circuit_is_exercised_by_parse_message_embedded() {
        assert!(parse_message_embedded(b"not json").is_err());
    }
}
