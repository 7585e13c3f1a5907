//! Crosstalk embedder worker.
//!
//! Consumes `messages.>` on durable `embedder_v1`, computes an embedding for
//! each message's text, and publishes `message.embedded` to
//! `embeddings.{org_id}`. See SPEC_FULL §4.5.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use chrono::Utc;
use crosstalk_adapters::{CrosstalkBroker, EmbedProvider, PostgresVectorStore, RemoteEmbedder, StubEmbedder};
use crosstalk_domain::{parse_message_created, to_json_bytes, MessageEmbeddedEvent};
use crosstalk_ports::{Delivery, EmbedError, Embedder, MessageBroker, MessageConsumer, VectorStore};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use config::WorkerConfig;

enum EmbedBackend {
    Stub(StubEmbedder),
    Remote(RemoteEmbedder),
}

impl Embedder for EmbedBackend {
    fn model_version(&self) -> &str {
        match self {
            Self::Stub(e) => e.model_version(),
            Self::Remote(e) => e.model_version(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            Self::Stub(e) => e.dim(),
            Self::Remote(e) => e.dim(),
        }
    }

    async fn embed(
        &self,
        org_id: &str,
        message_id: uuid::Uuid,
        text: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        match self {
            Self::Stub(e) => e.embed(org_id, message_id, text).await,
            Self::Remote(e) => e.embed(org_id, message_id, text).await,
        }
    }
}

fn build_embedder(config: &crosstalk_adapters::EmbedConfig) -> EmbedBackend {
    match config.provider {
        EmbedProvider::Stub => {
            EmbedBackend::Stub(StubEmbedder::new(config.model_version.clone(), config.dim))
        }
        EmbedProvider::Remote => {
            let url = config
                .remote_url
                .clone()
                .unwrap_or_else(|| "http://localhost:8080/embed".to_string());
            EmbedBackend::Remote(
                RemoteEmbedder::new(
                    url,
                    config.remote_timeout,
                    config.model_version.clone(),
                    config.dim,
                    config.fallback_to_stub,
                )
                .expect("failed to build remote embedder HTTP client"),
            )
        }
    }
}

struct WorkerState {
    config: WorkerConfig,
    running: AtomicBool,
    last_poll: RwLock<Option<chrono::DateTime<Utc>>>,
    embedded_count: AtomicU64,
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
        "embedded_count": state.embedded_count.load(Ordering::Relaxed),
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

    info!(service = %config.service_name, "starting crosstalk-embedder");

    let broker = Arc::new(
        CrosstalkBroker::connect(config.nats.clone())
            .await
            .expect("failed to connect to NATS"),
    );

    let store = if config.embed.persist_to_db {
        Some(
            PostgresVectorStore::connect(&config.pg)
                .await
                .expect("failed to connect to Postgres"),
        )
    } else {
        None
    };

    let embedder = build_embedder(&config.embed);

    let consumer = broker
        .consumer(
            &config.nats.stream_name,
            crosstalk_adapters::nats::durables::EMBEDDER,
            "messages.>",
        )
        .await
        .expect("failed to bind embedder_v1 consumer");

    let state = Arc::new(WorkerState {
        config: config.clone(),
        running: AtomicBool::new(true),
        last_poll: RwLock::new(None),
        embedded_count: AtomicU64::new(0),
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
    let worker_loop = tokio::spawn(async move {
        run_loop(worker_state, broker.as_ref(), &consumer, &embedder, store.as_ref()).await;
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight batch");
    state.running.store(false, Ordering::Relaxed);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), worker_loop).await;
    health_server.abort();
    info!("crosstalk-embedder shutdown complete");
}

async fn run_loop(
    state: Arc<WorkerState>,
    broker: &CrosstalkBroker,
    consumer: &<CrosstalkBroker as MessageBroker>::Consumer,
    embedder: &EmbedBackend,
    store: Option<&PostgresVectorStore>,
) {
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
            match process_one(broker, embedder, store, delivery.payload()).await {
                Ok(Verdict::Ack) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "ack failed");
                    } else {
                        state.embedded_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(Verdict::Drop) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "ack-to-drop failed for malformed event");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "embedder processing error, will redeliver");
                    if let Err(e) = delivery.nak().await {
                        warn!(error = %e, "nak failed");
                    }
                }
            }
        }
    }
}

enum Verdict {
    /// Published successfully; acknowledge the delivery.
    Ack,
    /// Permanently malformed event; acknowledge so it is not redelivered.
    Drop,
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("embedding request failed: {0}")]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Broker(#[from] crosstalk_ports::BrokerError),
    #[error(transparent)]
    Store(#[from] crosstalk_ports::StoreError),
}

async fn process_one(
    broker: &CrosstalkBroker,
    embedder: &EmbedBackend,
    store: Option<&PostgresVectorStore>,
    payload: &[u8],
) -> Result<Verdict, ProcessError> {
    let event = match parse_message_created(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed message.created event, dropping");
            return Ok(Verdict::Drop);
        }
    };

    let embedding = embedder
        .embed(&event.org_id, event.message.message_id, &event.message.text)
        .await?;

    let now = Utc::now();
    let embedded = MessageEmbeddedEvent::new(
        uuid::Uuid::new_v4(),
        event.org_id.clone(),
        event.message.clone(),
        embedder.model_version().to_string(),
        embedder.dim(),
        embedding.clone(),
        now,
    );

    if let Some(store) = store {
        let message_embedding = crosstalk_domain::MessageEmbedding {
            org_id: event.org_id.clone(),
            message_id: event.message.message_id,
            model_version: embedder.model_version().to_string(),
            embedding,
        };
        store.upsert_embedding(&message_embedding).await?;
    }

    let payload = to_json_bytes(&embedded).unwrap_or_default();
    let subject = format!("embeddings.{}", event.org_id);
    broker
        .publish(&subject, &embedded.event_id.to_string(), &payload)
        .await?;

    Ok(Verdict::Ack)
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
