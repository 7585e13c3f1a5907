//! Crosstalk port traits.
//!
//! These interfaces separate the pipeline's business logic (in the
//! `crosstalk-embedder`/`crosstalk-clusterer`/`crosstalk-api` binaries) from
//! its infrastructure (`crosstalk-adapters`). Per the hexagonal layout, this
//! crate ports:
//! - `MessageBroker` / `MessageConsumer` / `Delivery`
//! - `VectorStore` / `ClusterTransaction`
//! - `Embedder`
//! - `Clock`

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crosstalk_domain::{Cluster, Message, MessageClusterAssignment, MessageEmbedding};
use uuid::Uuid;

/// Durable, at-least-once message broker port (backed by NATS JetStream).
///
/// Implementors are responsible for idempotent stream/consumer bootstrap;
/// this trait only covers the steady-state publish/consume path.
pub trait MessageBroker: Send + Sync {
    type Consumer: MessageConsumer;

    /// Publish `payload` to `subject`. `msg_id` is used for broker-side
    /// publish deduplication (e.g. a `Nats-Msg-Id` header) within the
    /// duplicate window; it is not a substitute for consumer-side
    /// idempotency. Returns the stream sequence number assigned to the
    /// published message.
    fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<u64, BrokerError>> + Send;

    /// Bind to a durable pull consumer on `stream` named `durable_name`,
    /// filtered to `filter_subject`. Idempotent: binds to the existing
    /// consumer if one by that name is already provisioned.
    fn consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> impl Future<Output = Result<Self::Consumer, BrokerError>> + Send;
}

/// A bound, durable pull consumer.
pub trait MessageConsumer: Send + Sync {
    type Delivery: Delivery;

    /// Fetch up to `batch_size` deliveries, waiting at most `expires` for
    /// the first one. Returns an empty `Vec` on timeout, never an error.
    fn fetch(
        &self,
        batch_size: usize,
        expires: Duration,
    ) -> impl Future<Output = Result<Vec<Self::Delivery>, BrokerError>> + Send;
}

/// A single delivered message awaiting acknowledgement.
///
/// Exactly one of `ack`/`nak`/`term` must be called; dropping a `Delivery`
/// without calling one leaves it to redeliver after `ack_wait`.
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// Acknowledge successful processing.
    fn ack(self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Negative-acknowledge: redeliver, subject to `max_deliver`.
    fn nak(self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Terminate: never redeliver (used for poison events).
    fn term(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("publish failed on subject {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("consumer bootstrap failed for {durable_name} on {stream}: {message}")]
    ConsumerSetup {
        stream: String,
        durable_name: String,
        message: String,
    },

    #[error("fetch failed: {message}")]
    Fetch { message: String },

    #[error("ack/nak/term failed: {message}")]
    AckFailed { message: String },
}

/// Result of a nearest-centroid lookup, per SPEC_FULL §4.6.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestCluster {
    pub cluster_id: Uuid,
    pub centroid: Vec<f32>,
    pub effective_count: i64,
    pub distance: f64,
}

/// One participant's mean embedding within a cluster (per-user average of
/// the embeddings of messages they contributed to that cluster).
#[derive(Debug, Clone, PartialEq)]
pub struct UserClusterMean {
    pub user_id: String,
    pub mean_embedding: Vec<f32>,
    pub message_count: i64,
}

/// A cluster the target user participates in, with every participant's
/// mean embedding in that cluster (including the target user).
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterParticipants {
    pub cluster_id: Uuid,
    pub participants: Vec<UserClusterMean>,
}

/// Transactional vector store port (backed by Postgres + pgvector).
///
/// Message/embedding writes are independent upserts; cluster writes are
/// grouped into a [`ClusterTransaction`] so the clusterer's
/// read-decide-write sequence commits atomically.
pub trait VectorStore: Send + Sync {
    type Transaction: ClusterTransaction;

    /// Insert a message. Returns `false` if `(org_id, message_id)` already
    /// existed (idempotent no-op on redelivery).
    fn insert_message(&self, message: &Message) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Upsert an embedding for `(org_id, message_id, model_version)`.
    fn upsert_embedding(
        &self,
        embedding: &MessageEmbedding,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Begin a transaction scoping one message's cluster assignment.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;

    /// Every active cluster `user_id` has contributed a message to, each
    /// with the mean embedding of every participant in that cluster — the
    /// connections query's core read (SPEC_FULL §4.7).
    fn cluster_connections(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<ClusterParticipants>, StoreError>> + Send;

    /// Fetch a cluster by id, for read paths that don't need a transaction.
    fn get_cluster(
        &self,
        org_id: &str,
        cluster_id: Uuid,
    ) -> impl Future<Output = Result<Option<Cluster>, StoreError>> + Send;
}

/// The clusterer's atomic read-decide-write unit of work.
///
/// All methods operate within one open database transaction; callers must
/// call exactly one of `commit`/`rollback`.
pub trait ClusterTransaction: Send {
    /// The latest assignment for `(org_id, message_id)`, if this message
    /// was already clustered (idempotency short-circuit per SPEC_FULL
    /// §4.6 step A). Ordered by `assigned_at DESC`.
    fn existing_assignment(
        &mut self,
        org_id: &str,
        message_id: Uuid,
    ) -> impl Future<Output = Result<Option<MessageClusterAssignment>, StoreError>> + Send;

    /// The nearest active cluster to `embedding` within `(org_id,
    /// model_version)`, ties broken by ascending `cluster_id`.
    fn nearest_active_cluster(
        &mut self,
        org_id: &str,
        model_version: &str,
        embedding: &[f32],
    ) -> impl Future<Output = Result<Option<NearestCluster>, StoreError>> + Send;

    /// Create a new singleton cluster with `embedding` as its centroid.
    fn create_cluster(
        &mut self,
        org_id: &str,
        model_version: &str,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Uuid, StoreError>> + Send;

    /// Apply the capped-mean centroid update in place; increments
    /// `effective_count` server-side rather than read-modify-write.
    fn update_cluster_centroid(
        &mut self,
        org_id: &str,
        cluster_id: Uuid,
        new_centroid: &[f32],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Upsert the message's assignment to `cluster_id`.
    fn upsert_assignment(
        &mut self,
        org_id: &str,
        message_id: Uuid,
        cluster_id: Uuid,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Upsert the user's cumulative participation in `cluster_id`,
    /// incrementing `message_count` in place.
    fn upsert_participation(
        &mut self,
        org_id: &str,
        user_id: &str,
        cluster_id: Uuid,
        participation_delta: f64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Vector store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("query failed: {message}")]
    Query { message: String },

    #[error("transaction failed: {message}")]
    Transaction { message: String },

    #[error("cluster {cluster_id} not found in org {org_id}")]
    ClusterNotFound { org_id: String, cluster_id: Uuid },
}

/// Embedding backend port. Implementations include a deterministic stub
/// (for tests and environments without a model server) and a remote HTTP
/// backend (SPEC_FULL §4.5).
pub trait Embedder: Send + Sync {
    /// Identifier recorded alongside every embedding it produces, e.g.
    /// `"stub-384-v1"` or a remote model's own version tag.
    fn model_version(&self) -> &str;

    /// Fixed output dimension this embedder always produces.
    fn dim(&self) -> usize;

    fn embed(
        &self,
        org_id: &str,
        message_id: Uuid,
        text: &str,
    ) -> impl Future<Output = Result<Vec<f32>, EmbedError>> + Send;
}

/// Embedding backend errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding request failed: {message}")]
    Request { message: String },

    #[error("embedding response had dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding request timed out after {millis}ms")]
    Timeout { millis: u64 },
}

/// Clock port for deterministic time handling in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
