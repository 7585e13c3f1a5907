//! Postgres + pgvector vector store adapter.
//!
//! Grounded on `sgttomas-solver-ralph/crates/sr-adapters/src/postgres.rs`'s
//! transaction and row-mapping style. `sqlx` has no first-party pgvector
//! binder in the teacher's dependency set, so vector columns are bound as
//! their literal-text form (`'[0.1,0.2,...]'::vector`) — the same approach
//! the original Python's `to_pgvector_literal` takes — and read back via an
//! explicit `::text` cast.

use chrono::{DateTime, Utc};
use crosstalk_domain::{Cluster, Message, MessageClusterAssignment, MessageEmbedding};
use crosstalk_ports::{
    ClusterParticipants, ClusterTransaction, NearestCluster, StoreError, UserClusterMean,
    VectorStore,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::config::PgConfig;

/// Render an embedding as pgvector's literal text form, e.g. `[0.1,0.2,0.3]`.
#[must_use]
pub fn vector_literal(v: &[f32]) -> String {
    let mut s = String::with_capacity(v.len() * 8 + 2);
    s.push('[');
    for (i, x) in v.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&x.to_string());
    }
    s.push(']');
    s
}

/// Parse pgvector's `::text` representation back into a `Vec<f32>`.
///
/// # Errors
/// Returns [`StoreError::Query`] if `s` isn't a well-formed `[a,b,c]` literal.
pub fn parse_vector_literal(s: &str) -> Result<Vec<f32>, StoreError> {
    let trimmed = s.trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| StoreError::Query {
                    message: format!("malformed vector literal component {part:?}: {e}"),
                })
        })
        .collect()
}

/// Postgres-backed vector store.
pub struct PostgresVectorStore {
    pool: PgPool,
}

impl PostgresVectorStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and build a pool-backed store, sized by `config.max_connections`.
    ///
    /// # Errors
    /// Returns [`StoreError::Connection`] if the pool cannot be established.
    pub async fn connect(config: &PgConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_url())
            .await
            .map_err(|e| StoreError::Connection {
                message: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl VectorStore for PostgresVectorStore {
    type Transaction = PgClusterTransaction;

    #[instrument(skip(self, message), fields(org_id = %message.org_id, message_id = %message.message_id))]
    async fn insert_message(&self, message: &Message) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (org_id, message_id, user_id, ts, source_type, text, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, message_id) DO NOTHING
            "#,
        )
        .bind(&message.org_id)
        .bind(message.message_id)
        .bind(&message.user_id)
        .bind(message.ts)
        .bind(&message.source_type)
        .bind(&message.text)
        .bind(&message.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "insert_message failed");
            StoreError::Query {
                message: e.to_string(),
            }
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, embedding), fields(org_id = %embedding.org_id, message_id = %embedding.message_id))]
    async fn upsert_embedding(&self, embedding: &MessageEmbedding) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_embeddings (org_id, message_id, model_version, embedding)
            VALUES ($1, $2, $3, $4::vector)
            ON CONFLICT (org_id, message_id, model_version) DO NOTHING
            "#,
        )
        .bind(&embedding.org_id)
        .bind(embedding.message_id)
        .bind(&embedding.model_version)
        .bind(vector_literal(&embedding.embedding))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction {
                message: e.to_string(),
            })?;
        Ok(PgClusterTransaction { tx })
    }

    #[instrument(skip(self), fields(org_id = %org_id, user_id = %user_id))]
    async fn cluster_connections(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Vec<ClusterParticipants>, StoreError> {
        // target_clusters: active clusters the target user has a message in.
        let rows = sqlx::query(
            r#"
            WITH target_clusters AS (
                SELECT DISTINCT mc.cluster_id
                FROM message_cluster mc
                JOIN messages m ON m.org_id = mc.org_id AND m.message_id = mc.message_id
                JOIN clusters c ON c.org_id = mc.org_id AND c.cluster_id = mc.cluster_id
                WHERE mc.org_id = $1 AND m.user_id = $2 AND c.is_active = true
            ),
            user_cluster_vectors AS (
                SELECT
                    mc.cluster_id,
                    m.user_id,
                    AVG(me.embedding) AS mean_embedding,
                    COUNT(*) AS message_count
                FROM message_cluster mc
                JOIN messages m ON m.org_id = mc.org_id AND m.message_id = mc.message_id
                JOIN message_embeddings me
                    ON me.org_id = mc.org_id
                   AND me.message_id = mc.message_id
                JOIN clusters c ON c.org_id = mc.org_id AND c.cluster_id = mc.cluster_id
                WHERE mc.org_id = $1
                  AND mc.cluster_id IN (SELECT cluster_id FROM target_clusters)
                  AND me.model_version = c.model_version
                GROUP BY mc.cluster_id, m.user_id
            )
            SELECT cluster_id, user_id, mean_embedding::text AS mean_embedding_text, message_count
            FROM user_cluster_vectors
            ORDER BY cluster_id, user_id ASC
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;

        let mut out: Vec<ClusterParticipants> = Vec::new();
        for row in &rows {
            let cluster_id: Uuid = row.get("cluster_id");
            let participant_user_id: String = row.get("user_id");
            let mean_text: String = row.get("mean_embedding_text");
            let mean_embedding = parse_vector_literal(&mean_text)?;
            let message_count: i64 = row.get("message_count");

            match out.last_mut() {
                Some(last) if last.cluster_id == cluster_id => {
                    last.participants.push(UserClusterMean {
                        user_id: participant_user_id,
                        mean_embedding,
                        message_count,
                    });
                }
                _ => out.push(ClusterParticipants {
                    cluster_id,
                    participants: vec![UserClusterMean {
                        user_id: participant_user_id,
                        mean_embedding,
                        message_count,
                    }],
                }),
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(org_id = %org_id, cluster_id = %cluster_id))]
    async fn get_cluster(
        &self,
        org_id: &str,
        cluster_id: Uuid,
    ) -> Result<Option<Cluster>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT org_id, cluster_id, model_version, centroid_embedding::text AS centroid_text,
                   effective_count, label, is_active, last_activity_at, created_at, updated_at
            FROM clusters
            WHERE org_id = $1 AND cluster_id = $2
            "#,
        )
        .bind(org_id)
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;

        row.map(row_to_cluster).transpose()
    }
}

fn row_to_cluster(row: PgRow) -> Result<Cluster, StoreError> {
    let centroid_text: String = row.get("centroid_text");
    Ok(Cluster {
        org_id: row.get("org_id"),
        cluster_id: row.get("cluster_id"),
        model_version: row.get("model_version"),
        centroid: parse_vector_literal(&centroid_text)?,
        effective_count: row.get("effective_count"),
        label: row.get("label"),
        is_active: row.get("is_active"),
        last_activity_at: row.get("last_activity_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// One clusterer event's atomic read-decide-write unit of work.
pub struct PgClusterTransaction {
    tx: Transaction<'static, Postgres>,
}

impl ClusterTransaction for PgClusterTransaction {
    #[instrument(skip(self), fields(org_id = %org_id, message_id = %message_id))]
    async fn existing_assignment(
        &mut self,
        org_id: &str,
        message_id: Uuid,
    ) -> Result<Option<MessageClusterAssignment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT org_id, message_id, cluster_id, confidence, assigned_at
            FROM message_cluster
            WHERE org_id = $1 AND message_id = $2
            ORDER BY assigned_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(message_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;

        Ok(row.map(|r| MessageClusterAssignment {
            org_id: r.get("org_id"),
            message_id: r.get("message_id"),
            cluster_id: r.get("cluster_id"),
            confidence: r.get("confidence"),
            assigned_at: r.get("assigned_at"),
        }))
    }

    #[instrument(skip(self, embedding), fields(org_id = %org_id, model_version = %model_version))]
    async fn nearest_active_cluster(
        &mut self,
        org_id: &str,
        model_version: &str,
        embedding: &[f32],
    ) -> Result<Option<NearestCluster>, StoreError> {
        let literal = vector_literal(embedding);
        let row = sqlx::query(
            r#"
            SELECT cluster_id, centroid_embedding::text AS centroid_text, effective_count,
                   (centroid_embedding <=> $1::vector) AS distance
            FROM clusters
            WHERE org_id = $2 AND model_version = $3 AND is_active = true
            ORDER BY centroid_embedding <=> $1::vector ASC, cluster_id ASC
            LIMIT 1
            "#,
        )
        .bind(&literal)
        .bind(org_id)
        .bind(model_version)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;

        row.map(|r| {
            let centroid_text: String = r.get("centroid_text");
            Ok(NearestCluster {
                cluster_id: r.get("cluster_id"),
                centroid: parse_vector_literal(&centroid_text)?,
                effective_count: r.get("effective_count"),
                distance: r.get("distance"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, embedding), fields(org_id = %org_id, model_version = %model_version))]
    async fn create_cluster(
        &mut self,
        org_id: &str,
        model_version: &str,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let cluster_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO clusters (
                org_id, cluster_id, model_version, centroid_embedding,
                effective_count, label, is_active, last_activity_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4::vector, 1, NULL, true, $5, $5, $5)
            "#,
        )
        .bind(org_id)
        .bind(cluster_id)
        .bind(model_version)
        .bind(vector_literal(embedding))
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;

        Ok(cluster_id)
    }

    #[instrument(skip(self, new_centroid), fields(org_id = %org_id, cluster_id = %cluster_id))]
    async fn update_cluster_centroid(
        &mut self,
        org_id: &str,
        cluster_id: Uuid,
        new_centroid: &[f32],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // effective_count increments in place; never read-then-write (per
        // the concurrency contract: concurrent updates must not lose a count).
        sqlx::query(
            r#"
            UPDATE clusters
            SET centroid_embedding = $1::vector,
                effective_count = effective_count + 1,
                last_activity_at = $2,
                updated_at = $2
            WHERE org_id = $3 AND cluster_id = $4
            "#,
        )
        .bind(vector_literal(new_centroid))
        .bind(now)
        .bind(org_id)
        .bind(cluster_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, message_id = %message_id, cluster_id = %cluster_id))]
    async fn upsert_assignment(
        &mut self,
        org_id: &str,
        message_id: Uuid,
        cluster_id: Uuid,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_cluster (org_id, message_id, cluster_id, confidence, assigned_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (org_id, message_id, cluster_id) DO NOTHING
            "#,
        )
        .bind(org_id)
        .bind(message_id)
        .bind(cluster_id)
        .bind(confidence)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, user_id = %user_id, cluster_id = %cluster_id))]
    async fn upsert_participation(
        &mut self,
        org_id: &str,
        user_id: &str,
        cluster_id: Uuid,
        participation_delta: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_cluster (org_id, user_id, cluster_id, participation_score, message_count, last_activity_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $5)
            ON CONFLICT (org_id, user_id, cluster_id) DO UPDATE SET
                participation_score = user_cluster.participation_score + EXCLUDED.participation_score,
                message_count = user_cluster.message_count + 1,
                last_activity_at = EXCLUDED.last_activity_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(cluster_id)
        .bind(participation_delta)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Query {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| StoreError::Transaction {
            message: e.to_string(),
        })
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Transaction {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_round_trips() {
        let v = vec![0.1_f32, -0.2, 3.0];
        let literal = vector_literal(&v);
        assert_eq!(literal, "[0.1,-0.2,3]");
        let parsed = parse_vector_literal(&literal).unwrap();
        assert!((parsed[0] - 0.1).abs() < 1e-6);
        assert!((parsed[1] + 0.2).abs() < 1e-6);
        assert!((parsed[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn parse_vector_literal_rejects_malformed_component() {
        assert!(parse_vector_literal("[0.1,not_a_float,0.3]").is_err());
    }

    #[test]
    fn parse_vector_literal_handles_empty() {
        assert_eq!(parse_vector_literal("[]").unwrap(), Vec::<f32>::new());
    }
}
