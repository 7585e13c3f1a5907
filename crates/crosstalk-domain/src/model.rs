//! Core entities per SPEC_FULL §3.
//!
//! These are the semantic types shared across the pipeline and the
//! connections query. Adapters translate to and from their own row types;
//! nothing in this module touches sqlx, serde wire formats, or NATS.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// An ingested chat-like message. Append-only: never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub org_id: String,
    pub message_id: Uuid,
    pub user_id: String,
    pub ts: DateTime<Utc>,
    pub source_type: String,
    pub text: String,
    pub metadata: Value,
}

/// An embedding computed for a message under a specific model version.
///
/// Unique per `(org_id, message_id, model_version)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEmbedding {
    pub org_id: String,
    pub message_id: Uuid,
    pub model_version: String,
    pub embedding: Vec<f32>,
}

/// A semantic cluster scoped to one `(org_id, model_version)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub org_id: String,
    pub cluster_id: Uuid,
    pub model_version: String,
    pub centroid: Vec<f32>,
    pub effective_count: i64,
    pub label: Option<String>,
    pub is_active: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message's (at most one active) assignment to a cluster.
///
/// Unique per `(org_id, message_id, cluster_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageClusterAssignment {
    pub org_id: String,
    pub message_id: Uuid,
    pub cluster_id: Uuid,
    pub confidence: f64,
    pub assigned_at: DateTime<Utc>,
}

/// A user's cumulative participation in a cluster.
///
/// Unique per `(org_id, user_id, cluster_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserClusterParticipation {
    pub org_id: String,
    pub user_id: String,
    pub cluster_id: Uuid,
    pub participation_score: f64,
    pub message_count: i64,
    pub last_activity_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Clamp a confidence/similarity value to `[-1, 1]` before persisting.
///
/// Per SPEC_FULL §9 ("Threshold arithmetic note"): `1 - cosine_distance`
/// can drift outside `[0, 1]` for non-normalized input; callers must clamp
/// before the value reaches storage.
#[must_use]
pub fn clamp_confidence(value: f64) -> f64 {
    value.clamp(-1.0, 1.0)
}

/// L2-normalize a vector in place. No-op on a zero vector (guards against
/// division by zero; an all-zero embedding is left as-is).
pub fn l2_normalize(vec: &mut [f32]) {
    let norm_sq: f32 = vec.iter().map(|x| x * x).sum();
    if norm_sq <= 0.0 {
        return;
    }
    let norm = norm_sq.sqrt();
    for x in vec.iter_mut() {
        *x /= norm;
    }
}

/// Return an L2-normalized copy of `vec`.
#[must_use]
pub fn l2_normalized(vec: &[f32]) -> Vec<f32> {
    let mut out = vec.to_vec();
    l2_normalize(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_norm() {
        let mut v = vec![3.0_f32, 4.0, 0.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_is_noop() {
        let mut v = vec![0.0_f32, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn clamp_confidence_bounds_noise() {
        assert_eq!(clamp_confidence(1.5), 1.0);
        assert_eq!(clamp_confidence(-1.5), -1.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }
}
