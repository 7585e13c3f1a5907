//! `GET /v1/orgs/{org_id}/users/{user_id}/connections` — the connections
//! query (SPEC_FULL §4.7).

use axum::extract::{Path, State};
use axum::Json;
use crosstalk_ports::{ClusterParticipants, VectorStore};
use serde::Serialize;
use uuid::Uuid;

use super::ApiResult;
use crate::AppState;

#[derive(Serialize)]
pub struct ConnectionsResponse {
    pub org_id: String,
    pub user_id: String,
    pub centroids: Vec<ClusterCentroid>,
}

#[derive(Serialize)]
pub struct ClusterCentroid {
    pub cluster_id: Uuid,
    pub users: Vec<UserDistance>,
}

#[derive(Serialize)]
pub struct UserDistance {
    pub user_id: String,
    pub distance: f64,
    pub message_count: i64,
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 1.0;
    }
    let cosine_similarity = f64::from(dot / (norm_a * norm_b));
    (1.0 - cosine_similarity).clamp(0.0, 2.0)
}

fn rank_participants(target_user_id: &str, participants: &ClusterParticipants) -> Option<ClusterCentroid> {
    let target = participants
        .participants
        .iter()
        .find(|p| p.user_id == target_user_id)?;
    let target_mean = target.mean_embedding.clone();

    let mut users: Vec<UserDistance> = participants
        .participants
        .iter()
        .map(|p| UserDistance {
            user_id: p.user_id.clone(),
            distance: if p.user_id == target_user_id {
                0.0
            } else {
                cosine_distance(&target_mean, &p.mean_embedding)
            },
            message_count: p.message_count,
        })
        .collect();

    users.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    Some(ClusterCentroid {
        cluster_id: participants.cluster_id,
        users,
    })
}

pub async fn get_connections<B: Send + Sync + 'static, V: VectorStore>(
    State(state): State<AppState<B, V>>,
    Path((org_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<ConnectionsResponse>> {
    let clusters = state.store.cluster_connections(&org_id, &user_id).await?;

    let centroids: Vec<ClusterCentroid> = clusters
        .iter()
        .filter_map(|c| rank_participants(&user_id, c))
        .collect();

    Ok(Json(ConnectionsResponse {
        org_id,
        user_id,
        centroids,
    }))
}
