//! `POST /v1/orgs/{org_id}/messages` — the ingress endpoint.
//!
//! No database write happens on this path; the message becomes durable the
//! moment it is published to `messages.{org_id}`. Downstream workers derive
//! their own state from that event.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use crosstalk_domain::{to_json_bytes, MessageCreatedEvent, MessagePayload};
use crosstalk_ports::MessageBroker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestRequest {
    #[serde(default)]
    pub message_id: Option<Uuid>,
    pub user_id: String,
    pub ts: DateTime<Utc>,
    pub text: String,
    pub source_type: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub event_id: Uuid,
    pub org_id: String,
    pub message_id: Uuid,
    pub subject: String,
    pub stream: String,
    pub seq: u64,
}

pub async fn ingest_message<B: MessageBroker, V: Send + Sync + 'static>(
    State(state): State<AppState<B, V>>,
    Path(org_id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let message_id = req.message_id.unwrap_or_else(Uuid::new_v4);

    let message = MessagePayload {
        message_id,
        user_id: req.user_id,
        ts: req.ts,
        source_type: req.source_type,
        text: req.text,
        metadata: req.metadata,
    };

    let event = MessageCreatedEvent::new(Uuid::new_v4(), org_id.clone(), message);
    let payload = to_json_bytes(&event).map_err(|e| ApiError::Internal {
        message: e.to_string(),
    })?;

    let subject = format!("messages.{org_id}");
    let seq = state
        .broker
        .publish(&subject, &event.event_id.to_string(), &payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "accepted",
            event_id: event.event_id,
            org_id,
            message_id,
            subject,
            stream: state.stream_name.clone(),
            seq,
        }),
    ))
}
