//! Event schema & codec per SPEC_FULL §4.1.
//!
//! Three event kinds flow through the pipeline, each JSON-encoded with a
//! strict schema (`deny_unknown_fields`) so a consumer fails fast —
//! rather than silently accepting drift — on a producer/consumer version
//! mismatch. `event_type` is a fixed string per kind so a stray JSON blob
//! claiming the wrong kind is rejected rather than silently miscast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::MalformedEvent;

/// The full payload carried by `message.created` and copied through into
/// `message.embedded` so downstream consumers have complete context
/// without a join back to the messages table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagePayload {
    pub message_id: Uuid,
    pub user_id: String,
    pub ts: DateTime<Utc>,
    pub source_type: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Emitted by the ingress endpoint to `messages.{org_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageCreatedEvent {
    pub event_type: EventTypeCreated,
    pub event_version: u32,
    pub event_id: Uuid,
    pub org_id: String,
    pub message: MessagePayload,
}

/// Emitted by the embedder worker to `embeddings.{org_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageEmbeddedEvent {
    pub event_type: EventTypeEmbedded,
    pub event_version: u32,
    pub event_id: Uuid,
    pub org_id: String,
    pub message: MessagePayload,
    pub model_version: String,
    pub embedding_dim: usize,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Emitted by the clusterer worker to `clusters.{org_id}`.
///
/// Carries identifiers only, not the full `MessagePayload` — downstream
/// consumers that need message content already saw it in `message.embedded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageClusteredEvent {
    pub event_type: EventTypeClustered,
    pub event_version: u32,
    pub event_id: Uuid,
    pub org_id: String,
    pub message_id: Uuid,
    pub user_id: String,
    pub ts: DateTime<Utc>,
    pub model_version: String,
    pub cluster_id: Uuid,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Fixed-string discriminant for `message.created`, rejecting any other
/// value at deserialization time rather than accepting and ignoring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTypeCreated {
    #[serde(rename = "message.created")]
    MessageCreated,
}

/// Fixed-string discriminant for `message.embedded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTypeEmbedded {
    #[serde(rename = "message.embedded")]
    MessageEmbedded,
}

/// Fixed-string discriminant for `message.clustered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTypeClustered {
    #[serde(rename = "message.clustered")]
    MessageClustered,
}

/// Current event schema version. All three event kinds share one counter;
/// bump when any envelope's wire shape changes incompatibly.
pub const EVENT_VERSION: u32 = 1;

impl MessageCreatedEvent {
    #[must_use]
    pub fn new(event_id: Uuid, org_id: String, message: MessagePayload) -> Self {
        Self {
            event_type: EventTypeCreated::MessageCreated,
            event_version: EVENT_VERSION,
            event_id,
            org_id,
            message,
        }
    }
}

impl MessageEmbeddedEvent {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        org_id: String,
        message: MessagePayload,
        model_version: String,
        embedding_dim: usize,
        embedding: Vec<f32>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: EventTypeEmbedded::MessageEmbedded,
            event_version: EVENT_VERSION,
            event_id,
            org_id,
            message,
            model_version,
            embedding_dim,
            embedding,
            created_at,
        }
    }

    /// Validate that `embedding.len()` matches the declared `embedding_dim`.
    ///
    /// # Errors
    /// Returns [`MalformedEvent::DimensionMismatch`] on a mismatch.
    pub fn validate_dimension(&self) -> Result<(), MalformedEvent> {
        if self.embedding.len() == self.embedding_dim {
            Ok(())
        } else {
            Err(MalformedEvent::DimensionMismatch {
                expected: self.embedding_dim,
                actual: self.embedding.len(),
            })
        }
    }
}

impl MessageClusteredEvent {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        org_id: String,
        message_id: Uuid,
        user_id: String,
        ts: DateTime<Utc>,
        model_version: String,
        cluster_id: Uuid,
        confidence: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: EventTypeClustered::MessageClustered,
            event_version: EVENT_VERSION,
            event_id,
            org_id,
            message_id,
            user_id,
            ts,
            model_version,
            cluster_id,
            confidence,
            created_at,
        }
    }
}

/// Serialize any event to canonical JSON bytes.
///
/// # Errors
/// Returns [`MalformedEvent::InvalidJson`] if serialization fails (should
/// not happen for well-formed event structs; kept fallible for symmetry
/// with `parse_*`).
pub fn to_json_bytes<E: Serialize>(event: &E) -> Result<Vec<u8>, MalformedEvent> {
    serde_json::to_vec(event).map_err(|e| MalformedEvent::InvalidJson {
        reason: e.to_string(),
    })
}

/// Parse a `message.created` event from JSON bytes.
///
/// # Errors
/// Returns [`MalformedEvent::InvalidJson`] on unknown fields, missing
/// fields, or any other shape mismatch.
pub fn parse_message_created(data: &[u8]) -> Result<MessageCreatedEvent, MalformedEvent> {
    serde_json::from_slice(data).map_err(|e| MalformedEvent::InvalidJson {
        reason: e.to_string(),
    })
}

/// Parse a `message.embedded` event from JSON bytes, including the
/// `embedding_dim`/`embedding.len()` shape check.
///
/// # Errors
/// Returns [`MalformedEvent::InvalidJson`] on shape mismatch, or
/// [`MalformedEvent::DimensionMismatch`] if the declared dimension and
/// actual embedding length disagree.
pub fn parse_message_embedded(data: &[u8]) -> Result<MessageEmbeddedEvent, MalformedEvent> {
    let event: MessageEmbeddedEvent =
        serde_json::from_slice(data).map_err(|e| MalformedEvent::InvalidJson {
            reason: e.to_string(),
        })?;
    event.validate_dimension()?;
    Ok(event)
}

/// Parse a `message.clustered` event from JSON bytes.
///
/// # Errors
/// Returns [`MalformedEvent::InvalidJson`] on shape mismatch, or
/// [`MalformedEvent::ConfidenceOutOfRange`] if `confidence` falls outside
/// `[-1, 1]`.
pub fn parse_message_clustered(data: &[u8]) -> Result<MessageClusteredEvent, MalformedEvent> {
    let event: MessageClusteredEvent =
        serde_json::from_slice(data).map_err(|e| MalformedEvent::InvalidJson {
            reason: e.to_string(),
        })?;
    if !(-1.0..=1.0).contains(&event.confidence) {
        return Err(MalformedEvent::ConfidenceOutOfRange {
            value: event.confidence,
        });
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> MessagePayload {
        MessagePayload {
            message_id: Uuid::nil(),
            user_id: "u1".to_string(),
            ts: "2026-01-01T00:00:00Z".parse().unwrap(),
            source_type: "chat".to_string(),
            text: "hi".to_string(),
            metadata: json!({}),
        }
    }

    #[test]
    fn created_event_round_trips() {
        let evt = MessageCreatedEvent::new(Uuid::nil(), "org1".to_string(), sample_payload());
        let bytes = to_json_bytes(&evt).unwrap();
        let parsed = parse_message_created(&bytes).unwrap();
        assert_eq!(parsed, evt);
    }

    #[test]
    fn created_event_rejects_unknown_field() {
        let mut value = serde_json::to_value(MessageCreatedEvent::new(
            Uuid::nil(),
            "org1".to_string(),
            sample_payload(),
        ))
        .unwrap();
        value["bogus_field"] = json!("nope");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(parse_message_created(&bytes).is_err());
    }

    #[test]
    fn embedded_event_dimension_mismatch_is_rejected() {
        let evt = MessageEmbeddedEvent::new(
            Uuid::nil(),
            "org1".to_string(),
            sample_payload(),
            "stub-3-v1".to_string(),
            3,
            vec![0.1, 0.2],
            Utc::now(),
        );
        let bytes = to_json_bytes(&evt).unwrap();
        let err = parse_message_embedded(&bytes).unwrap_err();
        assert_eq!(
            err,
            MalformedEvent::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn embedded_event_round_trips() {
        let evt = MessageEmbeddedEvent::new(
            Uuid::nil(),
            "org1".to_string(),
            sample_payload(),
            "stub-3-v1".to_string(),
            3,
            vec![0.1, 0.2, 0.3],
            Utc::now(),
        );
        let bytes = to_json_bytes(&evt).unwrap();
        let parsed = parse_message_embedded(&bytes).unwrap();
        assert_eq!(parsed, evt);
    }

    #[test]
    fn clustered_event_confidence_out_of_range_is_rejected() {
        let evt = MessageClusteredEvent::new(
            Uuid::nil(),
            "org1".to_string(),
            Uuid::nil(),
            "u1".to_string(),
            Utc::now(),
            "stub-3-v1".to_string(),
            Uuid::nil(),
            1.5,
            Utc::now(),
        );
        let bytes = to_json_bytes(&evt).unwrap();
        assert!(parse_message_clustered(&bytes).is_err());
    }

    #[test]
    fn clustered_event_round_trips() {
        let evt = MessageClusteredEvent::new(
            Uuid::nil(),
            "org1".to_string(),
            Uuid::nil(),
            "u1".to_string(),
            Utc::now(),
            "stub-3-v1".to_string(),
            Uuid::nil(),
            0.95,
            Utc::now(),
        );
        let bytes = to_json_bytes(&evt).unwrap();
        let parsed = parse_message_clustered(&bytes).unwrap();
        assert_eq!(parsed, evt);
    }
}
