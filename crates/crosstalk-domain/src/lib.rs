//! Crosstalk domain core.
//!
//! Pure domain logic for the ingestion/embedding/clustering pipeline:
//! entities, event envelopes, and the codec/shape errors that can arise
//! from them. This crate MUST NOT import DB clients, HTTP frameworks, or
//! messaging SDKs — those live in `crosstalk-ports` (traits) and
//! `crosstalk-adapters` (implementations).

pub mod errors;
pub mod events;
pub mod model;

pub use errors::MalformedEvent;
pub use events::{
    parse_message_clustered, parse_message_created, parse_message_embedded, to_json_bytes,
    EventTypeClustered, EventTypeCreated, EventTypeEmbedded, MessageClusteredEvent,
    MessageCreatedEvent, MessageEmbeddedEvent, MessagePayload, EVENT_VERSION,
};
pub use model::{
    clamp_confidence, l2_normalize, l2_normalized, Cluster, Message, MessageClusterAssignment,
    MessageEmbedding, UserClusterParticipation,
};
