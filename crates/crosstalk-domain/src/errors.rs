//! Domain-level errors (codec and shape validation).
//!
//! Adapter- and port-level errors (`BrokerError`, `StoreError`, `EmbedError`)
//! live in `crosstalk-ports`; this crate only owns the errors that can arise
//! from parsing or constructing a domain value.

use thiserror::Error;

/// Errors raised while parsing or validating an event envelope.
///
/// Per SPEC_FULL §4.1: any of these causes a consumer to treat the delivery
/// as a poison event (log, ack, drop — never redeliver).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedEvent {
    #[error("failed to parse event JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("embedding length {actual} does not match embedding_dim {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("confidence {value} is outside the allowed range [-1, 1]")]
    ConfidenceOutOfRange { value: f64 },
}
