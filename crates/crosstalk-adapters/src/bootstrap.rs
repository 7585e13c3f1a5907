//! Idempotent stream/consumer provisioning, grounded on the original's
//! `app/ops/js_init.py`: run once at deploy time (or at worker startup) to
//! guarantee the stream and all three durables exist before any worker
//! starts fetching.

use crosstalk_ports::{BrokerError, MessageBroker};
use tracing::info;

use crate::nats::{durables, CrosstalkBroker};

/// Provision the `api_messages_v1`, `embedder_v1`, and `clusterer_v1`
/// durable consumers against `broker`'s stream. Safe to call repeatedly;
/// `get_or_create_consumer` makes each call a no-op once provisioned.
pub async fn ensure_consumers(broker: &CrosstalkBroker, stream_name: &str) -> Result<(), BrokerError> {
    broker
        .consumer(stream_name, durables::API_MESSAGES, "messages.>")
        .await?;
    info!(durable = durables::API_MESSAGES, "consumer provisioned");

    broker
        .consumer(stream_name, durables::EMBEDDER, "messages.>")
        .await?;
    info!(durable = durables::EMBEDDER, "consumer provisioned");

    broker
        .consumer(stream_name, durables::CLUSTERER, "embeddings.>")
        .await?;
    info!(durable = durables::CLUSTERER, "consumer provisioned");

    Ok(())
}
