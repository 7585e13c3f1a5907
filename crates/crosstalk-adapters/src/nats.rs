//! NATS JetStream broker adapter.
//!
//! Implements `crosstalk_ports::MessageBroker` on a single stream carrying
//! all three event kinds (`messages.>`, `embeddings.>`, `clusters.>`),
//! matching the stream/consumer bootstrap in the original's
//! `app/ops/js_init.py`.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext,
};
use async_nats::{Client as NatsClient, HeaderMap};
use crosstalk_ports::{BrokerError, Delivery, MessageBroker, MessageConsumer};
use tracing::{debug, info, instrument, warn};

use crate::config::NatsConfig;

/// All subjects the single stream captures, per spec §4.2/§6.
pub const STREAM_SUBJECTS: [&str; 3] = ["messages.>", "embeddings.>", "clusters.>"];

/// Durable consumer names provisioned by `crosstalk-adapters::bootstrap`.
pub mod durables {
    pub const API_MESSAGES: &str = "api_messages_v1";
    pub const EMBEDDER: &str = "embedder_v1";
    pub const CLUSTERER: &str = "clusterer_v1";
}

/// JetStream-backed broker. One stream, many durable consumers.
pub struct CrosstalkBroker {
    #[allow(dead_code)]
    client: NatsClient,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl CrosstalkBroker {
    /// Connect to NATS and idempotently provision the stream.
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: NatsConfig) -> Result<Self, BrokerError> {
        info!("connecting to NATS");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connection {
                message: e.to_string(),
            })?;
        let jetstream = jetstream::new(client.clone());

        let broker = Self {
            client,
            jetstream,
            config,
        };
        broker.ensure_stream().await?;
        Ok(broker)
    }

    /// Idempotent stream bootstrap: update if it exists, create otherwise.
    async fn ensure_stream(&self) -> Result<(), BrokerError> {
        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: STREAM_SUBJECTS.iter().map(|s| (*s).to_string()).collect(),
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            num_replicas: 1,
            ..Default::default()
        };

        match self.jetstream.get_stream(&self.config.stream_name).await {
            Ok(_) => {
                debug!(stream = %self.config.stream_name, "stream exists, updating config");
                self.jetstream
                    .update_stream(stream_config)
                    .await
                    .map_err(|e| BrokerError::Connection {
                        message: format!("failed to update stream: {e}"),
                    })?;
            }
            Err(_) => {
                info!(stream = %self.config.stream_name, "creating stream");
                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .map_err(|e| BrokerError::Connection {
                        message: format!("failed to create stream: {e}"),
                    })?;
            }
        }
        Ok(())
    }
}

impl MessageBroker for CrosstalkBroker {
    type Consumer = NatsConsumer;

    #[instrument(skip(self, payload), fields(subject = %subject))]
    async fn publish(&self, subject: &str, msg_id: &str, payload: &[u8]) -> Result<u64, BrokerError> {
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);

        let ack_future = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.to_vec().into())
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;

        let ack = ack_future.await.map_err(|e| BrokerError::Publish {
            subject: subject.to_string(),
            message: e.to_string(),
        })?;

        debug!(subject = %subject, seq = ack.sequence, "published");
        Ok(ack.sequence)
    }

    #[instrument(skip(self), fields(stream = %stream, durable_name = %durable_name, filter_subject = %filter_subject))]
    async fn consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<Self::Consumer, BrokerError> {
        let js_stream =
            self.jetstream
                .get_stream(stream)
                .await
                .map_err(|e| BrokerError::ConsumerSetup {
                    stream: stream.to_string(),
                    durable_name: durable_name.to_string(),
                    message: e.to_string(),
                })?;

        let consumer_config = PullConsumerConfig {
            durable_name: Some(durable_name.to_string()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            filter_subject: filter_subject.to_string(),
            ack_wait: self.config.ack_wait,
            max_deliver: self.config.max_deliver,
            ..Default::default()
        };

        let consumer = js_stream
            .get_or_create_consumer(durable_name, consumer_config)
            .await
            .map_err(|e| BrokerError::ConsumerSetup {
                stream: stream.to_string(),
                durable_name: durable_name.to_string(),
                message: e.to_string(),
            })?;

        info!(stream = %stream, durable_name = %durable_name, "consumer bound");
        Ok(NatsConsumer { consumer })
    }
}

/// A bound pull consumer.
pub struct NatsConsumer {
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
}

impl MessageConsumer for NatsConsumer {
    type Delivery = NatsDelivery;

    async fn fetch(
        &self,
        batch_size: usize,
        expires: Duration,
    ) -> Result<Vec<Self::Delivery>, BrokerError> {
        use futures::StreamExt;

        let messages = self
            .consumer
            .fetch()
            .max_messages(batch_size)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| BrokerError::Fetch {
                message: e.to_string(),
            })?;

        let collected: Vec<_> = messages.take(batch_size).collect().await;
        let mut out = Vec::with_capacity(collected.len());
        for item in collected {
            match item {
                Ok(msg) => out.push(NatsDelivery { inner: msg }),
                Err(e) => warn!(error = %e, "dropped undeliverable message from fetch batch"),
            }
        }
        Ok(out)
    }
}

/// A single JetStream delivery awaiting ack/nak/term.
pub struct NatsDelivery {
    inner: jetstream::Message,
}

impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    async fn ack(self) -> Result<(), BrokerError> {
        self.inner.ack().await.map_err(|e| BrokerError::AckFailed {
            message: e.to_string(),
        })
    }

    async fn nak(self) -> Result<(), BrokerError> {
        self.inner
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::AckFailed {
                message: e.to_string(),
            })
    }

    async fn term(self) -> Result<(), BrokerError> {
        self.inner
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BrokerError::AckFailed {
                message: e.to_string(),
            })
    }
}
