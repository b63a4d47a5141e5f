//! NATS JetStream implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, Delivery, EventBus, Settle, StreamSpec};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

/// EventBus implementation using NATS JetStream
///
/// Publishes wait for the JetStream publish ack, so a successful `publish` is
/// exactly one append to the stream. Subscriptions are durable pull consumers
/// with explicit acknowledgement; the durable name is the consumer name.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus, StreamSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.ensure_stream(&StreamSpec::new("USER_EVENTS", ["user.>"])).await?;
/// bus.publish("user.created", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        Self {
            jetstream: jetstream::new(client),
        }
    }

    /// Connect to a NATS server and wrap the client
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        Ok(Self::new(client))
    }
}

/// Settlement handle for a JetStream message
struct JetStreamSettle(jetstream::Message);

#[async_trait]
impl Settle for JetStreamSettle {
    async fn ack(&self) -> BusResult<()> {
        self.0.ack().await.map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nak(&self) -> BusResult<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let attempt = message
        .info()
        .map(|info| info.delivered.max(1) as u64)
        .unwrap_or(1);
    let bus_message = BusMessage::new(message.subject.to_string(), message.payload.to_vec());
    Delivery::new(bus_message, attempt, JetStreamSettle(message))
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        ack.await.map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        let stream_name = self
            .jetstream
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(format!("no stream for {subject}: {e}")))?;

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        tracing::info!(
            stream = %stream_name,
            subject = %subject,
            durable_name = %durable_name,
            "Bound durable JetStream consumer"
        );

        let deliveries = messages.map(|item| {
            item.map(into_delivery)
                .map_err(|e| BusError::SubscribeError(e.to_string()))
        });

        Ok(deliveries.boxed())
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> BusResult<()> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                max_age: spec.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::ProvisionError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // These tests require a running NATS server with JetStream enabled
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_durable_round_trip() {
        let bus = NatsBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        bus.ensure_stream(&StreamSpec::new("TEST_NATS_BUS", ["test.nats.>"]))
            .await
            .unwrap();

        let mut stream = bus
            .subscribe("test.nats.>", "test-nats-bus-reader")
            .await
            .unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("delivery error");

        assert_eq!(delivery.subject(), "test.nats.hello");
        assert_eq!(delivery.payload(), payload.as_slice());
        assert!(delivery.attempt >= 1);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_subscribe_without_stream_fails() {
        let bus = NatsBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let result = bus.subscribe("no.stream.covers.this", "orphan").await;
        assert!(matches!(result, Err(BusError::SubscribeError(_))));
    }
}
