//! Publisher: stamp causal metadata onto an envelope and append it to the log

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{BusError, CausalContext, EnvelopeError, EventBus, EventEnvelope};

/// Errors returned by [`Publisher::publish`]
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Payload could not be encoded; retrying will not help
    #[error(transparent)]
    Serialization(#[from] EnvelopeError),

    /// Broker rejected or never acknowledged the append; the caller decides whether to retry
    #[error(transparent)]
    Transport(#[from] BusError),
}

/// Emits envelopes on behalf of one source service
///
/// The event type is used as the routing subject. Each successful call is
/// exactly one append; there is no buffering and no implicit retry.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    source: String,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build an envelope under `ctx` and publish it
    ///
    /// `ctx` is `None` at the root of a causal chain. Returns the new event id.
    pub async fn publish<T: Serialize>(
        &self,
        ctx: Option<&CausalContext>,
        event_type: &str,
        payload: T,
    ) -> Result<Uuid, PublishError> {
        let envelope = self.envelope(ctx, event_type, payload);
        self.publish_envelope(&envelope).await?;
        Ok(envelope.id())
    }

    /// Build the envelope `publish` would emit, without emitting it
    ///
    /// Callers that want to retry on transport errors keep this envelope and
    /// hand it to [`Publisher::publish_envelope`] again, so the id is reused.
    pub fn envelope<T>(&self, ctx: Option<&CausalContext>, event_type: &str, payload: T) -> EventEnvelope<T> {
        let ids = CausalContext::derive_for_publish(ctx);
        EventEnvelope::with_event_id(Uuid::new_v4(), event_type, self.source.clone(), payload, ids)
    }

    /// Publish an already-built envelope unchanged
    pub async fn publish_envelope<T: Serialize>(&self, envelope: &EventEnvelope<T>) -> Result<(), PublishError> {
        let bytes = envelope.to_bytes()?;
        self.bus.publish(envelope.event_type(), bytes).await?;

        tracing::debug!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            trace_id = %envelope.trace_id(),
            correlation_id = %envelope.correlation_id(),
            causation_id = %envelope.causation_id(),
            "Event published"
        );
        Ok(())
    }

    /// Publish where failure must not fail the triggering operation
    ///
    /// Errors are logged as warnings and swallowed.
    pub async fn publish_best_effort<T: Serialize>(
        &self,
        ctx: Option<&CausalContext>,
        event_type: &str,
        payload: T,
    ) -> Option<Uuid> {
        match self.publish(ctx, event_type, payload).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    event_type = %event_type,
                    source = %self.source,
                    error = %e,
                    "Event publication failed; continuing"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("source", &self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBus, StreamSpec};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserCreated {
        id: String,
    }

    async fn setup() -> (InMemoryBus, Publisher) {
        let bus = InMemoryBus::new();
        bus.ensure_stream(&StreamSpec::new("USER_EVENTS", ["user.>"]))
            .await
            .unwrap();
        let publisher = Publisher::new(Arc::new(bus.clone()), "auth");
        (bus, publisher)
    }

    fn only_envelope(bus: &InMemoryBus) -> EventEnvelope<UserCreated> {
        let messages = bus.messages("user.>");
        assert_eq!(messages.len(), 1, "exactly one append per publish");
        EventEnvelope::from_bytes(&messages[0].payload).unwrap()
    }

    #[tokio::test]
    async fn test_root_publish_has_single_causal_id() {
        let (bus, publisher) = setup().await;

        let id = publisher
            .publish(None, "user.created", UserCreated { id: "u1".to_string() })
            .await
            .unwrap();

        let envelope = only_envelope(&bus);
        assert_eq!(envelope.id(), id);
        assert_eq!(envelope.event_type(), "user.created");
        assert_eq!(publisher.source(), "auth");
        assert_eq!(envelope.source(), publisher.source());
        assert_eq!(envelope.payload().id, "u1");
        assert_eq!(envelope.trace_id(), envelope.correlation_id());
        assert_eq!(envelope.correlation_id(), envelope.causation_id());
        assert_eq!(bus.messages("user.created").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_inside_handler_inherits_trace_and_points_at_cause() {
        let (bus, publisher) = setup().await;
        let inbound = EventEnvelope::create(
            "user.registered",
            "gateway",
            json!({}),
            Some("corr-1".to_string()),
            None,
            Some("trace-1".to_string()),
        );
        let ctx = inbound.causal_context();

        publisher
            .publish(Some(&ctx), "user.created", UserCreated { id: "u1".to_string() })
            .await
            .unwrap();

        let envelope = only_envelope(&bus);
        assert_eq!(envelope.trace_id(), "trace-1");
        assert_eq!(envelope.correlation_id(), "corr-1");
        assert_eq!(envelope.causation_id(), inbound.id().to_string());
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let (bus, publisher) = setup().await;
        bus.set_unavailable(true);

        let err = publisher
            .publish(None, "user.created", UserCreated { id: "u1".to_string() })
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Transport(_)));
    }

    #[tokio::test]
    async fn test_retrying_an_envelope_reuses_its_id() {
        let (bus, publisher) = setup().await;
        let envelope = publisher.envelope(None, "user.created", UserCreated { id: "u1".to_string() });

        bus.set_unavailable(true);
        assert!(publisher.publish_envelope(&envelope).await.is_err());

        bus.set_unavailable(false);
        publisher.publish_envelope(&envelope).await.unwrap();

        assert_eq!(only_envelope(&bus).id(), envelope.id());
    }

    #[tokio::test]
    async fn test_serialization_error_is_not_transport() {
        use std::collections::HashMap;

        let (bus, publisher) = setup().await;
        let mut payload = HashMap::new();
        payload.insert((1, 2), "not a JSON object key");

        let err = publisher.publish(None, "user.created", payload).await.unwrap_err();

        assert!(matches!(err, PublishError::Serialization(_)));
        assert!(bus.messages("user.>").is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failure() {
        let (bus, publisher) = setup().await;
        bus.set_unavailable(true);

        let id = publisher
            .publish_best_effort(None, "user.created", UserCreated { id: "u1".to_string() })
            .await;

        assert!(id.is_none());
    }
}
