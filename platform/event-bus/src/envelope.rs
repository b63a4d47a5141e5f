//! # Event Envelope
//!
//! The unit exchanged on the bus between every producing and consuming service.
//!
//! ## Envelope Fields
//!
//! - `id`: Unique identifier for this occurrence (the idempotency key)
//! - `type`: Dot-delimited event kind, also the routing subject (e.g. `user.created`)
//! - `source`: Service that produced the event
//! - `occurred_at`: UTC timestamp set when the envelope is created
//! - `trace_id`: End-to-end workflow this event belongs to
//! - `correlation_id`: Business operation spanning several events
//! - `causation_id`: The event or request that directly caused this one
//! - `payload`: Event-specific data (generic type parameter)
//!
//! The JSON field names above are the wire contract between producer and
//! consumer processes and must not change.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::causal::{CausalContext, CausalIds};

/// Errors produced while encoding or decoding an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize envelope: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("invalid envelope: {0}")]
    Invalid(String),
}

impl EnvelopeError {
    /// Decoding failures never succeed on retry: the bytes are what they are.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeError::Deserialize(_) | EnvelopeError::Invalid(_))
    }
}

/// Standard event envelope
///
/// Fields are private: `id` is assigned exactly once at construction and a
/// redelivered or re-published envelope always carries the same value.
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct UserCreated {
///     id: String,
/// }
///
/// let envelope = EventEnvelope::create(
///     "user.created",
///     "auth",
///     UserCreated { id: "u1".to_string() },
///     None,
///     None,
///     None,
/// );
///
/// assert_eq!(envelope.trace_id(), envelope.correlation_id());
/// assert_eq!(envelope.correlation_id(), envelope.causation_id());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    id: Uuid,

    #[serde(rename = "type")]
    event_type: String,

    source: String,

    occurred_at: DateTime<Utc>,

    trace_id: String,

    correlation_id: String,

    causation_id: String,

    payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a fresh `id` and `occurred_at = now`
    ///
    /// Causal ids left empty are filled in: a missing correlation id is
    /// generated, and missing causation/trace ids fall back to the
    /// correlation id. Never fails.
    pub fn create(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: T,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        trace_id: Option<String>,
    ) -> Self {
        let ids = CausalIds::fill(trace_id, correlation_id, causation_id);
        Self::with_event_id(Uuid::new_v4(), event_type, source, payload, ids)
    }

    /// Create an envelope with an explicit id (replay tooling and tests)
    pub fn with_event_id(
        id: Uuid,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: T,
        ids: CausalIds,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            source: source.into(),
            occurred_at: Utc::now(),
            trace_id: ids.trace_id,
            correlation_id: ids.correlation_id,
            causation_id: ids.causation_id,
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> &str {
        &self.causation_id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Causal context to use while handling this envelope
    pub fn causal_context(&self) -> CausalContext {
        CausalContext::from_envelope(self)
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialize)
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode from JSON bytes
    ///
    /// # Errors
    ///
    /// `Deserialize` for malformed JSON, missing fields, or a payload that does
    /// not fit `T`; `Invalid` for an empty `type` or `source`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Deserialize)?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::Invalid("type cannot be empty".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(EnvelopeError::Invalid("source cannot be empty".to_string()));
        }
        Ok(())
    }
}
