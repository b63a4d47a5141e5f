//! Causal context propagation
//!
//! A [`CausalContext`] is threaded explicitly through handler and publish call
//! signatures. When a handler processing event `E` publishes `E'`:
//!
//! ```text
//! E'.trace_id       = E.trace_id
//! E'.correlation_id = E.correlation_id
//! E'.causation_id   = E.id
//! ```
//!
//! A publish with no ambient context starts a new chain where all three ids
//! are one freshly generated value.

use uuid::Uuid;

use crate::EventEnvelope;

/// The trace/correlation/causation triple stamped onto an outgoing envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalIds {
    pub trace_id: String,
    pub correlation_id: String,
    pub causation_id: String,
}

impl CausalIds {
    /// A new root chain: one fresh id used for all three
    pub fn root() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            trace_id: id.clone(),
            correlation_id: id.clone(),
            causation_id: id,
        }
    }

    /// Fill absent or empty ids from the correlation id, generating it if needed
    pub(crate) fn fill(
        trace_id: Option<String>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Self {
        let correlation_id =
            non_empty(correlation_id).unwrap_or_else(|| Uuid::new_v4().to_string());
        let causation_id = non_empty(causation_id).unwrap_or_else(|| correlation_id.clone());
        let trace_id = non_empty(trace_id).unwrap_or_else(|| correlation_id.clone());

        Self {
            trace_id,
            correlation_id,
            causation_id,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// In-process carrier of causal ids
///
/// Built from an inbound envelope by the consumer, or at the edge of the
/// system (e.g. an HTTP handler) via [`CausalContext::root`] or
/// [`CausalContext::from_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalContext {
    trace_id: String,
    correlation_id: String,
    causation_id: String,
    /// Id of the event currently being handled, if any
    event_id: Option<Uuid>,
}

impl CausalContext {
    /// Fresh context for a call site with no inbound event
    pub fn root() -> Self {
        let ids = CausalIds::root();
        Self {
            trace_id: ids.trace_id,
            correlation_id: ids.correlation_id,
            causation_id: ids.causation_id,
            event_id: None,
        }
    }

    /// Context from ids the caller already holds, e.g. an inbound request id
    ///
    /// Empty values are filled the same way as [`EventEnvelope::create`].
    pub fn from_ids(
        trace_id: impl Into<String>,
        correlation_id: impl Into<String>,
        causation_id: impl Into<String>,
    ) -> Self {
        let ids = CausalIds::fill(
            Some(trace_id.into()),
            Some(correlation_id.into()),
            Some(causation_id.into()),
        );
        Self {
            trace_id: ids.trace_id,
            correlation_id: ids.correlation_id,
            causation_id: ids.causation_id,
            event_id: None,
        }
    }

    /// Context for handling `envelope`
    pub fn from_envelope<T>(envelope: &EventEnvelope<T>) -> Self {
        Self {
            trace_id: envelope.trace_id().to_string(),
            correlation_id: envelope.correlation_id().to_string(),
            causation_id: envelope.causation_id().to_string(),
            event_id: Some(envelope.id()),
        }
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

    /// Id of the in-progress event when this context came from an envelope
    pub fn event_id(&self) -> Option<Uuid> {
        self.event_id
    }

    /// Ids to stamp on an envelope published under `ctx`
    ///
    /// `None` is a root publish. Otherwise trace and correlation are inherited
    /// and causation points at the most direct cause: the in-progress event if
    /// there is one, else the context's own causation id.
    pub fn derive_for_publish(ctx: Option<&CausalContext>) -> CausalIds {
        match ctx {
            None => CausalIds::root(),
            Some(ctx) => CausalIds {
                trace_id: ctx.trace_id.clone(),
                correlation_id: ctx.correlation_id.clone(),
                causation_id: ctx
                    .event_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| ctx.causation_id.clone()),
            },
        }
    }

    /// Span carrying the causal ids for log correlation
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "causal",
            trace_id = %self.trace_id,
            correlation_id = %self.correlation_id,
            causation_id = %self.causation_id,
        )
    }
}

impl Default for CausalContext {
    fn default() -> Self {
        Self::root()
    }
}
