//! # EventBus Abstraction
//!
//! Durable publish/subscribe for typed domain events with causal metadata.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Single-process durable log for tests and local development
//!
//! Both honour the same contract: `publish` is one append to the log,
//! `subscribe` is a durable explicit-ack subscription whose cursor is keyed by
//! the durable name, and every [`Delivery`] must be settled with `ack` or `nak`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{CausalContext, EventBus, NatsBus, Publisher, StreamSpec};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn EventBus> = Arc::new(NatsBus::new(nats_client));
//! bus.ensure_stream(&StreamSpec::new("USER_EVENTS", ["user.>"])).await?;
//!
//! let publisher = Publisher::new(bus.clone(), "auth");
//! let ctx = CausalContext::root();
//! publisher
//!     .publish(Some(&ctx), "user.created", serde_json::json!({ "id": "u1" }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod causal;
pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod publisher;

pub use causal::{CausalContext, CausalIds};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use publisher::{PublishError, Publisher};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

use consumer_retry::{retry_with_backoff, RetryConfig};

/// A message as stored on the log
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }
}

/// Broker-side settlement of a single delivery
#[async_trait]
pub trait Settle: Send + Sync {
    /// Mark the message done; the broker will not redeliver it
    async fn ack(&self) -> BusResult<()>;

    /// Reject the message; the broker redelivers it
    async fn nak(&self) -> BusResult<()>;
}

/// One delivery of a message to a durable subscription
///
/// `ack` and `nak` consume the delivery, so each delivery is settled at most
/// once. A delivery dropped unsettled is redelivered by the broker.
pub struct Delivery {
    pub message: BusMessage,
    /// Broker delivery counter for this message, starting at 1
    pub attempt: u64,
    settle: Box<dyn Settle>,
}

impl Delivery {
    pub fn new(message: BusMessage, attempt: u64, settle: impl Settle + 'static) -> Self {
        Self {
            message,
            attempt,
            settle: Box::new(settle),
        }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub async fn ack(self) -> BusResult<()> {
        self.settle.ack().await
    }

    pub async fn nak(self) -> BusResult<()> {
        self.settle.nak().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("payload_len", &self.message.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A named stream covering a set of subject patterns
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
}

impl StreamSpec {
    /// Stream with the default retention of 14 days
    pub fn new<S: Into<String>>(name: impl Into<String>, subjects: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            max_age: Duration::from_secs(60 * 60 * 24 * 14),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to settle message: {0}")]
    AckError(String),

    #[error("stream provisioning failed: {0}")]
    ProvisionError(String),

    #[error("bus closed")]
    Closed,
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Durable log abstraction
///
/// Implemented by [`NatsBus`] for production and [`InMemoryBus`] for tests.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append a message to the log under `subject`
    ///
    /// Resolves once the broker has acknowledged the append. Performs no retry.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Bind a durable, explicit-ack subscription
    ///
    /// # Arguments
    /// * `subject` - Subject or pattern (`*` matches one token, `>` the rest)
    /// * `durable_name` - Cursor identity; rebinding resumes where it left off
    ///
    /// Fails when no stream covers `subject`. Items of the returned stream are
    /// errors only for transient per-pull failures; the stream ending means the
    /// subscription is gone.
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusResult<Delivery>>>;

    /// Create the stream if it does not exist yet
    async fn ensure_stream(&self, spec: &StreamSpec) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Ensure every stream exists, retrying transient broker failures
pub async fn provision(bus: &dyn EventBus, specs: &[StreamSpec], retry: &RetryConfig) -> BusResult<()> {
    for spec in specs {
        retry_with_backoff(|| bus.ensure_stream(spec), retry, "ensure_stream").await?;
        tracing::info!(stream = %spec.name, subjects = ?spec.subjects, "Stream ready");
    }
    Ok(())
}

/// Check if a subject matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
///
/// # Examples
/// - `auth.events.>` matches `auth.events.user.created`
/// - `auth.*.created` matches `auth.user.created`
/// - `auth.events.*` does NOT match `auth.events.user.created` (too many tokens)
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}
