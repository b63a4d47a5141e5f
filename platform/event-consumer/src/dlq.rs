//! Dead Letter Queue (DLQ) routing
//!
//! Messages that can never be decoded are parked on a dead-letter subject
//! once the broker has delivered them `max_attempts` times, instead of being
//! redelivered forever.

use chrono::{DateTime, Utc};
use event_bus::{BusError, BusMessage, EventBus};
use serde::{Deserialize, Serialize};

/// When and where undecodable messages are dead-lettered
#[derive(Debug, Clone)]
pub struct DeadLetterPolicy {
    /// Broker delivery attempt at which a malformed message is dead-lettered
    pub max_attempts: u64,
    /// Prefix prepended to the original subject
    pub subject_prefix: String,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            subject_prefix: "dlq".to_string(),
        }
    }
}

impl DeadLetterPolicy {
    pub fn exhausted(&self, attempt: u64) -> bool {
        attempt >= self.max_attempts.max(1)
    }

    /// e.g. `user.created` -> `dlq.user.created`
    pub fn subject_for(&self, subject: &str) -> String {
        format!("{}.{}", self.subject_prefix, subject)
    }
}

/// What gets written to the dead-letter subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub subject: String,
    pub durable_name: String,
    pub attempts: u64,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// Original bytes, base64 on the wire so undecodable input survives intact
    #[serde(with = "base64_bytes")]
    pub raw_payload: Vec<u8>,
}

impl DeadLetterRecord {
    pub fn new(message: &BusMessage, durable_name: &str, attempts: u64, error: &str) -> Self {
        Self {
            subject: message.subject.clone(),
            durable_name: durable_name.to_string(),
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
            raw_payload: message.payload.clone(),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Publish a dead-letter record for `message`
///
/// The caller acknowledges the original only if this succeeds.
pub async fn route_to_dlq(
    bus: &dyn EventBus,
    policy: &DeadLetterPolicy,
    message: &BusMessage,
    durable_name: &str,
    attempts: u64,
    error: &str,
) -> Result<(), BusError> {
    let record = DeadLetterRecord::new(message, durable_name, attempts, error);
    let bytes = serde_json::to_vec(&record).map_err(|e| BusError::PublishError(e.to_string()))?;
    let dlq_subject = policy.subject_for(&message.subject);

    bus.publish(&dlq_subject, bytes).await?;

    tracing::error!(
        subject = %message.subject,
        dlq_subject = %dlq_subject,
        durable_name = %durable_name,
        attempts,
        error = %error,
        "Event moved to DLQ after retries exhausted"
    );
    Ok(())
}
