//! Idempotency ledger
//!
//! The persisted record of which event ids a durable consumer has finished
//! handling. An entry is written only after the handler succeeds; a repeated
//! write for the same `(scope, event_id)` is a no-op, never an error.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Result of [`IdempotencyLedger::mark_processed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new entry was written
    Recorded,
    /// The entry already existed (concurrent or repeated mark)
    AlreadyMarked,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Storage behind the ledger
///
/// `scope` is the durable consumer name; each scope tracks its own entries.
/// Implementations must tolerate concurrent `mark_processed` calls for the same
/// id from independent processes (unique constraint, not read-then-write).
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn has_processed(&self, scope: &str, event_id: Uuid) -> Result<bool, LedgerError>;

    async fn mark_processed(&self, scope: &str, event_id: Uuid) -> Result<MarkOutcome, LedgerError>;
}

/// A ledger bound to one durable consumer name
#[derive(Clone)]
pub struct ScopedLedger {
    ledger: Arc<dyn IdempotencyLedger>,
    scope: String,
}

impl ScopedLedger {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>, scope: impl Into<String>) -> Self {
        Self {
            ledger,
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn has_processed(&self, event_id: Uuid) -> Result<bool, LedgerError> {
        self.ledger.has_processed(&self.scope, event_id).await
    }

    pub async fn mark_processed(&self, event_id: Uuid) -> Result<MarkOutcome, LedgerError> {
        self.ledger.mark_processed(&self.scope, event_id).await
    }
}

impl std::fmt::Debug for ScopedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLedger").field("scope", &self.scope).finish()
    }
}

/// In-process ledger for tests and local development
///
/// Not crash-durable.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    entries: Arc<DashMap<(String, Uuid), chrono::DateTime<chrono::Utc>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries recorded for `scope`
    pub fn len(&self, scope: &str) -> usize {
        self.entries.iter().filter(|e| e.key().0 == scope).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, scope: &str, event_id: Uuid) -> bool {
        self.entries.contains_key(&(scope.to_string(), event_id))
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn has_processed(&self, scope: &str, event_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self.contains(scope, event_id))
    }

    async fn mark_processed(&self, scope: &str, event_id: Uuid) -> Result<MarkOutcome, LedgerError> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry((scope.to_string(), event_id)) {
            Entry::Occupied(_) => Ok(MarkOutcome::AlreadyMarked),
            Entry::Vacant(slot) => {
                slot.insert(chrono::Utc::now());
                Ok(MarkOutcome::Recorded)
            }
        }
    }
}
