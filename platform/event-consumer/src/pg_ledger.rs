use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::ledger::{IdempotencyLedger, LedgerError, MarkOutcome};

/// Postgres-backed ledger over the `processed_events` table
///
/// The primary key `(consumer_name, event_id)` makes concurrent inserts from
/// independent replicas safe: exactly one row results.
#[derive(Clone, Debug)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations for the ledger table
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./db/migrations").run(&self.pool).await
    }

    /// Delete entries for `scope` processed before `cutoff`
    ///
    /// Only safe for ids the broker can no longer redeliver (older than the
    /// stream's max age).
    pub async fn purge_before(&self, scope: &str, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE consumer_name = $1 AND processed_at < $2",
        )
        .bind(scope)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyLedger for PgLedger {
    async fn has_processed(&self, scope: &str, event_id: Uuid) -> Result<bool, LedgerError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE consumer_name = $1 AND event_id = $2)",
        )
        .bind(scope)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, scope: &str, event_id: Uuid) -> Result<MarkOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (consumer_name, event_id)
            VALUES ($1, $2)
            ON CONFLICT (consumer_name, event_id) DO NOTHING
            "#,
        )
        .bind(scope)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(MarkOutcome::AlreadyMarked)
        } else {
            Ok(MarkOutcome::Recorded)
        }
    }
}
