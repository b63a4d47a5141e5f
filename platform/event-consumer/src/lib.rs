//! # Event Consumer
//!
//! Turns the at-least-once deliveries of a durable [`event_bus::EventBus`]
//! subscription into effectively-once handler invocations.
//!
//! Each delivery is decoded, checked against the [`IdempotencyLedger`] for the
//! consumer's durable name, handed to the registered handler with a
//! [`event_bus::CausalContext`], and then acknowledged or rejected according
//! to the outcome. See [`consumer`] for the state machine.
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus, StreamSpec};
//! use event_consumer::{Consumer, HandlerError, InMemoryLedger};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new();
//! bus.ensure_stream(&StreamSpec::new("USER_EVENTS", ["user.>"])).await?;
//!
//! let consumer = Consumer::<serde_json::Value>::bind(
//!     Arc::new(bus),
//!     "user.created",
//!     "welcome-mailer",
//!     Arc::new(InMemoryLedger::new()),
//!     |ctx, envelope| async move {
//!         tracing::info!(trace_id = %ctx.trace_id(), event_id = %envelope.id(), "welcome");
//!         Ok::<_, HandlerError>(())
//!     },
//! );
//! consumer.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod db;
pub mod dlq;
pub mod ledger;
mod pg_ledger;

pub use consumer::{
    Consumer, ConsumerConfig, Disposition, HandlerError, HandlerFuture, SubscribeError,
};
pub use dlq::{DeadLetterPolicy, DeadLetterRecord};
pub use ledger::{IdempotencyLedger, InMemoryLedger, LedgerError, MarkOutcome, ScopedLedger};
pub use pg_ledger::PgLedger;
