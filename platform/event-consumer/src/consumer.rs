//! Durable consumer and its per-message delivery state machine
//!
//! ```text
//! Received ─┬─ DeserializeFailed ─┬─ attempts left ────────────── Nak
//!           │                     └─ exhausted ─ DLQ publish ──── Ack
//!           └─ Deserialized ─┬─ AlreadyProcessed ─────────────── Ack
//!                            └─ ToHandle ─┬─ HandledOk ─ Mark ── Ack
//!                                         └─ HandlerFailed ───── Nak
//! ```
//!
//! A ledger read or write failure is answered with Nak so that a duplicate is
//! never acknowledged without a ledger entry behind it.

use dashmap::DashMap;
use event_bus::{
    BusMessage, CausalContext, Delivery, EventBus, EventEnvelope, PublishError,
};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::dlq::{route_to_dlq, DeadLetterPolicy};
use crate::ledger::{IdempotencyLedger, MarkOutcome, ScopedLedger};

/// Failure reported by an application handler
///
/// Every handler failure is treated the same way: the message is redelivered.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct HandlerError(#[from] anyhow::Error);

impl HandlerError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(anyhow::Error::new(error))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

impl From<PublishError> for HandlerError {
    fn from(error: PublishError) -> Self {
        Self::new(error)
    }
}

/// Boxed future returned by a registered handler
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type HandlerFn<T> = dyn Fn(CausalContext, EventEnvelope<T>) -> HandlerFuture + Send + Sync;

/// Errors that end [`Consumer::start`]
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to bind durable subscription: {0}")]
    Subscribe(#[source] event_bus::BusError),

    #[error("subscription stream closed by the broker")]
    Closed,
}

/// Terminal state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded and the ledger recorded the event
    Handled,
    /// Ledger already held the event id; handler not invoked
    Duplicate,
    /// Handler returned an error or panicked
    HandlerFailed,
    /// Ledger could not be read or written
    LedgerUnavailable,
    /// Bytes did not decode into an envelope; attempts remain
    Malformed,
    /// Undecodable message parked on the dead-letter subject
    DeadLettered,
}

impl Disposition {
    /// Whether this outcome acks the message (otherwise it is nak'd)
    pub fn acknowledges(self) -> bool {
        matches!(
            self,
            Disposition::Handled | Disposition::Duplicate | Disposition::DeadLettered
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries processed concurrently
    pub max_in_flight: usize,
    pub dead_letter: DeadLetterPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            dead_letter: DeadLetterPolicy::default(),
        }
    }
}

struct Dispatch<T> {
    bus: Arc<dyn EventBus>,
    subject: String,
    ledger: ScopedLedger,
    handler: Box<HandlerFn<T>>,
    /// One lock per event id currently being handled in this process
    in_flight: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<T> Dispatch<T> {
    fn claim(&self, event_id: Uuid) -> Arc<Mutex<()>> {
        self.in_flight.entry(event_id).or_default().clone()
    }

    /// Drop the slot once no other delivery of the same id is waiting on it
    fn release(&self, event_id: Uuid) {
        self.in_flight
            .remove_if(&event_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// A durable subscription dispatching typed envelopes to one handler
///
/// Cloning is cheap and clones share the subscription state; `stop` on any
/// clone stops `start` on all of them. A stopped consumer cannot be restarted;
/// bind a new one with the same durable name to resume.
pub struct Consumer<T> {
    inner: Arc<Dispatch<T>>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> Consumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Register durable interest in `subject`
    ///
    /// `durable_name` names both the broker-side cursor and the ledger scope.
    pub fn bind<F, Fut>(
        bus: Arc<dyn EventBus>,
        subject: impl Into<String>,
        durable_name: impl Into<String>,
        ledger: Arc<dyn IdempotencyLedger>,
        handler: F,
    ) -> Self
    where
        F: Fn(CausalContext, EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Box<HandlerFn<T>> = Box::new(move |ctx, envelope| handler(ctx, envelope).boxed());

        Self {
            inner: Arc::new(Dispatch {
                bus,
                subject: subject.into(),
                ledger: ScopedLedger::new(ledger, durable_name),
                handler,
                in_flight: DashMap::new(),
            }),
            config: ConsumerConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn durable_name(&self) -> &str {
        self.inner.ledger.scope()
    }

    /// Stop taking new deliveries; in-flight handlers still run to completion
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the durable subscription and deliver until stopped
    ///
    /// Returns `Ok(())` after `stop`, once every in-flight delivery has been
    /// settled. Fails if the subscription cannot be bound (e.g. no stream
    /// covers the subject) or the broker ends it.
    pub async fn start(&self) -> Result<(), SubscribeError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let mut stream = self
            .inner
            .bus
            .subscribe(self.subject(), self.durable_name())
            .await
            .map_err(SubscribeError::Subscribe)?;

        tracing::info!(
            subject = %self.subject(),
            durable_name = %self.durable_name(),
            max_in_flight = self.config.max_in_flight,
            "Consumer started"
        );

        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let consumer = self.clone();
                    tracker.spawn(async move {
                        consumer.process_delivery(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        subject = %self.subject(),
                        durable_name = %self.durable_name(),
                        error = %e,
                        "Transient subscription error"
                    );
                }
                None => break Err(SubscribeError::Closed),
            }
        };

        tracker.close();
        tracker.wait().await;

        match &result {
            Ok(()) => tracing::info!(durable_name = %self.durable_name(), "Consumer stopped"),
            Err(e) => tracing::error!(durable_name = %self.durable_name(), error = %e, "Consumer subscription lost"),
        }
        result
    }

    /// Run one delivery through the state machine and settle it with the broker
    pub async fn process_delivery(&self, delivery: Delivery) -> Disposition {
        let span = tracing::info_span!(
            "process_event",
            subject = %delivery.subject(),
            durable_name = %self.durable_name(),
            attempt = delivery.attempt,
            event_id = tracing::field::Empty,
        );

        async {
            let disposition = self.decide(&delivery.message, delivery.attempt).await;
            settle(delivery, disposition).await;
            disposition
        }
        .instrument(span)
        .await
    }

    async fn decide(&self, message: &BusMessage, attempt: u64) -> Disposition {
        let envelope = match EventEnvelope::<T>::from_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject_malformed(message, attempt, &e.to_string()).await,
        };

        let event_id = envelope.id();
        tracing::Span::current().record("event_id", tracing::field::display(event_id));

        let slot = self.inner.claim(event_id);
        let guard = slot.clone().lock_owned().await;
        drop(slot);

        let disposition = self.handle(envelope).await;

        drop(guard);
        self.inner.release(event_id);
        disposition
    }

    async fn reject_malformed(&self, message: &BusMessage, attempt: u64, error: &str) -> Disposition {
        let policy = &self.config.dead_letter;
        if !policy.exhausted(attempt) {
            tracing::warn!(
                error = %error,
                max_attempts = policy.max_attempts,
                "Failed to deserialize envelope; requesting redelivery"
            );
            return Disposition::Malformed;
        }

        match route_to_dlq(
            self.inner.bus.as_ref(),
            policy,
            message,
            self.durable_name(),
            attempt,
            error,
        )
        .await
        {
            Ok(()) => Disposition::DeadLettered,
            Err(dlq_err) => {
                tracing::error!(
                    error = %error,
                    dlq_error = %dlq_err,
                    "Failed to write to DLQ; requesting redelivery"
                );
                Disposition::Malformed
            }
        }
    }

    async fn handle(&self, envelope: EventEnvelope<T>) -> Disposition {
        let event_id = envelope.id();
        let ledger = &self.inner.ledger;

        match ledger.has_processed(event_id).await {
            Ok(true) => {
                tracing::info!("Duplicate event ignored (already processed)");
                return Disposition::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "Ledger check failed; requesting redelivery");
                return Disposition::LedgerUnavailable;
            }
        }

        let ctx = CausalContext::from_envelope(&envelope);
        let span = ctx.span();
        let outcome = AssertUnwindSafe((self.inner.handler)(ctx, envelope))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Handler failed; requesting redelivery");
                return Disposition::HandlerFailed;
            }
            Err(_) => {
                tracing::error!("Handler panicked; requesting redelivery");
                return Disposition::HandlerFailed;
            }
        }

        match ledger.mark_processed(event_id).await {
            Ok(MarkOutcome::Recorded) => {
                tracing::info!("Event handled");
                Disposition::Handled
            }
            Ok(MarkOutcome::AlreadyMarked) => {
                tracing::info!("Event handled; ledger entry already present");
                Disposition::Handled
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Handled event could not be recorded; requesting redelivery"
                );
                Disposition::LedgerUnavailable
            }
        }
    }
}

async fn settle(delivery: Delivery, disposition: Disposition) {
    let result = if disposition.acknowledges() {
        delivery.ack().await
    } else {
        delivery.nak().await
    };

    if let Err(e) = result {
        tracing::warn!(
            disposition = ?disposition,
            error = %e,
            "Failed to settle delivery; broker will redeliver"
        );
    }
}
