//! In-memory implementation of the EventBus trait for testing and development

use crate::{subject_matches, BusError, BusMessage, BusResult, Delivery, EventBus, Settle, StreamSpec};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// EventBus implementation backed by an in-process append-only log
///
/// Behaves like a durable log with explicit acknowledgement:
/// - each durable name has its own cursor into the log
/// - a nak'd delivery is queued for redelivery with an incremented attempt
/// - several bindings of one durable name share its cursor, so each message
///   goes to one of them
/// - when a binding's stream is dropped, whatever it left unsettled is
///   redelivered to the remaining (or next) binding
///
/// Counters for acks and naks per durable name are exposed for assertions.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus, StreamSpec};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.ensure_stream(&StreamSpec::new("TEST", ["test.>"])).await?;
///
/// let mut stream = bus.subscribe("test.events.>", "reader").await?;
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let delivery = stream.next().await.unwrap()?;
/// assert_eq!(delivery.payload(), b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<LogState>>,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct LogState {
    streams: Vec<StreamSpec>,
    log: Vec<BusMessage>,
    durables: HashMap<String, DurableCursor>,
    next_binding: u64,
    unavailable: bool,
    closed: bool,
}

struct DurableCursor {
    filter: String,
    /// Next log index to examine
    next: usize,
    redeliver: VecDeque<usize>,
    attempts: HashMap<usize, u64>,
    /// Delivered but unsettled log index -> binding holding it
    outstanding: HashMap<usize, u64>,
    acked: usize,
    nacked: usize,
}

impl DurableCursor {
    fn new(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            next: 0,
            redeliver: VecDeque::new(),
            attempts: HashMap::new(),
            outstanding: HashMap::new(),
            acked: 0,
            nacked: 0,
        }
    }
}

enum Pull {
    Ready(Delivery),
    Empty,
    Closed,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        lock_state(&self.state)
    }

    /// Make every publish fail as if the broker were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// End every subscription stream; later subscribes fail
    pub fn close(&self) {
        self.lock().closed = true;
        self.wake.notify_waiters();
    }

    /// All messages appended under subjects matching `pattern`, in log order
    pub fn messages(&self, pattern: &str) -> Vec<BusMessage> {
        self.lock()
            .log
            .iter()
            .filter(|m| subject_matches(&m.subject, pattern))
            .cloned()
            .collect()
    }

    /// Number of acks received for a durable name
    pub fn acked(&self, durable_name: &str) -> usize {
        self.lock().durables.get(durable_name).map_or(0, |c| c.acked)
    }

    /// Number of naks received for a durable name
    pub fn nacked(&self, durable_name: &str) -> usize {
        self.lock().durables.get(durable_name).map_or(0, |c| c.nacked)
    }

    /// Messages delivered but not yet settled, plus those queued for redelivery
    pub fn pending(&self, durable_name: &str) -> usize {
        self.lock()
            .durables
            .get(durable_name)
            .map_or(0, |c| c.outstanding.len() + c.redeliver.len())
    }

    fn covered(streams: &[StreamSpec], subject: &str) -> bool {
        streams
            .iter()
            .any(|s| s.subjects.iter().any(|pattern| subject_matches(subject, pattern)))
    }

    fn pull(state: &Arc<Mutex<LogState>>, wake: &Arc<Notify>, durable_name: &str, binding: u64) -> Pull {
        let mut guard = lock_state(state);
        if guard.closed {
            return Pull::Closed;
        }

        let LogState { log, durables, .. } = &mut *guard;
        let Some(cursor) = durables.get_mut(durable_name) else {
            return Pull::Closed;
        };

        let index = match cursor.redeliver.pop_front() {
            Some(index) => index,
            None => {
                let found = log[cursor.next..]
                    .iter()
                    .position(|m| subject_matches(&m.subject, &cursor.filter))
                    .map(|offset| cursor.next + offset);
                match found {
                    Some(index) => {
                        cursor.next = index + 1;
                        index
                    }
                    None => {
                        cursor.next = log.len();
                        return Pull::Empty;
                    }
                }
            }
        };

        let attempt = cursor.attempts.entry(index).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        cursor.outstanding.insert(index, binding);

        let settle = InMemorySettle {
            state: state.clone(),
            wake: wake.clone(),
            durable_name: durable_name.to_string(),
            binding,
            index,
        };
        Pull::Ready(Delivery::new(log[index].clone(), attempt, settle))
    }
}

fn lock_state(state: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settlement handle pointing back into the log
struct InMemorySettle {
    state: Arc<Mutex<LogState>>,
    wake: Arc<Notify>,
    durable_name: String,
    binding: u64,
    index: usize,
}

/// Lives inside a subscription stream; dropping the stream hands the
/// binding's unsettled deliveries back for redelivery
struct Binding {
    state: Arc<Mutex<LogState>>,
    wake: Arc<Notify>,
    durable_name: String,
    id: u64,
}

impl Drop for Binding {
    fn drop(&mut self) {
        {
            let mut guard = lock_state(&self.state);
            let Some(cursor) = guard.durables.get_mut(&self.durable_name) else {
                return;
            };

            let mut abandoned: Vec<usize> = cursor
                .outstanding
                .iter()
                .filter(|(_, binding)| **binding == self.id)
                .map(|(index, _)| *index)
                .collect();
            if abandoned.is_empty() {
                return;
            }
            abandoned.sort_unstable();
            for index in &abandoned {
                cursor.outstanding.remove(index);
            }
            cursor.redeliver.extend(abandoned);
        }
        self.wake.notify_waiters();
    }
}

impl InMemorySettle {
    fn settle(&self, requeue: bool) -> BusResult<()> {
        let mut guard = lock_state(&self.state);
        if guard.closed {
            return Err(BusError::Closed);
        }
        let cursor = guard
            .durables
            .get_mut(&self.durable_name)
            .ok_or_else(|| BusError::AckError(format!("unknown durable {}", self.durable_name)))?;

        if cursor.outstanding.get(&self.index) != Some(&self.binding) {
            return Err(BusError::AckError("message already settled".to_string()));
        }
        cursor.outstanding.remove(&self.index);

        if requeue {
            cursor.nacked += 1;
            cursor.redeliver.push_back(self.index);
            drop(guard);
            self.wake.notify_waiters();
        } else {
            cursor.acked += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Settle for InMemorySettle {
    async fn ack(&self) -> BusResult<()> {
        self.settle(false)
    }

    async fn nak(&self) -> BusResult<()> {
        self.settle(true)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(BusError::PublishError("broker unavailable".to_string()));
            }
            if state.closed {
                return Err(BusError::Closed);
            }
            if !Self::covered(&state.streams, subject) {
                return Err(BusError::PublishError(format!("no stream covers subject {subject}")));
            }
            state.log.push(BusMessage::new(subject, payload));
        }

        self.wake.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        let binding = {
            let mut state = self.lock();
            if state.closed {
                return Err(BusError::Closed);
            }
            if !Self::covered(&state.streams, subject) {
                return Err(BusError::SubscribeError(format!("no stream covers subject {subject}")));
            }

            let cursor = state
                .durables
                .entry(durable_name.to_string())
                .or_insert_with(|| DurableCursor::new(subject));
            if cursor.filter != subject {
                return Err(BusError::SubscribeError(format!(
                    "durable {durable_name} is bound to {}, not {subject}",
                    cursor.filter
                )));
            }

            state.next_binding += 1;
            Binding {
                state: self.state.clone(),
                wake: self.wake.clone(),
                durable_name: durable_name.to_string(),
                id: state.next_binding,
            }
        };

        let state = self.state.clone();
        let wake = self.wake.clone();
        let durable_name = durable_name.to_string();

        let stream = async_stream::stream! {
            let binding = binding;
            loop {
                let notified = wake.notified();
                let mut notified = std::pin::pin!(notified);
                notified.as_mut().enable();

                match Self::pull(&state, &wake, &durable_name, binding.id) {
                    Pull::Ready(delivery) => yield Ok(delivery),
                    Pull::Empty => notified.await,
                    Pull::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> BusResult<()> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(BusError::ProvisionError("broker unavailable".to_string()));
        }
        if !state.streams.iter().any(|s| s.name == spec.name) {
            state.streams.push(spec.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bus_with_stream() -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.ensure_stream(&StreamSpec::new("TEST", ["test.>"])).await.unwrap();
        bus
    }

    async fn next(stream: &mut BoxStream<'static, BusResult<Delivery>>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("delivery error")
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = bus_with_stream().await;
        let mut stream = bus.subscribe("test.events.>", "reader").await.unwrap();

        bus.publish("test.events.user.created", b"test message".to_vec())
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.subject(), "test.events.user.created");
        assert_eq!(delivery.payload(), b"test message");
        assert_eq!(delivery.attempt, 1);
        delivery.ack().await.unwrap();

        assert_eq!(bus.acked("reader"), 1);
        assert_eq!(bus.pending("reader"), 0);
    }

    #[tokio::test]
    async fn test_messages_published_before_subscribe_are_delivered() {
        let bus = bus_with_stream().await;
        for i in 0..3 {
            bus.publish(&format!("test.msg.{i}"), format!("message {i}").into_bytes())
                .await
                .unwrap();
        }

        let mut stream = bus.subscribe("test.>", "late").await.unwrap();
        for i in 0..3 {
            let delivery = next(&mut stream).await;
            assert_eq!(delivery.subject(), format!("test.msg.{i}"));
            delivery.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_next_attempt() {
        let bus = bus_with_stream().await;
        let mut stream = bus.subscribe("test.>", "retrying").await.unwrap();
        bus.publish("test.msg", b"x".to_vec()).await.unwrap();

        let first = next(&mut stream).await;
        assert_eq!(first.attempt, 1);
        first.nak().await.unwrap();

        let second = next(&mut stream).await;
        assert_eq!(second.attempt, 2);
        assert_eq!(second.payload(), b"x");
        second.ack().await.unwrap();

        assert_eq!(bus.nacked("retrying"), 1);
        assert_eq!(bus.acked("retrying"), 1);
    }

    #[tokio::test]
    async fn test_durable_resumes_and_redelivers_unsettled() {
        let bus = bus_with_stream().await;
        bus.publish("test.a", b"a".to_vec()).await.unwrap();
        bus.publish("test.b", b"b".to_vec()).await.unwrap();

        {
            let mut stream = bus.subscribe("test.>", "resumable").await.unwrap();
            next(&mut stream).await.ack().await.unwrap();
            let unsettled = next(&mut stream).await;
            assert_eq!(unsettled.subject(), "test.b");
            drop(unsettled);
        }

        let mut stream = bus.subscribe("test.>", "resumable").await.unwrap();
        let redelivered = next(&mut stream).await;
        assert_eq!(redelivered.subject(), "test.b");
        assert_eq!(redelivered.attempt, 2);
    }

    #[tokio::test]
    async fn test_durables_are_independent() {
        let bus = bus_with_stream().await;
        let mut one = bus.subscribe("test.>", "one").await.unwrap();
        let mut two = bus.subscribe("test.>", "two").await.unwrap();

        bus.publish("test.msg", b"broadcast".to_vec()).await.unwrap();

        next(&mut one).await.ack().await.unwrap();
        next(&mut two).await.nak().await.unwrap();

        assert_eq!(bus.acked("one"), 1);
        assert_eq!(bus.nacked("two"), 1);
        assert_eq!(bus.pending("one"), 0);
        assert_eq!(bus.pending("two"), 1);
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let bus = InMemoryBus::new();
        bus.ensure_stream(&StreamSpec::new("ALL", [">"])).await.unwrap();
        let mut stream = bus.subscribe("auth.events.*", "filtered").await.unwrap();

        bus.publish("auth.events.created", b"match".to_vec()).await.unwrap();
        bus.publish("auth.events.user.created", b"no match".to_vec()).await.unwrap();
        bus.publish("billing.events.created", b"no match".to_vec()).await.unwrap();
        bus.publish("auth.events.deleted", b"match".to_vec()).await.unwrap();

        assert_eq!(next(&mut stream).await.subject(), "auth.events.created");
        assert_eq!(next(&mut stream).await.subject(), "auth.events.deleted");

        let result = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
    }

    #[tokio::test]
    async fn test_subject_without_stream_is_rejected() {
        let bus = bus_with_stream().await;

        assert!(bus.publish("billing.created", b"x".to_vec()).await.is_err());
        assert!(matches!(
            bus.subscribe("billing.>", "nobody").await,
            Err(BusError::SubscribeError(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_publish() {
        let bus = bus_with_stream().await;
        bus.set_unavailable(true);

        let err = bus.publish("test.msg", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BusError::PublishError(_)));
        assert!(bus.messages("test.>").is_empty());

        bus.set_unavailable(false);
        bus.publish("test.msg", b"x".to_vec()).await.unwrap();
        assert_eq!(bus.messages("test.>").len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = bus_with_stream().await;
        let mut stream = bus.subscribe("test.>", "closing").await.unwrap();

        bus.close();

        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout");
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn test_second_binding_does_not_take_over_in_flight_delivery() {
        let bus = bus_with_stream().await;
        let mut first = bus.subscribe("test.>", "shared").await.unwrap();
        bus.publish("test.msg", b"x".to_vec()).await.unwrap();

        let in_flight = next(&mut first).await;
        let mut second = bus.subscribe("test.>", "shared").await.unwrap();

        let stolen = tokio::time::timeout(Duration::from_millis(100), second.next()).await;
        assert!(stolen.is_err(), "second binding must not see the in-flight message");

        in_flight.ack().await.unwrap();
        assert_eq!(bus.acked("shared"), 1);
        assert_eq!(bus.pending("shared"), 0);
    }

    #[tokio::test]
    async fn test_dropped_binding_hands_unsettled_to_live_binding() {
        let bus = bus_with_stream().await;
        let mut first = bus.subscribe("test.>", "shared").await.unwrap();
        let mut second = bus.subscribe("test.>", "shared").await.unwrap();
        bus.publish("test.msg", b"x".to_vec()).await.unwrap();

        let abandoned = next(&mut first).await;
        drop(first);

        let redelivered = next(&mut second).await;
        assert_eq!(redelivered.payload(), b"x");
        assert_eq!(redelivered.attempt, 2);
        redelivered.ack().await.unwrap();

        assert!(abandoned.ack().await.is_err(), "stale delivery cannot settle");
        assert_eq!(bus.acked("shared"), 1);
    }
}
