//! In-memory event bus with broadcast and queue-group delivery.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use futures::StreamExt;
use rideflow_core::event::{EventError, LifecycleEvent, SerializedEvent};
use rideflow_core::event_bus::{EventBus, EventBusError, EventStream};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Member {
    subjects: HashSet<String>,
    tx: mpsc::UnboundedSender<SerializedEvent>,
}

impl Member {
    fn wants(&self, subject: &str) -> bool {
        !self.tx.is_closed() && self.subjects.contains(subject)
    }
}

#[derive(Default)]
struct QueueGroup {
    members: Vec<Member>,
    next: usize,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Member>,
    groups: HashMap<String, QueueGroup>,
    published: Vec<SerializedEvent>,
    failures_remaining: usize,
}

/// Event bus for tests.
///
/// - `subscribe` streams receive every matching event
/// - `queue_subscribe` members of the same group receive matching events
///   round-robin, one member per event
/// - every accepted publish is recorded for assertions
/// - [`fail_next_publishes`](Self::fail_next_publishes) makes the bus refuse
///   publishes, for exercising retry paths
///
/// # Example
///
/// ```
/// use rideflow_core::event::SerializedEvent;
/// use rideflow_core::event_bus::EventBus;
/// use rideflow_testing::InMemoryEventBus;
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new();
/// let mut stream = bus.subscribe(&["trip.created"]).await.unwrap();
///
/// bus.publish(&SerializedEvent::new("trip.created".into(), "k".into(), b"{}".to_vec()))
///     .await
///     .unwrap();
///
/// let received = stream.next().await.unwrap().unwrap();
/// assert_eq!(received.subject, "trip.created");
/// assert_eq!(bus.published().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` publishes with [`EventBusError::PublishFailed`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.lock().unwrap().failures_remaining = n;
    }

    /// Every event accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<SerializedEvent> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Accepted events on `subject`.
    #[must_use]
    pub fn published_on(&self, subject: &str) -> Vec<SerializedEvent> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }

    /// Accepted events, decoded.
    ///
    /// # Errors
    ///
    /// Returns the first decoding error.
    pub fn published_events(&self) -> Result<Vec<LifecycleEvent>, EventError> {
        self.published()
            .iter()
            .map(LifecycleEvent::from_serialized)
            .collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.inner.lock().unwrap().published.clear();
    }

    fn deliver(inner: &mut Inner, event: &SerializedEvent) {
        inner.subscribers.retain(|m| !m.tx.is_closed());
        for member in &inner.subscribers {
            if member.subjects.contains(&event.subject) {
                let _ = member.tx.send(event.clone());
            }
        }

        for group in inner.groups.values_mut() {
            group.members.retain(|m| !m.tx.is_closed());
            let eligible: Vec<usize> = group
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.wants(&event.subject))
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                continue;
            }
            let pick = eligible[group.next % eligible.len()];
            group.next = group.next.wrapping_add(1);
            let _ = group.members[pick].tx.send(event.clone());
        }
    }

    fn member(subjects: &[&str]) -> (Member, EventStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let member = Member {
            subjects: subjects.iter().map(|s| (*s).to_string()).collect(),
            tx,
        };
        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield Ok(event);
            }
        };
        (member, stream.boxed())
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let event = event.clone();
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            if inner.failures_remaining > 0 {
                inner.failures_remaining -= 1;
                return Err(EventBusError::PublishFailed {
                    subject: event.subject,
                    reason: "injected failure".to_string(),
                });
            }
            Self::deliver(&mut inner, &event);
            inner.published.push(event);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subjects: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let (member, stream) = Self::member(subjects);
        Box::pin(async move {
            self.inner.lock().unwrap().subscribers.push(member);
            Ok(stream)
        })
    }

    fn queue_subscribe(
        &self,
        subjects: &[&str],
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let (member, stream) = Self::member(subjects);
        let group = group.to_string();
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .groups
                .entry(group)
                .or_default()
                .members
                .push(member);
            Ok(stream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(subject: &str) -> SerializedEvent {
        SerializedEvent::new(subject.to_string(), "key".to_string(), b"{}".to_vec())
    }

    async fn drain(stream: &mut EventStream) -> usize {
        let mut n = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(20), stream.next()).await {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn broadcast_subscribers_each_receive_every_event() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(&["trip.created"]).await.unwrap();
        let mut b = bus.subscribe(&["trip.created", "trip.cancelled"]).await.unwrap();

        bus.publish(&event("trip.created")).await.unwrap();
        bus.publish(&event("trip.cancelled")).await.unwrap();

        assert_eq!(drain(&mut a).await, 1);
        assert_eq!(drain(&mut b).await, 2);
    }

    #[tokio::test]
    async fn queue_group_delivers_each_event_to_one_member() {
        let bus = InMemoryEventBus::new();
        let mut m1 = bus.queue_subscribe(&["trip.accepted"], "driver-service").await.unwrap();
        let mut m2 = bus.queue_subscribe(&["trip.accepted"], "driver-service").await.unwrap();
        let mut other = bus.queue_subscribe(&["trip.accepted"], "trip-service").await.unwrap();

        for _ in 0..4 {
            bus.publish(&event("trip.accepted")).await.unwrap();
        }

        let (n1, n2) = (drain(&mut m1).await, drain(&mut m2).await);
        assert_eq!(n1 + n2, 4);
        assert_eq!(n1, 2);
        assert_eq!(drain(&mut other).await, 4);
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish(&event("trip.started")).await.is_err());
        assert!(bus.publish(&event("trip.started")).await.is_ok());
        assert_eq!(bus.published_on("trip.started").len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_skipped() {
        let bus = InMemoryEventBus::new();
        let gone = bus.queue_subscribe(&["trip.accepted"], "g").await.unwrap();
        let mut alive = bus.queue_subscribe(&["trip.accepted"], "g").await.unwrap();
        drop(gone);

        bus.publish(&event("trip.accepted")).await.unwrap();
        bus.publish(&event("trip.accepted")).await.unwrap();
        assert_eq!(drain(&mut alive).await, 2);
    }
}
