//! Event bus consumer with automatic resubscription and bounded concurrency.
//!
//! [`EventConsumer`] owns the subscribe-process-resubscribe loop so handlers
//! only implement [`EventHandler`]:
//!
//! ```text
//! loop {
//!     subscribe (or queue_subscribe with a group)
//!         for each delivery:
//!             wait for a permit (at most `concurrency` in flight)
//!             spawn handler task, log failures, keep going
//!     stream ended or subscribe failed: sleep retry_delay
//! }
//! on shutdown: stop reading, wait for in-flight handlers
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rideflow_runtime::consumer::EventConsumer;
//!
//! let consumer = EventConsumer::builder()
//!     .name("trip-service")
//!     .topics(vec!["trip.accepted".to_string()])
//!     .group("trip-service")
//!     .event_bus(event_bus)
//!     .handler(handler)
//!     .shutdown(shutdown_rx)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::metrics::EventBusMetrics;
use async_trait::async_trait;
use futures::StreamExt;
use rideflow_core::event::SerializedEvent;
use rideflow_core::event_bus::{EventBus, EventStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};
use tracing::{error, info, warn};

/// Default number of handler tasks in flight per consumer.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default pause before resubscribing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Error returned by an [`EventHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivered event.
///
/// Errors are logged and counted by the [`EventConsumer`]; they never stop
/// consumption. Implementations must tolerate duplicate deliveries.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the event was malformed or could not be applied.
    async fn handle(&self, event: &SerializedEvent) -> Result<(), HandlerError>;
}

/// A required builder field was not set.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event consumer is missing required field `{0}`")]
pub struct ConsumerBuildError(&'static str);

/// Long-running consumer of one set of subjects.
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    group: Option<String>,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    concurrency: usize,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task ends after a shutdown signal, once in-flight handlers finish.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, group = ?self.group, "Event consumer started");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let subjects = self.topics.clone();
            let topics: Vec<&str> = subjects.iter().map(String::as_str).collect();
            let bus = Arc::clone(&self.event_bus);
            let group = self.group.clone();
            let subscription = async {
                match group.as_deref() {
                    Some(group) => bus.queue_subscribe(&topics, group).await,
                    None => bus.subscribe(&topics).await,
                }
            };

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                subscribe_result = subscription => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event bus");

                            if self.process_stream(&mut stream, &permits).await {
                                break;
                            }

                            warn!(consumer = %self.name, "Event stream ended, resubscribing in {:?}", self.retry_delay);
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to event bus, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        // Every permit back means every handler task has finished.
        let capacity = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if permits.acquire_many(capacity).await.is_err() {
            warn!(consumer = %self.name, "Handler permits closed before drain");
        }
        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Dispatch deliveries until the stream ends. Returns `true` on shutdown.
    async fn process_stream(&mut self, stream: &mut EventStream, permits: &Arc<Semaphore>) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(event)) => {
                            let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
                                return true;
                            };
                            EventBusMetrics::record_consume(&event.subject);
                            let handler = Arc::clone(&self.handler);
                            let name = self.name.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(&event).await {
                                    EventBusMetrics::record_consume_error();
                                    error!(
                                        consumer = %name,
                                        subject = %event.subject,
                                        key = %event.key,
                                        error = %e,
                                        "Failed to handle event"
                                    );
                                }
                                drop(permit);
                            });
                        }
                        Some(Err(e)) => {
                            EventBusMetrics::record_consume_error();
                            error!(consumer = %self.name, error = %e, "Error receiving event from stream");
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("name", &self.name)
            .field("topics", &self.topics)
            .field("group", &self.group)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    group: Option<String>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_delay: Option<Duration>,
    concurrency: Option<usize>,
}

impl EventConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set subjects to consume.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Join a competing-consumer group instead of receiving every message.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set event bus instance.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set event handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set the pause before resubscribing (default: 5 seconds).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Set the number of handler tasks allowed in flight (default: 16, minimum 1).
    #[must_use]
    pub const fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Build the [`EventConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerBuildError`] naming the first required field that is
    /// missing (name, topics, `event_bus`, handler, shutdown).
    pub fn build(self) -> Result<EventConsumer, ConsumerBuildError> {
        Ok(EventConsumer {
            name: self.name.ok_or(ConsumerBuildError("name"))?,
            topics: self.topics.ok_or(ConsumerBuildError("topics"))?,
            group: self.group,
            event_bus: self.event_bus.ok_or(ConsumerBuildError("event_bus"))?,
            handler: self.handler.ok_or(ConsumerBuildError("handler"))?,
            shutdown: self.shutdown.ok_or(ConsumerBuildError("shutdown"))?,
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use rideflow_testing::InMemoryEventBus;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &SerializedEvent) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event.key.clone());
            if event.key == "bad" {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err("malformed".into());
            }
            Ok(())
        }
    }

    async fn publish(bus: &InMemoryEventBus, key: &str) {
        bus.publish(&SerializedEvent::new(
            "trip.accepted".into(),
            key.into(),
            b"{}".to_vec(),
        ))
        .await
        .unwrap();
    }

    async fn wait_for(recorder: &Recorder, n: usize) {
        for _ in 0..200 {
            if recorder.seen.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn build_reports_missing_fields() {
        let err = EventConsumer::builder().name("x").build().unwrap_err();
        assert_eq!(err, ConsumerBuildError("topics"));
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_consumption() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = broadcast::channel(1);

        let handle = EventConsumer::builder()
            .name("test")
            .topics(vec!["trip.accepted".into()])
            .group("trip-service")
            .event_bus(Arc::new(bus.clone()))
            .handler(recorder.clone())
            .shutdown(rx)
            .concurrency(2)
            .build()
            .unwrap()
            .spawn();

        // Give the consumer time to join its group.
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&bus, "bad").await;
        publish(&bus, "good").await;
        wait_for(&recorder, 2).await;

        tx.send(()).unwrap();
        handle.await.unwrap();

        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["bad", "good"]);
        assert_eq!(recorder.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_group_members_share_deliveries() {
        let bus = InMemoryEventBus::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let (tx, _) = broadcast::channel(1);

        let mut handles = Vec::new();
        for recorder in [&first, &second] {
            handles.push(
                EventConsumer::builder()
                    .name("member")
                    .topics(vec!["trip.accepted".into()])
                    .group("driver-service")
                    .event_bus(Arc::new(bus.clone()))
                    .handler(recorder.clone())
                    .shutdown(tx.subscribe())
                    .build()
                    .unwrap()
                    .spawn(),
            );
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..10 {
            publish(&bus, &format!("trip-{i}")).await;
        }
        for _ in 0..200 {
            let total = first.seen.lock().unwrap().len() + second.seen.lock().unwrap().len();
            if total >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let total = first.seen.lock().unwrap().len() + second.seen.lock().unwrap().len();
        assert_eq!(total, 10);
    }
}
