//! Best-effort event publishing with bounded retry.
//!
//! A publish happens after the state change it describes has been committed.
//! If the transport keeps refusing it, the event is dropped: the failure is
//! logged at `error` and counted, and the committed change stands.

use crate::metrics::EventBusMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use rideflow_core::event::LifecycleEvent;
use rideflow_core::event_bus::{EventBus, EventBusError};
use std::sync::Arc;
use std::time::Instant;

/// Wraps an [`EventBus`] with encoding, retry and metrics.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    policy: RetryPolicy,
}

impl EventPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, policy: RetryPolicy) -> Self {
        Self { bus, policy }
    }

    /// Publish `event`, retrying transport failures. Returns whether the
    /// transport eventually accepted it.
    pub async fn publish(&self, event: &LifecycleEvent) -> bool {
        let subject = event.subject();
        let serialized = match event.to_serialized() {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::error!(subject = %subject, error = %e, "Failed to encode event");
                EventBusMetrics::record_publish_error(subject.as_str());
                return false;
            },
        };

        let started = Instant::now();
        let timeout = self.policy.attempt_timeout;
        let result = retry_with_backoff(&self.policy, || {
            let attempt = self.bus.publish(&serialized);
            async move {
                tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(EventBusError::PublishFailed {
                            subject: subject.as_str().to_string(),
                            reason: format!("timed out after {timeout:?}"),
                        })
                    })
            }
        })
        .await;

        match result {
            Ok(()) => {
                EventBusMetrics::record_publish(subject.as_str(), started.elapsed());
                tracing::debug!(subject = %subject, key = %serialized.key, "Event published");
                true
            },
            Err(e) => {
                EventBusMetrics::record_publish_error(subject.as_str());
                tracing::error!(
                    subject = %subject,
                    key = %serialized.key,
                    error = %e,
                    "Event dropped after exhausting publish retries"
                );
                false
            },
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
