//! Event bus abstraction for the trip choreography.
//!
//! The trip side and the driver side share no transaction boundary. They learn
//! about each other's state changes only through events on this bus.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐                       ┌──────────────────┐
//! │   Trip saga    │── trip.* (trip_svc) ─►│  Driver handler  │
//! │ (CAS on store) │                       │ (busy / release) │
//! └───────▲────────┘                       └────────┬─────────┘
//!         │                                         │
//!         └──── trip.* (driver_svc) ◄── driver actions
//! ```
//!
//! # Delivery model
//!
//! - **At-most-once**: a publish is acknowledged once the transport accepts it
//! - **Unordered across subjects**: only events sharing a key keep their order
//! - **Idempotency**: handlers must tolerate duplicate and stale events
//!
//! # Subscription modes
//!
//! - [`EventBus::subscribe`]: every subscriber receives every message
//! - [`EventBus::queue_subscribe`]: members of a group compete; each message goes
//!   to exactly one member of the group
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (`rideflow-testing`) - for tests
//! - `RedpandaEventBus` (`rideflow-redpanda`) - for production (Kafka-compatible)

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to subjects
    #[error("Subscription failed for subjects {subjects:?}: {reason}")]
    SubscriptionFailed {
        /// The subjects that failed to subscribe
        subjects: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Subject not found or invalid
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    /// Network or transport error while receiving
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Publish/subscribe transport for lifecycle events.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the bus
/// can be shared as `Arc<dyn EventBus>` between the saga, the dispatch service
/// and the consumers.
pub trait EventBus: Send + Sync {
    /// Publish an event on its subject, keyed by `event.key`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the transport refuses the event.
    fn publish(
        &self,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to `subjects`; this subscriber sees every message.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot be set up.
    fn subscribe(
        &self,
        subjects: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;

    /// Join the competing-consumer `group` on `subjects`.
    ///
    /// Each message is delivered to exactly one member of the group. Distinct
    /// groups each receive their own copy.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot be set up.
    fn queue_subscribe(
        &self,
        subjects: &[&str],
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
