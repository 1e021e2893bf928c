//! # Rideflow Runtime
//!
//! The moving parts of the trip lifecycle: the saga that owns trip state, the
//! driver-side dispatch service, the event consumers that connect the two, and
//! the background sweep that expires unanswered requests.
//!
//! ## Components
//!
//! - **[`TripSaga`]**: validated, authorized, conditional trip transitions
//! - **[`DispatchService`]**: availability, position, profile, candidate search
//! - **[`EventConsumer`]** + [`handlers`]: the choreography between both sides
//! - **[`ExpirySweeper`]**: cancels `Requested` trips older than the window
//! - **[`retry`]** / **[`metrics`]**: bounded retries and Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use rideflow_runtime::{SagaConfig, TripRequest, TripSaga};
//!
//! let saga = TripSaga::new(trip_store, event_bus, clock, SagaConfig::default());
//! let trip = saga.create_trip(&Actor::Rider(rider_id), TripRequest { pickup, dropoff }).await?;
//! saga.assign_driver(&Actor::Driver(driver_id.clone()), trip.id, driver_id).await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub mod consumer;
pub mod dispatch;
pub mod expiry;
pub mod handlers;
pub mod publisher;
pub mod saga;

pub use consumer::{EventConsumer, EventHandler};
pub use dispatch::{DispatchConfig, DispatchService};
pub use expiry::{ExpiryConfig, ExpirySweeper};
pub use handlers::{DriverEventHandler, TripEventHandler};
pub use publisher::EventPublisher;
pub use retry::RetryPolicy;
pub use saga::{SagaConfig, TripRequest, TripSaga};
