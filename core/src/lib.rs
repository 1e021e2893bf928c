//! # Rideflow Core
//!
//! Domain types, pure algorithms and the storage/transport contracts for the
//! trip lifecycle saga.
//!
//! Nothing in this crate performs I/O. The saga, dispatch service and event
//! consumers in `rideflow-runtime` combine these pieces with concrete stores
//! and an event bus injected at construction time.
//!
//! ## Modules
//!
//! - [`trip`]: the trip record and its state machine
//! - [`driver`]: driver availability and candidate ranking
//! - [`geo`]: coordinates and haversine distance
//! - [`fare`]: fare and duration estimation
//! - [`event`] / [`event_bus`]: lifecycle events and the transport contract
//! - [`store`]: trip and driver persistence contracts
//! - [`actor`]: the authenticated caller threaded through every operation
//! - [`environment`]: injected dependencies that are not stores or transports

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod actor;
pub mod driver;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod fare;
pub mod geo;
pub mod ids;
pub mod store;
pub mod trip;

pub use actor::Actor;
pub use error::SagaError;
pub use ids::{DriverId, RiderId, TripId};

/// Environment module - Dependency injection traits
///
/// Time is the only ambient input the saga has. Everything that reads "now"
/// takes it from a [`Clock`](environment::Clock) so expiry can be tested
/// without sleeping.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
