//! # Rideflow Testing
//!
//! Test doubles for the Rideflow trip saga.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: broadcast and queue-group delivery, with a record of
//!   everything published
//! - [`InMemoryTripStore`] / [`InMemoryDriverStore`]: storage with the same
//!   atomic-transition contract as Postgres, plus failure injection
//! - [`FixedClock`] / [`MockClock`]: deterministic time
//! - [`helpers`]: fixtures and tracing setup
//! - [`properties`]: proptest strategies for domain values
//!
//! ## Example
//!
//! ```ignore
//! use rideflow_testing::{InMemoryEventBus, InMemoryTripStore, InMemoryDriverStore, MockClock};
//!
//! #[tokio::test]
//! async fn request_expires() {
//!     let clock = MockClock::starting_at(test_clock().now());
//!     let saga = TripSaga::new(Arc::new(InMemoryTripStore::new()), bus, Arc::new(clock.clone()), config);
//!     let trip = saga.create_trip(&rider, request).await?;
//!     clock.advance(chrono::Duration::minutes(6));
//!     sweeper.sweep_once().await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use rideflow_core::environment::Clock;

mod event_bus;
mod stores;

pub use event_bus::InMemoryEventBus;
pub use stores::{InMemoryDriverStore, InMemoryTripStore};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use rideflow_testing::mocks::FixedClock;
    /// use rideflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    ///
    /// ```
    /// use rideflow_testing::mocks::MockClock;
    /// use rideflow_core::environment::Clock;
    ///
    /// let clock = MockClock::starting_at(rideflow_testing::test_clock().now());
    /// let start = clock.now();
    /// clock.advance(chrono::Duration::minutes(5));
    /// assert_eq!(clock.now() - start, chrono::Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)] // Mutex poison is unrecoverable
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        #[allow(clippy::unwrap_used)] // Mutex poison is unrecoverable
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for MockClock {
        #[allow(clippy::unwrap_used)] // Mutex poison is unrecoverable
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fixtures and setup shared by the test suites.
pub mod helpers {
    use super::Clock;
    use super::mocks::test_clock;
    use rideflow_core::driver::DriverAvailability;
    use rideflow_core::geo::{Coordinates, EARTH_RADIUS_KM, Location};
    use rideflow_core::ids::DriverId;

    /// Nairobi CBD.
    #[must_use]
    pub fn pickup() -> Location {
        Location::new(-1.286_389, 36.817_223, "Nairobi CBD")
    }

    /// Westlands, about 0.8 km from [`pickup`].
    #[must_use]
    pub fn dropoff() -> Location {
        Location::new(-1.292_066, 36.821_945, "Westlands")
    }

    /// A point `km` due north of `origin`.
    #[must_use]
    pub fn north_of(origin: Coordinates, km: f64) -> Coordinates {
        let dlat = (km / EARTH_RADIUS_KM).to_degrees();
        Coordinates::new(origin.latitude + dlat, origin.longitude)
    }

    /// An online, idle driver `km` north of [`pickup`].
    #[must_use]
    pub fn driver_near_pickup(id: &str, km: f64) -> DriverAvailability {
        let mut driver = DriverAvailability::new(DriverId::new(id), test_clock().now());
        driver.is_online = true;
        driver.location = Some(north_of(pickup().coordinates, km));
        driver
    }

    /// Install a test-friendly tracing subscriber (idempotent).
    ///
    /// Honours `RUST_LOG`; defaults to `debug` for the rideflow crates.
    pub fn init_test_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rideflow=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use rideflow_core::geo::Coordinates;
    use rideflow_core::ids::DriverId;

    /// Valid, non-degenerate coordinates (never on the equator or prime meridian).
    pub fn coordinates() -> impl Strategy<Value = Coordinates> {
        let lat = prop_oneof![-89.0f64..-0.001, 0.001f64..89.0];
        let lng = prop_oneof![-179.0f64..-0.001, 0.001f64..179.0];
        (lat, lng).prop_map(|(lat, lng)| Coordinates::new(lat, lng))
    }

    /// Distinct-looking driver ids.
    pub fn driver_id() -> impl Strategy<Value = DriverId> {
        "driver-[a-z0-9]{1,8}".prop_map(DriverId::new)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockClock, test_clock};
