//! The two sides of the event choreography.
//!
//! | Handler                | Group            | Acts on origin   | Effect                         |
//! |------------------------|------------------|------------------|--------------------------------|
//! | [`TripEventHandler`]   | `trip-service`   | `driver_service` | assign / start / complete trip |
//! | [`DriverEventHandler`] | `driver-service` | `trip_service`   | claim / release / count driver |
//! | [`DriverEventHandler`] | `driver-service` | (none)           | average rider ratings          |
//!
//! Each side ignores its own echoes, so a trip-side `trip.accepted` is never
//! fed back into the saga and a driver-side request never moves a driver.
//! Both handlers are safe to replay: the second delivery of any event leaves
//! state as the first one did.

use crate::consumer::{EventHandler, HandlerError};
use crate::retry::{RetryPolicy, retry_store};
use crate::saga::TripSaga;
use async_trait::async_trait;
use rideflow_core::actor::Actor;
use rideflow_core::environment::Clock;
use rideflow_core::error::SagaError;
use rideflow_core::driver::{MAX_RATING_SCORE, MIN_RATING_SCORE};
use rideflow_core::event::{
    EventOrigin, LifecycleEvent, RaterType, RatingCreated, SerializedEvent, Subject,
};
use rideflow_core::ids::{DriverId, TripId};
use rideflow_core::store::DriverStore;
use std::sync::Arc;

/// Consumer group of the trip side.
pub const TRIP_SERVICE_GROUP: &str = "trip-service";

/// Consumer group of the driver side.
pub const DRIVER_SERVICE_GROUP: &str = "driver-service";

/// Subjects the trip side consumes.
pub const TRIP_SERVICE_SUBJECTS: [Subject; 3] = [
    Subject::TripAccepted,
    Subject::TripStarted,
    Subject::TripCompleted,
];

/// Subjects the driver side consumes.
pub const DRIVER_SERVICE_SUBJECTS: [Subject; 4] = [
    Subject::TripAccepted,
    Subject::TripCancelled,
    Subject::TripCompleted,
    Subject::RatingCreated,
];

/// Applies driver requests to the trip state machine.
#[derive(Debug, Clone)]
pub struct TripEventHandler {
    saga: TripSaga,
}

impl TripEventHandler {
    /// Create a handler driving `saga`.
    #[must_use]
    pub const fn new(saga: TripSaga) -> Self {
        Self { saga }
    }

    async fn on_accepted(&self, trip_id: TripId, driver_id: DriverId) -> Result<(), SagaError> {
        match self
            .saga
            .assign_driver(&Actor::System, trip_id, driver_id.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(SagaError::Conflict(_)) => {
                let trip = self.saga.get_trip(&Actor::System, trip_id).await?;
                if trip.driver_id.as_ref() == Some(&driver_id) {
                    tracing::debug!(%trip_id, %driver_id, "Duplicate acceptance ignored");
                } else {
                    tracing::info!(
                        %trip_id,
                        %driver_id,
                        status = %trip.status,
                        "Driver lost the race for trip"
                    );
                }
                Ok(())
            },
            Err(SagaError::Validation(reason)) => {
                tracing::info!(%trip_id, %driver_id, %reason, "Driver request rejected");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }
}

/// An `InvalidState` on the trip side means the event is a replay or arrived
/// after the trip moved on. Neither is worth retrying.
fn settle(result: Result<rideflow_core::trip::Trip, SagaError>) -> Result<(), SagaError> {
    match result {
        Ok(_) => Ok(()),
        Err(SagaError::InvalidState {
            trip_id,
            current,
            attempted,
        }) => {
            tracing::debug!(%trip_id, %current, attempted, "Stale driver request ignored");
            Ok(())
        },
        Err(e) => Err(e),
    }
}

#[async_trait]
impl EventHandler for TripEventHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), HandlerError> {
        let event = LifecycleEvent::from_serialized(event)?;
        if event.origin() != Some(EventOrigin::DriverService) {
            tracing::trace!(subject = %event.subject(), key = %event.key(), "Ignoring own event");
            return Ok(());
        }

        match event {
            LifecycleEvent::TripAccepted(e) => self.on_accepted(e.trip_id, e.driver_id).await?,
            LifecycleEvent::TripStarted(e) => {
                settle(self.saga.start_trip(&Actor::System, e.trip_id).await)?;
            },
            LifecycleEvent::TripCompleted(e) => {
                settle(
                    self.saga
                        .complete_trip(&Actor::System, e.trip_id, e.actual_fare, e.actual_duration)
                        .await,
                )?;
            },
            other => {
                tracing::debug!(subject = %other.subject(), "No trip-side action for subject");
            },
        }
        Ok(())
    }
}

/// Keeps driver commitments in step with authoritative trip events.
#[derive(Clone)]
pub struct DriverEventHandler {
    drivers: Arc<dyn DriverStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl DriverEventHandler {
    /// Create a handler writing to `drivers`.
    #[must_use]
    pub fn new(drivers: Arc<dyn DriverStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            drivers,
            clock,
            retry,
        }
    }

    async fn on_rating(&self, rating: RatingCreated) -> Result<(), HandlerError> {
        if rating.rater_type != RaterType::Rider {
            return Ok(());
        }
        let score = u8::try_from(rating.rating)
            .ok()
            .filter(|_| (MIN_RATING_SCORE..=MAX_RATING_SCORE).contains(&rating.rating))
            .ok_or_else(|| {
                SagaError::Validation(format!(
                    "rating {} is outside {MIN_RATING_SCORE}..={MAX_RATING_SCORE}",
                    rating.rating
                ))
            })?;

        let driver_id = DriverId::new(rating.rated_id);
        let now = self.clock.now();
        let recorded = retry_store(&self.retry, || {
            self.drivers
                .record_rating(&driver_id, &rating.rating_id, rating.trip_id, score, now)
        })
        .await?;
        tracing::info!(
            %driver_id,
            rating_id = %rating.rating_id,
            score,
            recorded,
            "Driver rating received"
        );
        Ok(())
    }
}

impl std::fmt::Debug for DriverEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEventHandler")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler for DriverEventHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), HandlerError> {
        let event = match LifecycleEvent::from_serialized(event)? {
            LifecycleEvent::RatingCreated(rating) => return self.on_rating(rating).await,
            event => event,
        };
        if event.origin() != Some(EventOrigin::TripService) {
            tracing::trace!(subject = %event.subject(), key = %event.key(), "Ignoring driver request");
            return Ok(());
        }
        let now = self.clock.now();

        match event {
            LifecycleEvent::TripAccepted(e) => {
                let claimed = retry_store(&self.retry, || {
                    self.drivers.claim_for_trip(&e.driver_id, e.trip_id, now)
                })
                .await?;
                if claimed {
                    tracing::info!(driver_id = %e.driver_id, trip_id = %e.trip_id, "Driver committed to trip");
                } else {
                    tracing::warn!(
                        driver_id = %e.driver_id,
                        trip_id = %e.trip_id,
                        "Driver already committed to another trip, claim skipped"
                    );
                }
            },
            LifecycleEvent::TripCancelled(e) => {
                let Some(driver_id) = e.driver_id else {
                    return Ok(());
                };
                let released = retry_store(&self.retry, || {
                    self.drivers.release_from_trip(&driver_id, e.trip_id, now)
                })
                .await?;
                tracing::info!(%driver_id, trip_id = %e.trip_id, released, "Driver released from cancelled trip");
            },
            LifecycleEvent::TripCompleted(e) => {
                let counted = retry_store(&self.retry, || {
                    self.drivers.record_completion(&e.driver_id, e.trip_id, now)
                })
                .await?;
                tracing::info!(driver_id = %e.driver_id, trip_id = %e.trip_id, counted, "Driver finished trip");
            },
            other => {
                tracing::debug!(subject = %other.subject(), "No driver-side action for subject");
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use crate::saga::{SagaConfig, TripRequest};
    use rideflow_core::event::{TripAccepted, TripCancelled, TripCompleted};
    use rideflow_core::ids::RiderId;
    use rideflow_core::trip::TripStatus;
    use rideflow_testing::helpers::{driver_near_pickup, dropoff, pickup};
    use rideflow_testing::{InMemoryDriverStore, InMemoryEventBus, InMemoryTripStore, test_clock};

    fn encode(event: LifecycleEvent) -> SerializedEvent {
        event.to_serialized().unwrap()
    }

    fn accepted(trip_id: TripId, driver: &str, origin: EventOrigin) -> SerializedEvent {
        encode(LifecycleEvent::TripAccepted(TripAccepted {
            trip_id,
            driver_id: DriverId::new(driver),
            rider_id: None,
            origin,
            timestamp: test_clock().now(),
        }))
    }

    fn completed(trip_id: TripId, driver: &str) -> SerializedEvent {
        encode(LifecycleEvent::TripCompleted(TripCompleted {
            trip_id,
            driver_id: DriverId::new(driver),
            actual_fare: 120.0,
            actual_duration: 9,
            origin: EventOrigin::TripService,
            completed_at: test_clock().now(),
        }))
    }

    fn driver_handler() -> (DriverEventHandler, InMemoryDriverStore) {
        let drivers = InMemoryDriverStore::new();
        let handler = DriverEventHandler::new(
            Arc::new(drivers.clone()),
            Arc::new(test_clock()),
            RetryPolicy::default(),
        );
        (handler, drivers)
    }

    async fn trip_side() -> (TripEventHandler, TripSaga, TripId, InMemoryEventBus) {
        let bus = InMemoryEventBus::new();
        let saga = TripSaga::new(
            Arc::new(InMemoryTripStore::new()),
            Arc::new(bus.clone()),
            Arc::new(test_clock()),
            SagaConfig::default(),
        );
        let trip = saga
            .create_trip(
                &Actor::Rider(RiderId::new("r-1")),
                TripRequest {
                    pickup: pickup(),
                    dropoff: dropoff(),
                },
            )
            .await
            .unwrap();
        (TripEventHandler::new(saga.clone()), saga, trip.id, bus)
    }

    #[tokio::test]
    async fn replayed_acceptance_leaves_driver_state_unchanged() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));
        drivers.put(driver_near_pickup("d-2", 2.0));
        let trip = TripId::new();
        let event = accepted(trip, "d-1", EventOrigin::TripService);

        handler.handle(&event).await.unwrap();
        let once = drivers.all();
        handler.handle(&event).await.unwrap();

        assert_eq!(drivers.all(), once);
        assert_eq!(once[0].current_trip_id, Some(trip));
        let idle = once.iter().filter(|d| d.current_trip_id.is_none()).count();
        assert_eq!(idle, 1);
    }

    #[tokio::test]
    async fn driver_side_ignores_its_own_requests() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));

        handler
            .handle(&accepted(TripId::new(), "d-1", EventOrigin::DriverService))
            .await
            .unwrap();
        assert!(drivers.all()[0].current_trip_id.is_none());
    }

    #[tokio::test]
    async fn completion_is_counted_once() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));
        let trip = TripId::new();

        handler.handle(&accepted(trip, "d-1", EventOrigin::TripService)).await.unwrap();
        handler.handle(&completed(trip, "d-1")).await.unwrap();
        handler.handle(&completed(trip, "d-1")).await.unwrap();

        let driver = drivers.all().pop().unwrap();
        assert_eq!(driver.completed_trips, 1);
        assert!(driver.current_trip_id.is_none());
    }

    #[tokio::test]
    async fn cancellation_releases_only_the_matching_commitment() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));
        let old = TripId::new();
        let current = TripId::new();
        handler.handle(&accepted(current, "d-1", EventOrigin::TripService)).await.unwrap();

        let stale = encode(LifecycleEvent::TripCancelled(TripCancelled {
            trip_id: old,
            rider_id: RiderId::new("r-1"),
            driver_id: Some(DriverId::new("d-1")),
            reason: "changed plans".into(),
            origin: EventOrigin::TripService,
            cancelled_at: test_clock().now(),
        }));
        handler.handle(&stale).await.unwrap();
        assert_eq!(drivers.all()[0].current_trip_id, Some(current));
    }

    fn rating(rating_id: &str, rated: &str, rater_type: RaterType, score: i32) -> SerializedEvent {
        encode(LifecycleEvent::RatingCreated(RatingCreated {
            rating_id: rating_id.into(),
            trip_id: TripId::new(),
            rated_id: rated.into(),
            rater_type,
            rating: score,
        }))
    }

    #[tokio::test]
    async fn rider_ratings_are_averaged_into_the_profile() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));

        handler.handle(&rating("r-1", "d-1", RaterType::Rider, 5)).await.unwrap();
        handler.handle(&rating("r-2", "d-1", RaterType::Rider, 3)).await.unwrap();
        handler.handle(&rating("r-2", "d-1", RaterType::Rider, 3)).await.unwrap();
        // Drivers rating riders say nothing about the driver.
        handler.handle(&rating("r-3", "d-1", RaterType::Driver, 1)).await.unwrap();

        let driver = drivers.all().pop().unwrap();
        assert!((driver.profile.rating - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn out_of_range_rating_is_an_error() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));

        assert!(handler.handle(&rating("r-1", "d-1", RaterType::Rider, 6)).await.is_err());
        assert!(handler.handle(&rating("r-2", "d-1", RaterType::Rider, 0)).await.is_err());
        assert!(drivers.all()[0].profile.rating.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let (handler, _) = driver_handler();
        let garbage = SerializedEvent::new("trip.accepted".into(), "k".into(), b"{".to_vec());
        assert!(handler.handle(&garbage).await.is_err());
    }

    #[tokio::test]
    async fn trip_side_applies_driver_requests_idempotently() {
        let (handler, saga, trip_id, bus) = trip_side().await;
        let request = accepted(trip_id, "d-1", EventOrigin::DriverService);

        handler.handle(&request).await.unwrap();
        handler.handle(&request).await.unwrap();

        let trip = saga.get_trip(&Actor::System, trip_id).await.unwrap();
        assert_eq!(trip.status, TripStatus::Accepted);
        assert_eq!(trip.driver_id, Some(DriverId::new("d-1")));
        assert_eq!(bus.published_on("trip.accepted").len(), 1);
    }

    #[tokio::test]
    async fn losing_driver_request_is_not_an_error() {
        let (handler, saga, trip_id, _) = trip_side().await;
        handler
            .handle(&accepted(trip_id, "d-1", EventOrigin::DriverService))
            .await
            .unwrap();
        handler
            .handle(&accepted(trip_id, "d-2", EventOrigin::DriverService))
            .await
            .unwrap();

        let trip = saga.get_trip(&Actor::System, trip_id).await.unwrap();
        assert_eq!(trip.driver_id, Some(DriverId::new("d-1")));

        // The losing driver learns the outcome by reading its active trip.
        let loser = DriverId::new("d-2");
        let active = saga
            .active_trip_for_driver(&Actor::Driver(loser.clone()), &loser)
            .await
            .unwrap();
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn driver_on_an_active_trip_cannot_take_another() {
        let (handler, saga, first, _) = trip_side().await;
        let second = saga
            .create_trip(
                &Actor::Rider(RiderId::new("r-2")),
                TripRequest {
                    pickup: pickup(),
                    dropoff: dropoff(),
                },
            )
            .await
            .unwrap()
            .id;

        handler
            .handle(&accepted(first, "d-1", EventOrigin::DriverService))
            .await
            .unwrap();
        handler
            .handle(&accepted(second, "d-1", EventOrigin::DriverService))
            .await
            .unwrap();

        let second_trip = saga.get_trip(&Actor::System, second).await.unwrap();
        assert_eq!(second_trip.status, TripStatus::Requested);
        assert!(second_trip.driver_id.is_none());
    }

    #[tokio::test]
    async fn each_completed_trip_is_counted_for_a_busy_driver() {
        let (handler, drivers) = driver_handler();
        drivers.put(driver_near_pickup("d-1", 1.0));
        let (first, second) = (TripId::new(), TripId::new());

        handler.handle(&accepted(first, "d-1", EventOrigin::TripService)).await.unwrap();
        // Cannot displace the unfinished first trip.
        handler.handle(&accepted(second, "d-1", EventOrigin::TripService)).await.unwrap();
        assert_eq!(drivers.all()[0].current_trip_id, Some(first));

        handler.handle(&completed(first, "d-1")).await.unwrap();
        handler.handle(&accepted(second, "d-1", EventOrigin::TripService)).await.unwrap();
        handler.handle(&completed(second, "d-1")).await.unwrap();

        let driver = drivers.all().pop().unwrap();
        assert_eq!(driver.completed_trips, 2);
        assert!(driver.current_trip_id.is_none());
    }

    #[tokio::test]
    async fn trip_side_ignores_its_own_echo() {
        let (handler, saga, trip_id, _) = trip_side().await;
        handler
            .handle(&accepted(trip_id, "d-1", EventOrigin::TripService))
            .await
            .unwrap();

        let trip = saga.get_trip(&Actor::System, trip_id).await.unwrap();
        assert_eq!(trip.status, TripStatus::Requested);
    }
}
