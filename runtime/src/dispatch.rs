//! The driver side: availability, position, profile and candidate search.
//!
//! [`DispatchService`] is the only writer of the [`DriverStore`] for
//! driver-initiated changes. Trip progress made by a driver (accept, start,
//! complete) is not applied here. It is published as an `origin =
//! driver_service` event for the trip side to apply, and the driver's
//! commitment is updated only once the trip side's authoritative event comes
//! back (see [`DriverEventHandler`](crate::handlers::DriverEventHandler)).

use crate::metrics::DispatchMetrics;
use crate::publisher::EventPublisher;
use crate::retry::{RetryPolicy, retry_store};
use rideflow_core::actor::Actor;
use rideflow_core::driver::{
    DEFAULT_CANDIDATE_LIMIT, DEFAULT_SEARCH_RADIUS_KM, DispatchCandidate, DriverAvailability,
    DriverProfile, rank_candidates, search_bounds,
};
use rideflow_core::environment::Clock;
use rideflow_core::error::SagaError;
use rideflow_core::event::{
    DriverLocationUpdated, DriverStatusChanged, EventOrigin, LifecycleEvent, TripAccepted,
    TripCompleted, TripStarted,
};
use rideflow_core::event_bus::{EventBus, EventBusError};
use rideflow_core::geo::Coordinates;
use rideflow_core::ids::{DriverId, TripId};
use rideflow_core::store::DriverStore;
use std::sync::Arc;
use std::time::Instant;

/// Slack when comparing a submitted rating with the stored average.
const RATING_TOLERANCE: f64 = 1e-6;

/// Dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Radius used when a query gives none.
    pub search_radius_km: f64,
    /// Result size used when a query gives none.
    pub candidate_limit: usize,
    /// Bounds on store calls.
    pub store_retry: RetryPolicy,
    /// Bounds on event publishes.
    pub publish_retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: DEFAULT_SEARCH_RADIUS_KM,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            store_retry: RetryPolicy::default(),
            publish_retry: RetryPolicy::default(),
        }
    }
}

/// Driver-side operations.
#[derive(Clone)]
pub struct DispatchService {
    drivers: Arc<dyn DriverStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl DispatchService {
    /// Create a dispatch service over `drivers`, publishing on `bus`.
    #[must_use]
    pub fn new(
        drivers: Arc<dyn DriverStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        let publisher = EventPublisher::new(bus, config.publish_retry.clone());
        Self {
            drivers,
            publisher,
            clock,
            config,
        }
    }

    /// Go online or offline. Emits `driver.online` / `driver.offline`.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] if the actor is not this driver (or system)
    /// - [`SagaError::Store`] on storage failure
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn report_availability(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        online: bool,
    ) -> Result<DriverAvailability, SagaError> {
        authorize(actor, driver_id)?;
        let now = self.clock.now();
        let record = retry_store(&self.config.store_retry, || {
            self.drivers.set_online(driver_id, online, now)
        })
        .await?;

        tracing::info!(%driver_id, online, "Driver availability changed");

        let change = DriverStatusChanged {
            driver_id: driver_id.clone(),
            is_online: online,
            latitude: record.location.map(|c| c.latitude),
            longitude: record.location.map(|c| c.longitude),
            timestamp: now,
        };
        let event = if online {
            LifecycleEvent::DriverOnline(change)
        } else {
            LifecycleEvent::DriverOffline(change)
        };
        self.publisher.publish(&event).await;
        Ok(record)
    }

    /// Record a position report. Emits `driver.location`.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Validation`] for unusable coordinates
    /// - [`SagaError::Forbidden`] if the actor is not this driver (or system)
    /// - [`SagaError::Store`] on storage failure
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn report_location(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        latitude: f64,
        longitude: f64,
    ) -> Result<DriverAvailability, SagaError> {
        authorize(actor, driver_id)?;
        let position = Coordinates::new(latitude, longitude);
        position.validate()?;

        let now = self.clock.now();
        let record = retry_store(&self.config.store_retry, || {
            self.drivers.set_location(driver_id, position, now)
        })
        .await?;

        tracing::trace!(%driver_id, latitude, longitude, "Driver location updated");

        self.publisher
            .publish(&LifecycleEvent::DriverLocation(DriverLocationUpdated {
                driver_id: driver_id.clone(),
                latitude,
                longitude,
                is_online: record.is_online,
                timestamp: now,
            }))
            .await;
        Ok(record)
    }

    /// Replace the driver's vehicle details.
    ///
    /// The rating is the average of rider ratings and only changes through
    /// `rating.created`. A profile carrying any other rating than the stored
    /// one is refused.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] if the actor is not this driver (or system), or
    ///   the profile changes the rating
    /// - [`SagaError::Store`] on storage failure
    pub async fn update_profile(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        profile: DriverProfile,
    ) -> Result<DriverAvailability, SagaError> {
        authorize(actor, driver_id)?;
        let current = retry_store(&self.config.store_retry, || self.drivers.get(driver_id))
            .await?
            .map_or(0.0, |d| d.profile.rating);
        if !profile.rating.is_finite() || (profile.rating - current).abs() > RATING_TOLERANCE {
            return Err(SagaError::Forbidden(format!(
                "the rating of driver {driver_id} comes from rider ratings"
            )));
        }

        let now = self.clock.now();
        let record = retry_store(&self.config.store_retry, || {
            self.drivers.upsert_profile(driver_id, profile.clone(), now)
        })
        .await?;
        tracing::info!(%driver_id, vehicle = %record.profile.vehicle_model, "Driver profile updated");
        Ok(record)
    }

    /// Load a driver's record.
    ///
    /// # Errors
    ///
    /// - [`SagaError::DriverNotFound`] if the driver has never reported anything
    /// - [`SagaError::Forbidden`] if the actor is not this driver (or system)
    pub async fn get_driver(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
    ) -> Result<DriverAvailability, SagaError> {
        authorize(actor, driver_id)?;
        self.load(driver_id).await
    }

    /// Nearest online, idle drivers to `pickup`.
    ///
    /// `radius_km` and `limit` fall back to the configured defaults when absent
    /// or not positive.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Validation`] for unusable pickup coordinates
    /// - [`SagaError::Store`] on storage failure
    #[tracing::instrument(skip(self))]
    pub async fn find_candidates(
        &self,
        pickup: Coordinates,
        radius_km: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<DispatchCandidate>, SagaError> {
        pickup.validate()?;
        let (radius_km, limit) = search_bounds(
            radius_km
                .filter(|r| r.is_finite() && *r > 0.0)
                .or(Some(self.config.search_radius_km)),
            limit.filter(|l| *l > 0).or(Some(self.config.candidate_limit)),
        );

        let started = Instant::now();
        let drivers = retry_store(&self.config.store_retry, || self.drivers.list_dispatchable())
            .await?;
        let candidates = rank_candidates(pickup, &drivers, radius_km, limit);
        DispatchMetrics::record_query(candidates.len(), started.elapsed());

        tracing::debug!(
            scanned = drivers.len(),
            matched = candidates.len(),
            radius_km,
            "Dispatch query answered"
        );
        Ok(candidates)
    }

    /// Number of drivers that are online and idle.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] on storage failure.
    pub async fn available_driver_count(&self) -> Result<u64, SagaError> {
        let count = retry_store(&self.config.store_retry, || self.drivers.count_available()).await?;
        DispatchMetrics::record_available(count);
        Ok(count)
    }

    /// Ask the trip side to bind this driver to `trip_id`.
    ///
    /// Publishes `trip.accepted` with `origin = driver_service`. The trip side
    /// decides whether the driver wins; the driver becomes busy only when its
    /// authoritative `trip.accepted` comes back.
    ///
    /// `Ok` means the request was sent, not that it won. A driver who lost
    /// the race is never told directly; callers learn the outcome from
    /// [`TripSaga::active_trip_for_driver`](crate::saga::TripSaga::active_trip_for_driver)
    /// or [`DispatchService::get_driver`].
    ///
    /// # Errors
    ///
    /// - [`SagaError::DriverNotFound`] if the driver has no record
    /// - [`SagaError::Validation`] if the driver is offline or already committed
    /// - [`SagaError::Forbidden`] if the actor is not this driver (or system)
    /// - [`SagaError::Transport`] if the request could not be published
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn accept_trip(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        trip_id: TripId,
    ) -> Result<(), SagaError> {
        authorize(actor, driver_id)?;
        let driver = self.load(driver_id).await?;
        if !driver.is_online {
            return Err(SagaError::Validation(format!("driver {driver_id} is offline")));
        }
        if let Some(current) = driver.current_trip_id {
            if current != trip_id {
                return Err(SagaError::Validation(format!(
                    "driver {driver_id} is already on trip {current}"
                )));
            }
        }

        self.request(LifecycleEvent::TripAccepted(TripAccepted {
            trip_id,
            driver_id: driver_id.clone(),
            rider_id: None,
            origin: EventOrigin::DriverService,
            timestamp: self.clock.now(),
        }))
        .await
    }

    /// Report the rider picked up. Publishes `trip.started` with
    /// `origin = driver_service`.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] unless the driver is committed to `trip_id`
    /// - [`SagaError::Transport`] if the report could not be published
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn start_trip(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        trip_id: TripId,
    ) -> Result<(), SagaError> {
        authorize(actor, driver_id)?;
        self.require_commitment(driver_id, trip_id).await?;

        self.request(LifecycleEvent::TripStarted(TripStarted {
            trip_id,
            driver_id: driver_id.clone(),
            origin: EventOrigin::DriverService,
            started_at: self.clock.now(),
        }))
        .await
    }

    /// Report the rider dropped off. Publishes `trip.completed` with
    /// `origin = driver_service`.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Validation`] for a negative or non-finite fare
    /// - [`SagaError::Forbidden`] unless the driver is committed to `trip_id`
    /// - [`SagaError::Transport`] if the report could not be published
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn complete_trip(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        trip_id: TripId,
        actual_fare: f64,
        actual_duration_minutes: u32,
    ) -> Result<(), SagaError> {
        authorize(actor, driver_id)?;
        if !actual_fare.is_finite() || actual_fare < 0.0 {
            return Err(SagaError::Validation(
                "actual fare must be a non-negative number".into(),
            ));
        }
        self.require_commitment(driver_id, trip_id).await?;

        self.request(LifecycleEvent::TripCompleted(TripCompleted {
            trip_id,
            driver_id: driver_id.clone(),
            actual_fare,
            actual_duration: actual_duration_minutes,
            origin: EventOrigin::DriverService,
            completed_at: self.clock.now(),
        }))
        .await
    }

    async fn load(&self, driver_id: &DriverId) -> Result<DriverAvailability, SagaError> {
        retry_store(&self.config.store_retry, || self.drivers.get(driver_id))
            .await?
            .ok_or_else(|| SagaError::DriverNotFound(driver_id.clone()))
    }

    async fn require_commitment(&self, driver_id: &DriverId, trip_id: TripId) -> Result<(), SagaError> {
        let driver = self.load(driver_id).await?;
        if driver.current_trip_id == Some(trip_id) {
            Ok(())
        } else {
            Err(SagaError::Forbidden(format!(
                "driver {driver_id} is not committed to trip {trip_id}"
            )))
        }
    }

    /// Publish a driver-side request; here the publish is the whole operation,
    /// so a dropped event is an error.
    async fn request(&self, event: LifecycleEvent) -> Result<(), SagaError> {
        let subject = event.subject();
        if self.publisher.publish(&event).await {
            tracing::info!(%subject, key = %event.key(), "Driver request published");
            Ok(())
        } else {
            Err(SagaError::Transport(EventBusError::PublishFailed {
                subject: subject.as_str().to_string(),
                reason: "publish retries exhausted".to_string(),
            }))
        }
    }
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn authorize(actor: &Actor, driver_id: &DriverId) -> Result<(), SagaError> {
    match actor {
        Actor::System => Ok(()),
        Actor::Driver(caller) if caller == driver_id => Ok(()),
        _ => Err(SagaError::Forbidden(format!(
            "{actor} cannot act for driver {driver_id}"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use rideflow_core::event::Subject;
    use rideflow_testing::helpers::{driver_near_pickup, north_of, pickup};
    use rideflow_testing::{InMemoryDriverStore, InMemoryEventBus, test_clock};
    use std::time::Duration;

    fn service() -> (DispatchService, InMemoryDriverStore, InMemoryEventBus) {
        let drivers = InMemoryDriverStore::new();
        let bus = InMemoryEventBus::new();
        let fast = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .jitter(0.0)
            .build();
        let service = DispatchService::new(
            Arc::new(drivers.clone()),
            Arc::new(bus.clone()),
            Arc::new(test_clock()),
            DispatchConfig {
                store_retry: fast.clone(),
                publish_retry: fast,
                ..DispatchConfig::default()
            },
        );
        (service, drivers, bus)
    }

    fn as_driver(id: &str) -> (Actor, DriverId) {
        (Actor::Driver(DriverId::new(id)), DriverId::new(id))
    }

    #[tokio::test]
    async fn candidates_are_filtered_sorted_and_truncated() {
        let (service, drivers, _) = service();
        for (id, km) in [("a", 1.2), ("b", 4.9), ("c", 5.1), ("d", 3.0)] {
            drivers.put(driver_near_pickup(id, km));
        }
        let mut busy = driver_near_pickup("busy", 0.5);
        busy.current_trip_id = Some(TripId::new());
        drivers.put(busy);

        let found = service
            .find_candidates(pickup().coordinates, None, None)
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b"]);

        let nearest = service
            .find_candidates(pickup().coordinates, Some(10.0), Some(2))
            .await
            .unwrap();
        assert_eq!(nearest.len(), 2);
        assert_eq!(nearest[0].driver_id.as_str(), "a");
    }

    #[tokio::test]
    async fn non_positive_bounds_use_defaults() {
        let (service, drivers, _) = service();
        drivers.put(driver_near_pickup("near", 4.0));
        drivers.put(driver_near_pickup("far", 6.0));

        let found = service
            .find_candidates(pickup().coordinates, Some(-1.0), Some(0))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver_id.as_str(), "near");
    }

    #[tokio::test]
    async fn availability_changes_are_announced() {
        let (service, _, bus) = service();
        let (actor, id) = as_driver("d-1");

        let record = service.report_availability(&actor, &id, true).await.unwrap();
        assert!(record.is_online);
        service.report_availability(&actor, &id, false).await.unwrap();

        assert_eq!(bus.published_on(Subject::DriverOnline.as_str()).len(), 1);
        assert_eq!(bus.published_on(Subject::DriverOffline.as_str()).len(), 1);
        assert_eq!(bus.published_on("driver.online")[0].key, "d-1");
    }

    #[tokio::test]
    async fn location_reports_are_validated() {
        let (service, drivers, bus) = service();
        let (actor, id) = as_driver("d-1");

        let err = service.report_location(&actor, &id, 91.0, 36.8).await.unwrap_err();
        assert!(matches!(err, SagaError::Validation(_)));
        let err = service.report_location(&actor, &id, 0.0, 0.0).await.unwrap_err();
        assert!(matches!(err, SagaError::Validation(_)));
        assert!(drivers.all().is_empty());

        let here = north_of(pickup().coordinates, 1.0);
        let record = service
            .report_location(&actor, &id, here.latitude, here.longitude)
            .await
            .unwrap();
        assert_eq!(record.location, Some(here));
        assert_eq!(bus.published_on("driver.location").len(), 1);
    }

    #[tokio::test]
    async fn drivers_cannot_act_for_each_other() {
        let (service, _, _) = service();
        let (actor, _) = as_driver("d-1");
        let err = service
            .report_availability(&actor, &DriverId::new("d-2"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Forbidden(_)));
    }

    #[tokio::test]
    async fn drivers_cannot_rate_themselves() {
        let (service, drivers, _) = service();
        let (actor, id) = as_driver("d-1");
        let profile = DriverProfile {
            vehicle_model: "Toyota Axio".into(),
            rating: 5.0,
            ..DriverProfile::default()
        };

        let err = service.update_profile(&actor, &id, profile.clone()).await.unwrap_err();
        assert!(matches!(err, SagaError::Forbidden(_)));
        let err = service
            .update_profile(&Actor::System, &id, profile.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Forbidden(_)));

        // Vehicle edits that carry the stored rating go through.
        drivers
            .record_rating(&id, "rating-1", TripId::new(), 3, test_clock().now())
            .await
            .unwrap();
        let unchanged = DriverProfile {
            rating: 3.0,
            ..profile
        };
        let record = service.update_profile(&actor, &id, unchanged).await.unwrap();
        assert_eq!(record.profile.vehicle_model, "Toyota Axio");
        assert!((record.profile.rating - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn accept_requires_an_online_idle_driver() {
        let (service, drivers, bus) = service();
        let (actor, id) = as_driver("d-1");
        let trip = TripId::new();

        assert!(matches!(
            service.accept_trip(&actor, &id, trip).await,
            Err(SagaError::DriverNotFound(_))
        ));

        service.report_availability(&actor, &id, true).await.unwrap();
        service.accept_trip(&actor, &id, trip).await.unwrap();

        let LifecycleEvent::TripAccepted(request) = bus.published_events().unwrap().pop().unwrap()
        else {
            panic!("expected trip.accepted");
        };
        assert_eq!(request.origin, EventOrigin::DriverService);
        assert_eq!(request.trip_id, trip);

        let mut busy = drivers.all().pop().unwrap();
        busy.current_trip_id = Some(TripId::new());
        drivers.put(busy);
        assert!(matches!(
            service.accept_trip(&actor, &id, trip).await,
            Err(SagaError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn start_requires_commitment_to_the_trip() {
        let (service, drivers, bus) = service();
        let (actor, id) = as_driver("d-1");
        let trip = TripId::new();
        let mut record = driver_near_pickup("d-1", 1.0);
        drivers.put(record.clone());

        assert!(matches!(
            service.start_trip(&actor, &id, trip).await,
            Err(SagaError::Forbidden(_))
        ));

        record.current_trip_id = Some(trip);
        drivers.put(record);
        service.start_trip(&actor, &id, trip).await.unwrap();
        service.complete_trip(&actor, &id, trip, 240.0, 12).await.unwrap();

        let subjects: Vec<String> = bus.published().into_iter().map(|e| e.subject).collect();
        assert_eq!(subjects, vec!["trip.started", "trip.completed"]);
    }

    #[tokio::test]
    async fn unpublishable_request_is_a_transport_error() {
        let (service, drivers, bus) = service();
        let (actor, id) = as_driver("d-1");
        drivers.put(driver_near_pickup("d-1", 1.0));
        bus.fail_next_publishes(100);

        let err = service.accept_trip(&actor, &id, TripId::new()).await.unwrap_err();
        assert!(matches!(err, SagaError::Transport(_)));
    }

    #[tokio::test]
    async fn available_count_ignores_busy_and_offline() {
        let (service, drivers, _) = service();
        drivers.put(driver_near_pickup("idle", 1.0));
        let mut busy = driver_near_pickup("busy", 1.0);
        busy.current_trip_id = Some(TripId::new());
        drivers.put(busy);
        let mut offline = driver_near_pickup("off", 1.0);
        offline.is_online = false;
        drivers.put(offline);

        assert_eq!(service.available_driver_count().await.unwrap(), 1);
    }
}
