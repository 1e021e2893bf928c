//! The trip lifecycle saga.
//!
//! [`TripSaga`] owns every change to a trip. Each operation:
//!
//! 1. validates input and authorizes the [`Actor`]
//! 2. applies one conditional transition through [`TripStore::transition`]
//! 3. publishes the matching `trip.*` event with origin `trip_service`
//!
//! Step 2 is the only point of mutual exclusion. There is no in-process lock,
//! so any number of saga instances may run against the same store.
//!
//! ```text
//!  rider ──create──►┌──────────┐──trip.created──►
//!  driver ─assign──►│ TripSaga │──trip.accepted─►   (origin = trip_service)
//!  handler ────────►│  (CAS)   │──trip.started──►
//!  sweeper ─expire─►└──────────┘──trip.cancelled►
//! ```

use chrono::SubsecRound;
use crate::metrics::TripMetrics;
use crate::publisher::EventPublisher;
use crate::retry::{RetryPolicy, retry_store};
use rideflow_core::actor::Actor;
use rideflow_core::environment::Clock;
use rideflow_core::error::SagaError;
use rideflow_core::event::{
    EventOrigin, LifecycleEvent, TripAccepted, TripCancelled, TripCompleted, TripCreated,
    TripStarted,
};
use rideflow_core::event_bus::EventBus;
use rideflow_core::fare::FareSchedule;
use rideflow_core::geo::Location;
use rideflow_core::ids::{DriverId, RiderId, TripId};
use rideflow_core::store::{TransitionOutcome, TripStore};
use rideflow_core::trip::{Trip, TripStatus, TripTransition};
use std::sync::Arc;

/// Page size used when a list call asks for zero trips.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Largest page a list call returns.
pub const MAX_PAGE_SIZE: usize = 100;

/// Saga settings.
#[derive(Debug, Clone, Default)]
pub struct SagaConfig {
    /// Pricing used for estimates at creation.
    pub fare: FareSchedule,
    /// Bounds on store calls.
    pub store_retry: RetryPolicy,
    /// Bounds on event publishes.
    pub publish_retry: RetryPolicy,
}

/// What a rider asks for when requesting a trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRequest {
    /// Where to pick the rider up.
    pub pickup: Location,
    /// Where to drop the rider off.
    pub dropoff: Location,
}

/// Orchestrates the trip state machine.
#[derive(Clone)]
pub struct TripSaga {
    trips: Arc<dyn TripStore>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
}

impl TripSaga {
    /// Create a saga over `trips`, publishing on `bus`.
    #[must_use]
    pub fn new(
        trips: Arc<dyn TripStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        let publisher = EventPublisher::new(bus, config.publish_retry.clone());
        Self {
            trips,
            publisher,
            clock,
            config,
        }
    }

    /// Request a trip on behalf of a rider.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] unless the actor is a rider
    /// - [`SagaError::Validation`] for an empty rider id or unusable coordinates
    /// - [`SagaError::Store`] if the trip cannot be persisted
    #[tracing::instrument(skip(self, request), fields(actor = %actor))]
    pub async fn create_trip(&self, actor: &Actor, request: TripRequest) -> Result<Trip, SagaError> {
        let Actor::Rider(rider_id) = actor else {
            return Err(self.fail(SagaError::Forbidden("only riders can request trips".into())));
        };
        if rider_id.as_str().trim().is_empty() {
            return Err(self.fail(SagaError::Validation("rider id is required".into())));
        }
        request
            .pickup
            .coordinates
            .validate()
            .map_err(|e| self.fail(SagaError::Validation(format!("pickup: {e}"))))?;
        request
            .dropoff
            .coordinates
            .validate()
            .map_err(|e| self.fail(SagaError::Validation(format!("dropoff: {e}"))))?;

        let distance_km = request.pickup.coordinates.distance_km(&request.dropoff.coordinates);
        let estimate = self.config.fare.estimate(distance_km);
        let trip = Trip::requested(
            rider_id.clone(),
            request.pickup,
            request.dropoff,
            distance_km,
            estimate,
            self.clock.now(),
        );

        retry_store(&self.config.store_retry, || self.trips.insert(&trip))
            .await
            .map_err(|e| self.fail(e.into()))?;

        TripMetrics::record_created();
        tracing::info!(
            trip_id = %trip.id,
            rider_id = %trip.rider_id,
            distance_km = trip.estimated_distance_km,
            estimated_fare = trip.estimated_fare,
            "Trip requested"
        );

        self.publisher
            .publish(&LifecycleEvent::TripCreated(TripCreated {
                trip_id: trip.id,
                rider_id: trip.rider_id.clone(),
                pickup_latitude: trip.pickup.coordinates.latitude,
                pickup_longitude: trip.pickup.coordinates.longitude,
                dropoff_latitude: trip.dropoff.coordinates.latitude,
                dropoff_longitude: trip.dropoff.coordinates.longitude,
                estimated_fare: trip.estimated_fare,
                origin: EventOrigin::TripService,
                created_at: trip.created_at,
            }))
            .await;

        Ok(trip)
    }

    /// Bind `driver_id` to a waiting trip. Exactly one of any number of
    /// concurrent calls for the same trip succeeds.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] if a driver assigns someone else, or a rider calls
    /// - [`SagaError::Validation`] if the driver already has an unfinished trip
    /// - [`SagaError::Conflict`] if the trip already has a driver or is no longer
    ///   waiting
    /// - [`SagaError::TripNotFound`] for an unknown trip
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn assign_driver(
        &self,
        actor: &Actor,
        trip_id: TripId,
        driver_id: DriverId,
    ) -> Result<Trip, SagaError> {
        match actor {
            Actor::System => {},
            Actor::Driver(caller) if *caller == driver_id => {},
            Actor::Driver(_) => {
                return Err(self.fail(SagaError::Forbidden(
                    "drivers can only accept trips for themselves".into(),
                )));
            },
            Actor::Rider(_) => {
                return Err(self.fail(SagaError::Forbidden("riders cannot accept trips".into())));
            },
        }

        let active = retry_store(&self.config.store_retry, || {
            self.trips.active_for_driver(&driver_id)
        })
        .await
        .map_err(|e| self.fail(e.into()))?;
        if let Some(active) = active.filter(|t| t.id != trip_id) {
            return Err(self.fail(SagaError::Validation(format!(
                "driver {driver_id} is already on trip {}",
                active.id
            ))));
        }

        let trip = self
            .transition(trip_id, TripTransition::Assign { driver_id })
            .await?;
        Ok(trip)
    }

    /// Rider picked up.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Forbidden`] unless the actor is the assigned driver (or system)
    /// - [`SagaError::InvalidState`] unless the trip is `Accepted`
    /// - [`SagaError::TripNotFound`] for an unknown trip
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn start_trip(&self, actor: &Actor, trip_id: TripId) -> Result<Trip, SagaError> {
        self.authorize_driver_action(actor, trip_id).await?;
        self.transition(trip_id, TripTransition::Start).await
    }

    /// Rider dropped off.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Validation`] for a negative or non-finite fare
    /// - [`SagaError::Forbidden`] unless the actor is the assigned driver (or system)
    /// - [`SagaError::InvalidState`] unless the trip is `InProgress`
    /// - [`SagaError::TripNotFound`] for an unknown trip
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn complete_trip(
        &self,
        actor: &Actor,
        trip_id: TripId,
        actual_fare: f64,
        actual_duration_minutes: u32,
    ) -> Result<Trip, SagaError> {
        if !actual_fare.is_finite() || actual_fare < 0.0 {
            return Err(self.fail(SagaError::Validation(
                "actual fare must be a non-negative number".into(),
            )));
        }
        self.authorize_driver_action(actor, trip_id).await?;
        self.transition(
            trip_id,
            TripTransition::Complete {
                actual_fare,
                actual_duration_minutes,
            },
        )
        .await
    }

    /// Abandon a trip that has not finished.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Validation`] for an empty reason
    /// - [`SagaError::TripNotFound`] for an unknown trip, or a rider cancelling
    ///   someone else's trip
    /// - [`SagaError::Forbidden`] for a driver not assigned to the trip
    /// - [`SagaError::InvalidState`] if the trip is already terminal
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn cancel_trip(
        &self,
        actor: &Actor,
        trip_id: TripId,
        reason: &str,
    ) -> Result<Trip, SagaError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(self.fail(SagaError::Validation(
                "a cancellation reason is required".into(),
            )));
        }

        match actor {
            Actor::System => {},
            Actor::Rider(_) => {
                self.load_visible(actor, trip_id).await?;
            },
            Actor::Driver(_) => {
                self.authorize_driver_action(actor, trip_id).await?;
            },
        }

        self.transition(
            trip_id,
            TripTransition::Cancel {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Cancel a request that has waited too long, unless it was accepted in
    /// the meantime. Returns the cancelled trip, or `None` if it no longer
    /// qualified.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] on storage failure.
    #[tracing::instrument(skip(self))]
    pub async fn expire_trip(&self, trip_id: TripId) -> Result<Option<Trip>, SagaError> {
        match self.transition(trip_id, TripTransition::Expire).await {
            Ok(trip) => Ok(Some(trip)),
            Err(SagaError::InvalidState { current, .. }) => {
                tracing::debug!(%trip_id, %current, "Trip no longer waiting, not expired");
                Ok(None)
            },
            Err(SagaError::TripNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load one trip.
    ///
    /// # Errors
    ///
    /// - [`SagaError::TripNotFound`] if missing, or owned by another rider
    /// - [`SagaError::Forbidden`] for a driver not assigned to an accepted trip
    pub async fn get_trip(&self, actor: &Actor, trip_id: TripId) -> Result<Trip, SagaError> {
        self.load_visible(actor, trip_id).await
    }

    /// Page through a rider's trips, newest first. A `limit` of zero means
    /// [`DEFAULT_PAGE_SIZE`]; larger limits are capped at [`MAX_PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// [`SagaError::Forbidden`] unless the actor is that rider (or system).
    pub async fn list_trips_for_rider(
        &self,
        actor: &Actor,
        rider_id: &RiderId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Trip>, SagaError> {
        self.authorize_rider(actor, rider_id)?;
        let limit = page_size(limit);
        retry_store(&self.config.store_retry, || {
            self.trips.list_for_rider(rider_id, limit, offset)
        })
        .await
        .map_err(|e| self.fail(e.into()))
    }

    /// The rider's current unfinished trip, if any.
    ///
    /// # Errors
    ///
    /// [`SagaError::Forbidden`] unless the actor is that rider (or system).
    pub async fn active_trip_for_rider(
        &self,
        actor: &Actor,
        rider_id: &RiderId,
    ) -> Result<Option<Trip>, SagaError> {
        self.authorize_rider(actor, rider_id)?;
        retry_store(&self.config.store_retry, || self.trips.active_for_rider(rider_id))
            .await
            .map_err(|e| self.fail(e.into()))
    }

    /// Page through a driver's trips, newest first. A `limit` of zero means
    /// [`DEFAULT_PAGE_SIZE`]; larger limits are capped at [`MAX_PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// [`SagaError::Forbidden`] unless the actor is that driver (or system).
    pub async fn list_trips_for_driver(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Trip>, SagaError> {
        self.authorize_driver(actor, driver_id)?;
        let limit = page_size(limit);
        retry_store(&self.config.store_retry, || {
            self.trips.list_for_driver(driver_id, limit, offset)
        })
        .await
        .map_err(|e| self.fail(e.into()))
    }

    /// The driver's current unfinished trip, if any.
    ///
    /// # Errors
    ///
    /// [`SagaError::Forbidden`] unless the actor is that driver (or system).
    pub async fn active_trip_for_driver(
        &self,
        actor: &Actor,
        driver_id: &DriverId,
    ) -> Result<Option<Trip>, SagaError> {
        self.authorize_driver(actor, driver_id)?;
        retry_store(&self.config.store_retry, || self.trips.active_for_driver(driver_id))
            .await
            .map_err(|e| self.fail(e.into()))
    }

    async fn transition(
        &self,
        trip_id: TripId,
        transition: TripTransition,
    ) -> Result<Trip, SagaError> {
        let now = self.clock.now();
        let mut attempts = 0_usize;
        let outcome = retry_store(&self.config.store_retry, || {
            attempts += 1;
            self.trips.transition(trip_id, transition.clone(), now)
        })
        .await
        .map_err(|e| self.fail(e.into()))?;

        let trip = match outcome {
            TransitionOutcome::Applied(trip) => trip,
            // An earlier attempt may have committed before its reply was lost.
            TransitionOutcome::Rejected(current)
                if attempts > 1 && already_applied(&current, &transition, now) =>
            {
                current
            },
            TransitionOutcome::Rejected(current) => {
                let err = if matches!(transition, TripTransition::Assign { .. }) {
                    TripMetrics::record_conflict();
                    tracing::info!(
                        %trip_id,
                        status = %current.status,
                        "Assignment lost: trip no longer available"
                    );
                    SagaError::Conflict(trip_id)
                } else {
                    SagaError::InvalidState {
                        trip_id,
                        current: current.status,
                        attempted: transition.name(),
                    }
                };
                return Err(self.fail(err));
            },
            TransitionOutcome::NotFound => {
                return Err(self.fail(SagaError::TripNotFound(trip_id)));
            },
        };

        TripMetrics::record_transition(transition.name());
        tracing::info!(
            %trip_id,
            transition = transition.name(),
            status = %trip.status,
            driver_id = trip.driver_id.as_ref().map(DriverId::as_str),
            "Trip transition committed"
        );

        if let Some(event) = lifecycle_event(&trip) {
            self.publisher.publish(&event).await;
        }
        Ok(trip)
    }

    async fn load(&self, trip_id: TripId) -> Result<Trip, SagaError> {
        retry_store(&self.config.store_retry, || self.trips.get(trip_id))
            .await
            .map_err(|e| self.fail(e.into()))?
            .ok_or_else(|| self.fail(SagaError::TripNotFound(trip_id)))
    }

    async fn load_visible(&self, actor: &Actor, trip_id: TripId) -> Result<Trip, SagaError> {
        let trip = self.load(trip_id).await?;
        if actor.can_view(&trip) {
            return Ok(trip);
        }
        Err(self.fail(match actor {
            Actor::Rider(_) => SagaError::TripNotFound(trip_id),
            _ => SagaError::Forbidden(format!("{actor} is not a participant of trip {trip_id}")),
        }))
    }

    async fn authorize_driver_action(&self, actor: &Actor, trip_id: TripId) -> Result<(), SagaError> {
        match actor {
            Actor::System => Ok(()),
            Actor::Rider(_) => Err(self.fail(SagaError::Forbidden(
                "only the assigned driver can do this".into(),
            ))),
            Actor::Driver(_) => {
                let trip = self.load(trip_id).await?;
                if actor.is_assigned_driver(&trip) {
                    Ok(())
                } else {
                    Err(self.fail(SagaError::Forbidden(format!(
                        "{actor} is not assigned to trip {trip_id}"
                    ))))
                }
            },
        }
    }

    fn authorize_rider(&self, actor: &Actor, rider_id: &RiderId) -> Result<(), SagaError> {
        match actor {
            Actor::System => Ok(()),
            Actor::Rider(caller) if caller == rider_id => Ok(()),
            _ => Err(self.fail(SagaError::Forbidden(format!(
                "{actor} cannot read trips of rider {rider_id}"
            )))),
        }
    }

    fn authorize_driver(&self, actor: &Actor, driver_id: &DriverId) -> Result<(), SagaError> {
        match actor {
            Actor::System => Ok(()),
            Actor::Driver(caller) if caller == driver_id => Ok(()),
            _ => Err(self.fail(SagaError::Forbidden(format!(
                "{actor} cannot read trips of driver {driver_id}"
            )))),
        }
    }

    #[allow(clippy::unused_self)]
    fn fail(&self, err: SagaError) -> SagaError {
        TripMetrics::record_error(err.kind());
        if err.is_retryable() {
            tracing::warn!(error = %err, "Trip operation failed");
        } else {
            tracing::debug!(error = %err, "Trip operation rejected");
        }
        err
    }
}

impl std::fmt::Debug for TripSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripSaga")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const fn page_size(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_PAGE_SIZE
    } else if limit > MAX_PAGE_SIZE {
        MAX_PAGE_SIZE
    } else {
        limit
    }
}

/// Whether `current` is exactly what applying `transition` at `now` would have produced.
fn already_applied(
    current: &Trip,
    transition: &TripTransition,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    // Stores may keep timestamps at microsecond precision.
    if current.status != transition.target()
        || current.updated_at.trunc_subsecs(6) != now.trunc_subsecs(6)
    {
        return false;
    }
    match transition {
        TripTransition::Assign { driver_id } => current.driver_id.as_ref() == Some(driver_id),
        TripTransition::Complete {
            actual_fare,
            actual_duration_minutes,
        } => {
            current.actual_fare == Some(*actual_fare)
                && current.actual_duration_minutes == Some(*actual_duration_minutes)
        },
        TripTransition::Cancel { reason } => current.cancellation_reason.as_deref() == Some(reason),
        TripTransition::Start | TripTransition::Expire => true,
    }
}

/// The authoritative event describing `trip`'s current status.
fn lifecycle_event(trip: &Trip) -> Option<LifecycleEvent> {
    let origin = EventOrigin::TripService;
    match trip.status {
        TripStatus::Requested => None,
        TripStatus::Accepted => Some(LifecycleEvent::TripAccepted(TripAccepted {
            trip_id: trip.id,
            driver_id: trip.driver_id.clone()?,
            rider_id: Some(trip.rider_id.clone()),
            origin,
            timestamp: trip.accepted_at.unwrap_or(trip.updated_at),
        })),
        TripStatus::InProgress => Some(LifecycleEvent::TripStarted(TripStarted {
            trip_id: trip.id,
            driver_id: trip.driver_id.clone()?,
            origin,
            started_at: trip.started_at.unwrap_or(trip.updated_at),
        })),
        TripStatus::Completed => Some(LifecycleEvent::TripCompleted(TripCompleted {
            trip_id: trip.id,
            driver_id: trip.driver_id.clone()?,
            actual_fare: trip.actual_fare.unwrap_or_default(),
            actual_duration: trip.actual_duration_minutes.unwrap_or_default(),
            origin,
            completed_at: trip.completed_at.unwrap_or(trip.updated_at),
        })),
        TripStatus::Cancelled => Some(LifecycleEvent::TripCancelled(TripCancelled {
            trip_id: trip.id,
            rider_id: trip.rider_id.clone(),
            driver_id: trip.driver_id.clone(),
            reason: trip.cancellation_reason.clone().unwrap_or_default(),
            origin,
            cancelled_at: trip.cancelled_at.unwrap_or(trip.updated_at),
        })),
    }
}
