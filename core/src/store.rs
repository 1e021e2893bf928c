//! Storage contracts for trips and driver availability.
//!
//! Two stores, two owners. The trip side is the only writer of [`TripStore`];
//! the driver side is the only writer of [`DriverStore`].
//!
//! # Atomic transitions
//!
//! [`TripStore::transition`] is a compare-and-swap: the store applies the
//! transition only if the stored trip currently permits it (see
//! [`Trip::permits`]), and does so in a single atomic step. Callers never
//! read-then-write. This is what makes N concurrent assignments produce exactly
//! one winner without any in-process lock.
//!
//! # Implementations
//!
//! - `InMemoryTripStore` / `InMemoryDriverStore` (`rideflow-testing`)
//! - `PostgresTripStore` / `PostgresDriverStore` (`rideflow-postgres`)

use crate::driver::{DriverAvailability, DriverProfile};
use crate::geo::Coordinates;
use crate::ids::{DriverId, RiderId, TripId};
use crate::trip::{Trip, TripTransition};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Connection refused, dropped, or pool exhausted.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish within its deadline.
    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A record with the same identity already exists.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Query failed for a reason retrying will not fix.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored row could not be decoded into a domain value.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Result of a conditional transition.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    /// The transition was applied; carries the updated record.
    Applied(Trip),
    /// The stored trip did not permit the transition; carries it unchanged.
    Rejected(Trip),
    /// No trip with that id.
    NotFound,
}

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence for [`Trip`] records.
///
/// List methods return newest first (by `created_at`). A trip is "active" while
/// its status is one of [`TripStatus::ACTIVE`](crate::trip::TripStatus::ACTIVE).
pub trait TripStore: Send + Sync {
    /// Persist a freshly requested trip.
    ///
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] if the id is already taken; other variants on
    /// storage failure.
    fn insert(&self, trip: &Trip) -> StoreFuture<'_, ()>;

    /// Load a trip by id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn get(&self, id: TripId) -> StoreFuture<'_, Option<Trip>>;

    /// Apply `transition` at `now` if, and only if, the stored trip permits it.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure. A refused transition is not
    /// an error; it is reported as [`TransitionOutcome::Rejected`].
    fn transition(
        &self,
        id: TripId,
        transition: TripTransition,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, TransitionOutcome>;

    /// Page through a rider's trips.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn list_for_rider<'a>(
        &'a self,
        rider_id: &'a RiderId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>>;

    /// Page through a driver's trips.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn list_for_driver<'a>(
        &'a self,
        driver_id: &'a DriverId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>>;

    /// The rider's most recent active trip, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn active_for_rider<'a>(&'a self, rider_id: &'a RiderId) -> StoreFuture<'a, Option<Trip>>;

    /// The driver's most recent active trip, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn active_for_driver<'a>(&'a self, driver_id: &'a DriverId)
    -> StoreFuture<'a, Option<Trip>>;

    /// Ids of `Requested` trips created strictly before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn list_expired_requests(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<TripId>>;
}

/// Persistence for [`DriverAvailability`] records.
///
/// Writes are last-write-wins per driver. Every write creates the record if it
/// does not exist yet. Records are never deleted.
pub trait DriverStore: Send + Sync {
    /// Load a driver's record.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn get<'a>(&'a self, driver_id: &'a DriverId) -> StoreFuture<'a, Option<DriverAvailability>>;

    /// Set the online flag.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn set_online<'a>(
        &'a self,
        driver_id: &'a DriverId,
        online: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability>;

    /// Record the driver's latest position.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn set_location<'a>(
        &'a self,
        driver_id: &'a DriverId,
        location: Coordinates,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability>;

    /// Replace the vehicle details. The rating is left untouched; it only
    /// changes through [`DriverStore::record_rating`].
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn upsert_profile<'a>(
        &'a self,
        driver_id: &'a DriverId,
        profile: DriverProfile,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability>;

    /// All drivers that are online, idle and have reported a position.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn list_dispatchable(&self) -> StoreFuture<'_, Vec<DriverAvailability>>;

    /// Number of drivers that are online and idle.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn count_available(&self) -> StoreFuture<'_, u64>;

    /// Mark the driver as committed to `trip_id`, creating the record if
    /// needed. Applies only while the driver is idle or already committed to
    /// the same trip; returns whether the commitment is now `trip_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn claim_for_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Clear the commitment, but only if it is still `trip_id`. Returns whether
    /// anything changed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn release_from_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Clear the commitment to `trip_id` and count one completed trip. Applies
    /// only while the driver is committed to `trip_id`, so a repeated delivery
    /// counts nothing. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn record_completion<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Store one rider rating of the driver and set the profile rating to the
    /// average of every rating stored for them. A `rating_id` seen before
    /// changes nothing. Returns whether the rating was new.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    fn record_rating<'a>(
        &'a self,
        driver_id: &'a DriverId,
        rating_id: &'a str,
        trip_id: TripId,
        score: u8,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;
}
