//! In-memory trip and driver stores.
//!
//! Both keep their records behind a single `RwLock`. A trip transition checks
//! and writes under one write guard, which gives the same all-or-nothing
//! behaviour as the conditional `UPDATE` of the Postgres store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chrono::{DateTime, Utc};
use rideflow_core::driver::{DriverAvailability, DriverProfile};
use rideflow_core::geo::Coordinates;
use rideflow_core::ids::{DriverId, RiderId, TripId};
use rideflow_core::store::{DriverStore, StoreError, StoreFuture, TransitionOutcome, TripStore};
use rideflow_core::trip::{Trip, TripStatus, TripTransition};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Shared failure injection: the next `n` calls return [`StoreError::Unavailable`].
#[derive(Debug, Default)]
struct Faults(AtomicUsize);

impl Faults {
    fn set(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        let took = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn newest_first(mut trips: Vec<Trip>) -> Vec<Trip> {
    trips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    trips
}

fn page(trips: Vec<Trip>, limit: usize, offset: usize) -> Vec<Trip> {
    newest_first(trips).into_iter().skip(offset).take(limit).collect()
}

/// In-memory [`TripStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryTripStore {
    trips: Arc<RwLock<HashMap<TripId, Trip>>>,
    faults: Arc<Faults>,
}

impl InMemoryTripStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.faults.set(n);
    }

    /// Number of stored trips.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trips.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trips.read().unwrap().is_empty()
    }

    /// Overwrite a record directly, bypassing the state machine. For test setup only.
    pub fn put(&self, trip: Trip) {
        self.trips.write().unwrap().insert(trip.id, trip);
    }
}

impl TripStore for InMemoryTripStore {
    fn insert(&self, trip: &Trip) -> StoreFuture<'_, ()> {
        let trip = trip.clone();
        Box::pin(async move {
            self.faults.check()?;
            let mut trips = self.trips.write().unwrap();
            if trips.contains_key(&trip.id) {
                return Err(StoreError::Duplicate(trip.id.to_string()));
            }
            trips.insert(trip.id, trip);
            Ok(())
        })
    }

    fn get(&self, id: TripId) -> StoreFuture<'_, Option<Trip>> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.trips.read().unwrap().get(&id).cloned())
        })
    }

    fn transition(
        &self,
        id: TripId,
        transition: TripTransition,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, TransitionOutcome> {
        Box::pin(async move {
            self.faults.check()?;
            let mut trips = self.trips.write().unwrap();
            let Some(current) = trips.get_mut(&id) else {
                return Ok(TransitionOutcome::NotFound);
            };
            match current.apply(&transition, now) {
                Ok(next) => {
                    *current = next.clone();
                    Ok(TransitionOutcome::Applied(next))
                },
                Err(_) => Ok(TransitionOutcome::Rejected(current.clone())),
            }
        })
    }

    fn list_for_rider<'a>(
        &'a self,
        rider_id: &'a RiderId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>> {
        Box::pin(async move {
            self.faults.check()?;
            let trips = self.trips.read().unwrap();
            let mine = trips.values().filter(|t| &t.rider_id == rider_id).cloned().collect();
            Ok(page(mine, limit, offset))
        })
    }

    fn list_for_driver<'a>(
        &'a self,
        driver_id: &'a DriverId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>> {
        Box::pin(async move {
            self.faults.check()?;
            let trips = self.trips.read().unwrap();
            let mine = trips
                .values()
                .filter(|t| t.driver_id.as_ref() == Some(driver_id))
                .cloned()
                .collect();
            Ok(page(mine, limit, offset))
        })
    }

    fn active_for_rider<'a>(&'a self, rider_id: &'a RiderId) -> StoreFuture<'a, Option<Trip>> {
        Box::pin(async move {
            self.faults.check()?;
            let trips = self.trips.read().unwrap();
            let active = trips
                .values()
                .filter(|t| &t.rider_id == rider_id && !t.status.is_terminal())
                .cloned()
                .collect();
            Ok(newest_first(active).into_iter().next())
        })
    }

    fn active_for_driver<'a>(
        &'a self,
        driver_id: &'a DriverId,
    ) -> StoreFuture<'a, Option<Trip>> {
        Box::pin(async move {
            self.faults.check()?;
            let trips = self.trips.read().unwrap();
            let active = trips
                .values()
                .filter(|t| t.driver_id.as_ref() == Some(driver_id) && !t.status.is_terminal())
                .cloned()
                .collect();
            Ok(newest_first(active).into_iter().next())
        })
    }

    fn list_expired_requests(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<TripId>> {
        Box::pin(async move {
            self.faults.check()?;
            let trips = self.trips.read().unwrap();
            let mut stale: Vec<&Trip> = trips
                .values()
                .filter(|t| t.status == TripStatus::Requested && t.created_at < cutoff)
                .collect();
            stale.sort_by_key(|t| t.created_at);
            Ok(stale.into_iter().take(limit).map(|t| t.id).collect())
        })
    }
}

/// In-memory [`DriverStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDriverStore {
    drivers: Arc<RwLock<HashMap<DriverId, DriverAvailability>>>,
    ratings: Arc<RwLock<HashMap<String, (DriverId, u8)>>>,
    faults: Arc<Faults>,
}

impl InMemoryDriverStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.faults.set(n);
    }

    /// Insert or replace a record directly. For test setup only.
    pub fn put(&self, driver: DriverAvailability) {
        self.drivers
            .write()
            .unwrap()
            .insert(driver.driver_id.clone(), driver);
    }

    /// Snapshot of every record, ordered by driver id.
    #[must_use]
    pub fn all(&self) -> Vec<DriverAvailability> {
        let mut all: Vec<_> = self.drivers.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        all
    }

    fn upsert(
        &self,
        driver_id: &DriverId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut DriverAvailability),
    ) -> DriverAvailability {
        let mut drivers = self.drivers.write().unwrap();
        let record = drivers
            .entry(driver_id.clone())
            .or_insert_with(|| DriverAvailability::new(driver_id.clone(), now));
        f(record);
        record.updated_at = now;
        record.clone()
    }

    fn update_if(
        &self,
        driver_id: &DriverId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut DriverAvailability) -> bool,
    ) -> bool {
        let mut drivers = self.drivers.write().unwrap();
        let Some(record) = drivers.get_mut(driver_id) else {
            return false;
        };
        let changed = f(record);
        if changed {
            record.updated_at = now;
        }
        changed
    }
}

impl DriverStore for InMemoryDriverStore {
    fn get<'a>(&'a self, driver_id: &'a DriverId) -> StoreFuture<'a, Option<DriverAvailability>> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.drivers.read().unwrap().get(driver_id).cloned())
        })
    }

    fn set_online<'a>(
        &'a self,
        driver_id: &'a DriverId,
        online: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.upsert(driver_id, now, |d| d.is_online = online))
        })
    }

    fn set_location<'a>(
        &'a self,
        driver_id: &'a DriverId,
        location: Coordinates,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.upsert(driver_id, now, |d| d.location = Some(location)))
        })
    }

    fn upsert_profile<'a>(
        &'a self,
        driver_id: &'a DriverId,
        profile: DriverProfile,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.upsert(driver_id, now, |d| {
                d.profile = DriverProfile {
                    rating: d.profile.rating,
                    ..profile
                };
            }))
        })
    }

    fn list_dispatchable(&self) -> StoreFuture<'_, Vec<DriverAvailability>> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self
                .drivers
                .read()
                .unwrap()
                .values()
                .filter(|d| d.is_dispatchable())
                .cloned()
                .collect())
        })
    }

    fn count_available(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.faults.check()?;
            let drivers = self.drivers.read().unwrap();
            let n = drivers
                .values()
                .filter(|d| d.is_online && d.current_trip_id.is_none())
                .count();
            Ok(u64::try_from(n).unwrap_or(u64::MAX))
        })
    }

    fn claim_for_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check()?;
            let mut drivers = self.drivers.write().unwrap();
            let record = drivers
                .entry(driver_id.clone())
                .or_insert_with(|| DriverAvailability::new(driver_id.clone(), now));
            match record.current_trip_id {
                Some(current) if current != trip_id => Ok(false),
                _ => {
                    record.current_trip_id = Some(trip_id);
                    record.updated_at = now;
                    Ok(true)
                },
            }
        })
    }

    fn release_from_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.update_if(driver_id, now, |d| {
                if d.current_trip_id == Some(trip_id) {
                    d.current_trip_id = None;
                    true
                } else {
                    false
                }
            }))
        })
    }

    fn record_completion<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.update_if(driver_id, now, |d| {
                if d.current_trip_id == Some(trip_id) {
                    d.current_trip_id = None;
                    d.completed_trips += 1;
                    true
                } else {
                    false
                }
            }))
        })
    }

    fn record_rating<'a>(
        &'a self,
        driver_id: &'a DriverId,
        rating_id: &'a str,
        _trip_id: TripId,
        score: u8,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check()?;
            let mut drivers = self.drivers.write().unwrap();
            let mut ratings = self.ratings.write().unwrap();
            if ratings.contains_key(rating_id) {
                return Ok(false);
            }
            ratings.insert(rating_id.to_string(), (driver_id.clone(), score));

            let scores: Vec<f64> = ratings
                .values()
                .filter(|(rated, _)| rated == driver_id)
                .map(|(_, score)| f64::from(*score))
                .collect();
            #[allow(clippy::cast_precision_loss)]
            let average = scores.iter().sum::<f64>() / scores.len() as f64;

            let record = drivers
                .entry(driver_id.clone())
                .or_insert_with(|| DriverAvailability::new(driver_id.clone(), now));
            record.profile.rating = average;
            record.updated_at = now;
            Ok(true)
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use rideflow_core::fare::FareSchedule;
    use rideflow_core::geo::Location;

    fn trip_at(rider: &str, created_at: DateTime<Utc>) -> Trip {
        Trip::requested(
            RiderId::new(rider),
            Location::new(-1.28, 36.81, "A"),
            Location::new(-1.30, 36.82, "B"),
            2.4,
            FareSchedule::default().estimate(2.4),
            created_at,
        )
    }

    #[tokio::test]
    async fn rejected_transition_leaves_record_untouched() {
        let store = InMemoryTripStore::new();
        let now = Utc::now();
        let trip = trip_at("r", now);
        store.insert(&trip).await.unwrap();

        let outcome = store.transition(trip.id, TripTransition::Start, now).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected(trip.clone()));
        assert_eq!(store.get(trip.id).await.unwrap(), Some(trip));
    }

    #[tokio::test]
    async fn duplicate_insert_is_refused() {
        let store = InMemoryTripStore::new();
        let trip = trip_at("r", Utc::now());
        store.insert(&trip).await.unwrap();
        assert!(matches!(store.insert(&trip).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn rider_listing_is_newest_first_and_paged() {
        let store = InMemoryTripStore::new();
        let base = Utc::now();
        for i in 0..5 {
            store.insert(&trip_at("r", base + chrono::Duration::seconds(i))).await.unwrap();
        }
        store.insert(&trip_at("other", base)).await.unwrap();

        let rider = RiderId::new("r");
        let first = store.list_for_rider(&rider, 2, 0).await.unwrap();
        let rest = store.list_for_rider(&rider, 10, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);
        assert!(first[0].created_at > first[1].created_at);
        assert!(first[1].created_at > rest[0].created_at);
    }

    #[tokio::test]
    async fn expired_requests_exclude_recent_and_assigned_trips() {
        let store = InMemoryTripStore::new();
        let now = Utc::now();
        let old = trip_at("r1", now - chrono::Duration::minutes(10));
        let old_accepted = trip_at("r2", now - chrono::Duration::minutes(10));
        let fresh = trip_at("r3", now);
        for t in [&old, &old_accepted, &fresh] {
            store.insert(t).await.unwrap();
        }
        store
            .transition(
                old_accepted.id,
                TripTransition::Assign {
                    driver_id: DriverId::new("d"),
                },
                now,
            )
            .await
            .unwrap();

        let cutoff = now - chrono::Duration::minutes(5);
        assert_eq!(store.list_expired_requests(cutoff, 10).await.unwrap(), vec![old.id]);
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_consumed() {
        let store = InMemoryTripStore::new();
        store.fail_next(1);
        let err = store.get(TripId::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get(TripId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn completion_counts_once_and_only_for_the_current_trip() {
        let store = InMemoryDriverStore::new();
        let driver = DriverId::new("d-1");
        let now = Utc::now();
        let trip = TripId::new();

        store.set_online(&driver, true, now).await.unwrap();
        assert!(store.claim_for_trip(&driver, trip, now).await.unwrap());
        assert_eq!(store.count_available().await.unwrap(), 0);

        assert!(!store.record_completion(&driver, TripId::new(), now).await.unwrap());
        assert!(store.record_completion(&driver, trip, now).await.unwrap());
        assert!(!store.record_completion(&driver, trip, now).await.unwrap());

        let record = store.get(&driver).await.unwrap().expect("record exists");
        assert_eq!(record.completed_trips, 1);
        assert_eq!(record.current_trip_id, None);
        assert_eq!(store.count_available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_release_does_not_free_a_newer_commitment() {
        let store = InMemoryDriverStore::new();
        let driver = DriverId::new("d-1");
        let now = Utc::now();
        let (old, new) = (TripId::new(), TripId::new());

        assert!(store.claim_for_trip(&driver, new, now).await.unwrap());
        assert!(!store.release_from_trip(&driver, old, now).await.unwrap());
        let record = store.get(&driver).await.unwrap().expect("record exists");
        assert_eq!(record.current_trip_id, Some(new));
    }

    #[tokio::test]
    async fn claim_never_overwrites_another_commitment() {
        let store = InMemoryDriverStore::new();
        let driver = DriverId::new("d-1");
        let now = Utc::now();
        let (first, second) = (TripId::new(), TripId::new());

        assert!(store.claim_for_trip(&driver, first, now).await.unwrap());
        // Replays of the same commitment are accepted.
        assert!(store.claim_for_trip(&driver, first, now).await.unwrap());
        assert!(!store.claim_for_trip(&driver, second, now).await.unwrap());

        let record = store.get(&driver).await.unwrap().expect("record exists");
        assert_eq!(record.current_trip_id, Some(first));

        assert!(store.record_completion(&driver, first, now).await.unwrap());
        assert!(store.claim_for_trip(&driver, second, now).await.unwrap());
    }

    #[tokio::test]
    async fn rating_is_the_average_of_distinct_ratings() {
        let store = InMemoryDriverStore::new();
        let driver = DriverId::new("d-1");
        let now = Utc::now();
        let trip = TripId::new();

        assert!(store.record_rating(&driver, "r-1", trip, 5, now).await.unwrap());
        assert!(store.record_rating(&driver, "r-2", trip, 4, now).await.unwrap());
        // Redelivery of the same rating is ignored.
        assert!(!store.record_rating(&driver, "r-2", trip, 4, now).await.unwrap());
        store
            .record_rating(&DriverId::new("d-2"), "r-3", trip, 1, now)
            .await
            .unwrap();

        let record = store.get(&driver).await.unwrap().expect("record exists");
        assert!((record.profile.rating - 4.5).abs() < 1e-9);

        // Profile updates keep the aggregated rating.
        let profile = DriverProfile {
            vehicle_model: "Corolla".into(),
            rating: 1.0,
            ..DriverProfile::default()
        };
        let updated = store.upsert_profile(&driver, profile, now).await.unwrap();
        assert_eq!(updated.profile.vehicle_model, "Corolla");
        assert!((updated.profile.rating - 4.5).abs() < 1e-9);
    }
}
