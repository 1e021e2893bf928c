//! Driver availability records and candidate ranking.

use crate::geo::{haversine_km, Coordinates};
use crate::ids::{DriverId, TripId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Search radius used when the caller gives none (or a non-positive one).
pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 5.0;

/// Result size used when the caller gives none (or zero).
pub const DEFAULT_CANDIDATE_LIMIT: usize = 10;

/// Lowest score a rider may give.
pub const MIN_RATING_SCORE: i32 = 1;

/// Highest score a rider may give.
pub const MAX_RATING_SCORE: i32 = 5;

/// Vehicle and reputation details shown to riders.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    /// e.g. `sedan`, `motorbike`.
    pub vehicle_type: String,
    /// e.g. `Toyota Corolla`.
    pub vehicle_model: String,
    /// Body colour.
    pub vehicle_color: String,
    /// Registration plate.
    pub plate_number: String,
    /// Average of rider ratings, 0.0 when unrated. Maintained from
    /// `rating.created`; never written by the driver.
    pub rating: f64,
}

/// Last known state of a driver, as seen by the driver side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverAvailability {
    /// Driver identity.
    pub driver_id: DriverId,
    /// Whether the driver is accepting trips.
    pub is_online: bool,
    /// Last reported position; `None` until the first location report.
    pub location: Option<Coordinates>,
    /// Trip the driver is committed to, if any.
    pub current_trip_id: Option<TripId>,
    /// Lifetime count of completed trips.
    pub completed_trips: u64,
    /// Vehicle and rating snapshot.
    pub profile: DriverProfile,
    /// Last write to this record.
    pub updated_at: DateTime<Utc>,
}

impl DriverAvailability {
    /// A fresh, offline record with no position.
    #[must_use]
    pub fn new(driver_id: DriverId, now: DateTime<Utc>) -> Self {
        Self {
            driver_id,
            is_online: false,
            location: None,
            current_trip_id: None,
            completed_trips: 0,
            profile: DriverProfile::default(),
            updated_at: now,
        }
    }

    /// Online, idle and positioned: eligible to be offered a trip.
    #[must_use]
    pub const fn is_dispatchable(&self) -> bool {
        self.is_online && self.current_trip_id.is_none() && self.location.is_some()
    }
}

/// A driver offered as a match for a pickup point. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchCandidate {
    /// Candidate driver.
    pub driver_id: DriverId,
    /// Great-circle distance from the pickup point.
    pub distance_km: f64,
    /// Vehicle and rating snapshot at query time.
    pub profile: DriverProfile,
}

/// Normalize caller-supplied search bounds.
#[must_use]
pub fn search_bounds(radius_km: Option<f64>, limit: Option<usize>) -> (f64, usize) {
    let radius = match radius_km {
        Some(r) if r.is_finite() && r > 0.0 => r,
        _ => DEFAULT_SEARCH_RADIUS_KM,
    };
    let limit = match limit {
        Some(l) if l > 0 => l,
        _ => DEFAULT_CANDIDATE_LIMIT,
    };
    (radius, limit)
}

/// Rank dispatchable drivers by distance from `pickup`.
///
/// Keeps drivers within `radius_km` (inclusive), sorts nearest first with ties
/// broken by driver id, and truncates to `limit`. Drivers that are offline,
/// busy or have never reported a position are skipped.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use rideflow_core::driver::{rank_candidates, DriverAvailability};
/// use rideflow_core::geo::Coordinates;
/// use rideflow_core::ids::DriverId;
///
/// let pickup = Coordinates::new(-1.2864, 36.8172);
/// let mut near = DriverAvailability::new(DriverId::new("near"), Utc::now());
/// near.is_online = true;
/// near.location = Some(Coordinates::new(-1.2900, 36.8172));
///
/// let ranked = rank_candidates(pickup, &[near], 5.0, 10);
/// assert_eq!(ranked.len(), 1);
/// assert_eq!(ranked[0].driver_id.as_str(), "near");
/// ```
#[must_use]
pub fn rank_candidates(
    pickup: Coordinates,
    drivers: &[DriverAvailability],
    radius_km: f64,
    limit: usize,
) -> Vec<DispatchCandidate> {
    let mut candidates: Vec<DispatchCandidate> = drivers
        .iter()
        .filter(|d| d.is_dispatchable())
        .filter_map(|d| {
            let position = d.location?;
            let distance_km = haversine_km(pickup, position);
            (distance_km <= radius_km).then(|| DispatchCandidate {
                driver_id: d.driver_id.clone(),
                distance_km,
                profile: d.profile.clone(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_KM;
    use proptest::prelude::*;

    const PICKUP: Coordinates = Coordinates::new(10.0, 20.0);

    /// A point due north of `PICKUP` at `km` great-circle distance.
    fn north_of_pickup(km: f64) -> Coordinates {
        let dlat = (km / EARTH_RADIUS_KM).to_degrees();
        Coordinates::new(PICKUP.latitude + dlat, PICKUP.longitude)
    }

    fn online(id: &str, km: f64) -> DriverAvailability {
        let mut d = DriverAvailability::new(DriverId::new(id), Utc::now());
        d.is_online = true;
        d.location = Some(north_of_pickup(km));
        d
    }

    #[test]
    fn keeps_drivers_inside_radius_nearest_first() {
        let drivers = vec![
            online("a", 1.2),
            online("b", 4.9),
            online("c", 5.1),
            online("d", 3.0),
        ];

        let ranked = rank_candidates(PICKUP, &drivers, 5.0, 10);
        let distances: Vec<f64> = ranked.iter().map(|c| (c.distance_km * 10.0).round() / 10.0).collect();
        assert_eq!(distances, vec![1.2, 3.0, 4.9]);
        let ids: Vec<&str> = ranked.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b"]);
    }

    #[test]
    fn ties_are_broken_by_driver_id() {
        let drivers = vec![online("zed", 2.0), online("amy", 2.0), online("kim", 2.0)];
        let ranked = rank_candidates(PICKUP, &drivers, 5.0, 2);
        let ids: Vec<&str> = ranked.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["amy", "kim"]);
    }

    #[test]
    fn skips_offline_busy_and_unpositioned_drivers() {
        let mut offline = online("offline", 1.0);
        offline.is_online = false;
        let mut busy = online("busy", 1.0);
        busy.current_trip_id = Some(TripId::new());
        let mut nowhere = online("nowhere", 1.0);
        nowhere.location = None;

        let ranked = rank_candidates(PICKUP, &[offline, busy, nowhere, online("ok", 1.0)], 5.0, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id.as_str(), "ok");
    }

    #[test]
    fn search_bounds_fall_back_to_defaults() {
        assert_eq!(search_bounds(None, None), (5.0, 10));
        assert_eq!(search_bounds(Some(0.0), Some(0)), (5.0, 10));
        assert_eq!(search_bounds(Some(-2.0), Some(3)), (5.0, 3));
        assert_eq!(search_bounds(Some(12.5), None), (12.5, 10));
    }

    proptest! {
        #[test]
        fn ranking_is_sorted_bounded_and_truncated(
            kms in proptest::collection::vec(0.0f64..20.0, 0..40),
            radius in 0.5f64..15.0,
            limit in 1usize..15,
        ) {
            let drivers: Vec<_> = kms
                .iter()
                .enumerate()
                .map(|(i, km)| online(&format!("d{i:02}"), *km))
                .collect();

            let ranked = rank_candidates(PICKUP, &drivers, radius, limit);
            prop_assert!(ranked.len() <= limit);
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].distance_km <= pair[1].distance_km);
            }
            for c in &ranked {
                prop_assert!(c.distance_km <= radius);
            }
        }
    }
}
