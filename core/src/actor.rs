//! The authenticated caller of a core operation.
//!
//! The auth layer sits outside this workspace. It hands every call an [`Actor`]
//! and the core trusts it; nothing here reads ambient request state.

use crate::ids::{DriverId, RiderId};
use crate::trip::Trip;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who is performing an operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A rider acting on their own trips.
    Rider(RiderId),
    /// A driver acting on trips assigned to them.
    Driver(DriverId),
    /// Internal machinery: event handlers and the expiry sweep. Unrestricted.
    System,
}

impl Actor {
    /// Whether this actor may see `trip` at all.
    ///
    /// Riders see only their own trips. Drivers see trips assigned to them and
    /// any trip still waiting for a driver.
    #[must_use]
    pub fn can_view(&self, trip: &Trip) -> bool {
        match self {
            Self::Rider(rider) => &trip.rider_id == rider,
            Self::Driver(driver) => trip.driver_id.as_ref().is_none_or(|d| d == driver),
            Self::System => true,
        }
    }

    /// Whether this actor may drive the trip forward (start, complete, cancel).
    #[must_use]
    pub fn is_assigned_driver(&self, trip: &Trip) -> bool {
        match self {
            Self::Driver(driver) => trip.driver_id.as_ref() == Some(driver),
            Self::Rider(_) => false,
            Self::System => true,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rider(id) => write!(f, "rider:{id}"),
            Self::Driver(id) => write!(f, "driver:{id}"),
            Self::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use crate::fare::FareSchedule;
    use crate::geo::Location;
    use crate::trip::TripTransition;
    use chrono::Utc;

    fn trip() -> Trip {
        Trip::requested(
            RiderId::new("r-1"),
            Location::new(-1.28, 36.81, "A"),
            Location::new(-1.30, 36.82, "B"),
            2.4,
            FareSchedule::default().estimate(2.4),
            Utc::now(),
        )
    }

    #[test]
    fn riders_only_see_their_own_trips() {
        let t = trip();
        assert!(Actor::Rider(RiderId::new("r-1")).can_view(&t));
        assert!(!Actor::Rider(RiderId::new("r-2")).can_view(&t));
        assert!(Actor::System.can_view(&t));
    }

    #[test]
    fn drivers_see_open_trips_and_their_own() {
        let open = trip();
        let assigned = open
            .apply(
                &TripTransition::Assign {
                    driver_id: DriverId::new("d-1"),
                },
                Utc::now(),
            )
            .unwrap();

        let d1 = Actor::Driver(DriverId::new("d-1"));
        let d2 = Actor::Driver(DriverId::new("d-2"));
        assert!(d2.can_view(&open));
        assert!(d1.can_view(&assigned));
        assert!(!d2.can_view(&assigned));
        assert!(d1.is_assigned_driver(&assigned));
        assert!(!d2.is_assigned_driver(&assigned));
        assert!(!Actor::Rider(RiderId::new("r-1")).is_assigned_driver(&assigned));
    }
}
