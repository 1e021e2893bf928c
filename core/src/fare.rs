//! Fare and duration estimation from trip distance.
//!
//! Formula: `fare = base_fare + per_km_rate * distance_km`,
//! `duration_minutes = ceil(distance_km / avg_speed_kmh * 60)`.
//!
//! Estimates are computed once at trip creation. Actual fare and duration are
//! supplied by the driver at completion and are never re-derived from here.

use serde::{Deserialize, Serialize};

/// Default flag-fall charge, in currency units.
pub const DEFAULT_BASE_FARE: f64 = 50.0;

/// Default charge per kilometer, in currency units.
pub const DEFAULT_PER_KM_RATE: f64 = 20.0;

/// Default average speed used for duration estimates.
pub const DEFAULT_AVG_SPEED_KMH: f64 = 40.0;

/// Pricing constants. Currency-unit agnostic.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FareSchedule {
    /// Fixed charge applied to every trip.
    pub base_fare: f64,
    /// Charge per kilometer travelled.
    pub per_km_rate: f64,
    /// Average travel speed assumed for duration estimates.
    pub avg_speed_kmh: f64,
}

impl Default for FareSchedule {
    fn default() -> Self {
        Self {
            base_fare: DEFAULT_BASE_FARE,
            per_km_rate: DEFAULT_PER_KM_RATE,
            avg_speed_kmh: DEFAULT_AVG_SPEED_KMH,
        }
    }
}

/// Result of [`FareSchedule::estimate`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FareEstimate {
    /// Estimated fare.
    pub fare: f64,
    /// Estimated duration, rounded up to whole minutes.
    pub duration_minutes: u32,
}

impl FareSchedule {
    /// Estimate fare and duration for a trip of `distance_km`.
    ///
    /// Negative or non-finite distances are treated as zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use rideflow_core::fare::FareSchedule;
    ///
    /// let estimate = FareSchedule::default().estimate(10.0);
    /// assert_eq!(estimate.fare, 250.0);
    /// assert_eq!(estimate.duration_minutes, 15);
    /// ```
    #[must_use]
    pub fn estimate(&self, distance_km: f64) -> FareEstimate {
        let distance_km = if distance_km.is_finite() {
            distance_km.max(0.0)
        } else {
            0.0
        };

        let fare = self.base_fare + self.per_km_rate * distance_km;

        let minutes = if self.avg_speed_kmh > 0.0 {
            (distance_km / self.avg_speed_kmh * 60.0).ceil()
        } else {
            0.0
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let duration_minutes = minutes.min(f64::from(u32::MAX)) as u32;

        FareEstimate {
            fare,
            duration_minutes,
        }
    }
}
