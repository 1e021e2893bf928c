//! Great-circle geometry for pickup/dropoff points and driver positions.
//!
//! Distances use the haversine formula on a sphere of radius [`EARTH_RADIUS_KM`].
//! No ellipsoid correction is applied; the approximation is well within the
//! accuracy of phone-reported GPS positions for in-city dispatch radii.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius used by the haversine approximation.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Reasons a coordinate pair is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateError {
    /// Latitude or longitude is NaN or infinite.
    #[error("coordinates must be finite numbers")]
    NotFinite,

    /// Latitude outside `[-90, 90]` or longitude outside `[-180, 180]`.
    #[error("coordinates out of range")]
    OutOfRange,

    /// Latitude or longitude is exactly zero, the value an unset field decodes to.
    #[error("coordinates are missing")]
    Unset,
}

/// A point on the Earth's surface in signed decimal degrees.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees, positive north.
    pub latitude: f64,
    /// Longitude in degrees, positive east.
    pub longitude: f64,
}

impl Coordinates {
    /// Create a coordinate pair without validation.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that this point can be used as a trip endpoint or driver position.
    ///
    /// A zero latitude or longitude is treated as a missing value: clients that
    /// forget to populate a field send `0.0`, and accepting it would place the
    /// point in the Gulf of Guinea.
    ///
    /// # Errors
    ///
    /// Returns the first [`CoordinateError`] that applies.
    pub fn validate(&self) -> Result<(), CoordinateError> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(CoordinateError::NotFinite);
        }
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(CoordinateError::OutOfRange);
        }
        if self.latitude == 0.0 || self.longitude == 0.0 {
            return Err(CoordinateError::Unset);
        }
        Ok(())
    }

    /// Great-circle distance to `other` in kilometers.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        haversine_km(*self, *other)
    }
}

/// Haversine great-circle distance between two points in kilometers.
///
/// Symmetric, and exactly zero for identical points.
///
/// # Examples
///
/// ```
/// use rideflow_core::geo::{haversine_km, Coordinates};
///
/// let nairobi_cbd = Coordinates::new(-1.286389, 36.817223);
/// let westlands = Coordinates::new(-1.292066, 36.821945);
///
/// let d = haversine_km(nairobi_cbd, westlands);
/// assert!(d > 0.7 && d < 0.9);
/// assert_eq!(haversine_km(westlands, westlands), 0.0);
/// ```
#[must_use]
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lon1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lon2) = (b.latitude.to_radians(), b.longitude.to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// A trip endpoint: coordinates plus the human-readable address the rider picked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Position of the endpoint.
    pub coordinates: Coordinates,
    /// Free-form address label; not interpreted by the core.
    pub address: String,
}

impl Location {
    /// Create a location.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, address: impl Into<String>) -> Self {
        Self {
            coordinates: Coordinates::new(latitude, longitude),
            address: address.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let a = Coordinates::new(10.0, 20.0);
        let b = Coordinates::new(11.0, 20.0);
        let d = haversine_km(a, b);
        assert!((d - 111.19).abs() < 0.01, "got {d}");
    }

    #[test]
    fn unset_components_are_rejected() {
        assert_eq!(
            Coordinates::new(0.0, 36.8).validate(),
            Err(CoordinateError::Unset)
        );
        assert_eq!(
            Coordinates::new(-1.28, 0.0).validate(),
            Err(CoordinateError::Unset)
        );
        assert_eq!(Coordinates::new(-1.28, 36.8).validate(), Ok(()));
    }

    #[test]
    fn out_of_range_and_non_finite_are_rejected() {
        assert_eq!(
            Coordinates::new(91.0, 10.0).validate(),
            Err(CoordinateError::OutOfRange)
        );
        assert_eq!(
            Coordinates::new(10.0, -180.5).validate(),
            Err(CoordinateError::OutOfRange)
        );
        assert_eq!(
            Coordinates::new(f64::NAN, 10.0).validate(),
            Err(CoordinateError::NotFinite)
        );
    }

    fn point() -> impl Strategy<Value = Coordinates> {
        (-89.0f64..89.0, -179.0f64..179.0).prop_map(|(lat, lng)| Coordinates::new(lat, lng))
    }

    proptest! {
        #[test]
        fn distance_to_self_is_zero(p in point()) {
            prop_assert_eq!(haversine_km(p, p), 0.0);
        }

        #[test]
        fn distance_is_symmetric(a in point(), b in point()) {
            let ab = haversine_km(a, b);
            let ba = haversine_km(b, a);
            prop_assert!((ab - ba).abs() < 1e-9, "ab={} ba={}", ab, ba);
        }

        #[test]
        fn distance_is_bounded_by_half_circumference(a in point(), b in point()) {
            let d = haversine_km(a, b);
            prop_assert!(d >= 0.0);
            prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
        }
    }
}
