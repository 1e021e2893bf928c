//! Strongly typed identifiers for trips and the people involved in them.
//!
//! Trips are identified by a UUID generated at creation. Riders and drivers are
//! identified by opaque strings issued by the external auth layer; the core never
//! interprets them beyond equality and ordering (ordering is used to break ties
//! when ranking dispatch candidates).
//!
//! # Validation
//!
//! - `FromStr::from_str()`: validates input (rejects empty / malformed values)
//! - `From::from()` and `new()`: no validation, for trusted application data
//!
//! # Examples
//!
//! ```
//! use rideflow_core::ids::{DriverId, TripId};
//!
//! let driver: DriverId = "driver-7".parse().unwrap();
//! assert_eq!(driver.as_str(), "driver-7");
//!
//! let trip = TripId::new();
//! let parsed: TripId = trip.to_string().parse().unwrap();
//! assert_eq!(parsed, trip);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when an identifier cannot be parsed from external input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind} id: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

/// Unique identifier of a trip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(Uuid);

impl TripId {
    /// Generate a fresh random trip id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. a value read back from storage).
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TripId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TripId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| ParseIdError {
            kind: "trip",
            reason: e.to_string(),
        })
    }
}

macro_rules! participant_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from trusted input.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert into the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

participant_id!(
    /// Opaque rider identity supplied by the auth layer.
    RiderId,
    "rider"
);

participant_id!(
    /// Opaque driver identity supplied by the auth layer.
    DriverId,
    "driver"
);
