//! Lifecycle events and their wire format.
//!
//! Every event travels on one of eight stable subjects. Payloads are flat JSON
//! records: ids as strings, coordinates as floats, timestamps in RFC 3339. The
//! message key is the trip id for `trip.*` subjects and the driver id for
//! `driver.*` subjects, so a partitioned transport keeps one trip's events in
//! order.
//!
//! # Origin
//!
//! Both the trip side and the driver side publish on `trip.accepted`,
//! `trip.started` and `trip.completed`. Each `trip.*` payload carries an
//! [`EventOrigin`] naming the side that produced it; consumers only act on
//! events from the other side, which keeps the two from echoing each other
//! forever.
//!
//! # Example
//!
//! ```
//! use rideflow_core::event::{LifecycleEvent, Subject, TripCancelled, EventOrigin};
//! use rideflow_core::ids::{RiderId, TripId};
//! use chrono::Utc;
//!
//! let event = LifecycleEvent::TripCancelled(TripCancelled {
//!     trip_id: TripId::new(),
//!     rider_id: RiderId::new("rider-1"),
//!     driver_id: None,
//!     reason: "expired".to_string(),
//!     origin: EventOrigin::TripService,
//!     cancelled_at: Utc::now(),
//! });
//!
//! let wire = event.to_serialized().unwrap();
//! assert_eq!(wire.subject, "trip.cancelled");
//! assert_eq!(LifecycleEvent::from_serialized(&wire).unwrap(), event);
//! ```

use crate::ids::{DriverId, RiderId, TripId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for event encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Subject not part of the lifecycle contract.
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),
}

/// The stable set of subjects lifecycle events are published on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    /// `trip.created`
    TripCreated,
    /// `trip.accepted`
    TripAccepted,
    /// `trip.started`
    TripStarted,
    /// `trip.completed`
    TripCompleted,
    /// `trip.cancelled`
    TripCancelled,
    /// `driver.online`
    DriverOnline,
    /// `driver.offline`
    DriverOffline,
    /// `driver.location`
    DriverLocation,
    /// `rating.created`
    RatingCreated,
}

impl Subject {
    /// Every subject, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::TripCreated,
        Self::TripAccepted,
        Self::TripStarted,
        Self::TripCompleted,
        Self::TripCancelled,
        Self::DriverOnline,
        Self::DriverOffline,
        Self::DriverLocation,
        Self::RatingCreated,
    ];

    /// Wire name of the subject.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripCreated => "trip.created",
            Self::TripAccepted => "trip.accepted",
            Self::TripStarted => "trip.started",
            Self::TripCompleted => "trip.completed",
            Self::TripCancelled => "trip.cancelled",
            Self::DriverOnline => "driver.online",
            Self::DriverOffline => "driver.offline",
            Self::DriverLocation => "driver.location",
            Self::RatingCreated => "rating.created",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| EventError::UnknownSubject(s.to_string()))
    }
}

/// Which side of the system produced a `trip.*` event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Published by the trip saga after a committed transition. Authoritative.
    TripService,
    /// Published by a driver action, asking the trip side to apply it.
    DriverService,
}

impl EventOrigin {
    /// Wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripService => "trip_service",
            Self::DriverService => "driver_service",
        }
    }
}

/// Payload of `trip.created`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCreated {
    /// New trip.
    pub trip_id: TripId,
    /// Requesting rider.
    pub rider_id: RiderId,
    /// Pickup latitude.
    pub pickup_latitude: f64,
    /// Pickup longitude.
    pub pickup_longitude: f64,
    /// Dropoff latitude.
    pub dropoff_latitude: f64,
    /// Dropoff longitude.
    pub dropoff_longitude: f64,
    /// Fare estimated at creation.
    pub estimated_fare: f64,
    /// Always [`EventOrigin::TripService`].
    pub origin: EventOrigin,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Payload of `trip.accepted`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripAccepted {
    /// Trip being accepted.
    pub trip_id: TripId,
    /// Accepting driver.
    pub driver_id: DriverId,
    /// Rider, when known to the publisher. Driver-side requests omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider_id: Option<RiderId>,
    /// Producing side.
    pub origin: EventOrigin,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `trip.started`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripStarted {
    /// Trip being started.
    pub trip_id: TripId,
    /// Driver carrying the rider.
    pub driver_id: DriverId,
    /// Producing side.
    pub origin: EventOrigin,
    /// Pickup time.
    pub started_at: DateTime<Utc>,
}

/// Payload of `trip.completed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCompleted {
    /// Trip being completed.
    pub trip_id: TripId,
    /// Driver who carried the rider.
    pub driver_id: DriverId,
    /// Fare charged.
    pub actual_fare: f64,
    /// Duration in minutes.
    pub actual_duration: u32,
    /// Producing side.
    pub origin: EventOrigin,
    /// Dropoff time.
    pub completed_at: DateTime<Utc>,
}

/// Payload of `trip.cancelled`. Only the trip side publishes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCancelled {
    /// Cancelled trip.
    pub trip_id: TripId,
    /// Trip's rider.
    pub rider_id: RiderId,
    /// Driver that was assigned, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    /// Cancellation reason (`expired` for sweeper cancellations).
    pub reason: String,
    /// Always [`EventOrigin::TripService`].
    pub origin: EventOrigin,
    /// Cancellation time.
    pub cancelled_at: DateTime<Utc>,
}

/// Payload of `driver.online` and `driver.offline`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverStatusChanged {
    /// Reporting driver.
    pub driver_id: DriverId,
    /// New availability.
    pub is_online: bool,
    /// Last known latitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Last known longitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Report time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `driver.location`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverLocationUpdated {
    /// Reporting driver.
    pub driver_id: DriverId,
    /// Reported latitude.
    pub latitude: f64,
    /// Reported longitude.
    pub longitude: f64,
    /// Whether the driver is online at report time.
    pub is_online: bool,
    /// Report time.
    pub timestamp: DateTime<Utc>,
}

/// Who gave a rating.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaterType {
    /// A rider rating their driver.
    Rider,
    /// A driver rating their rider.
    Driver,
}

/// Payload of `rating.created`, published by the rating side once a rating is
/// stored. `rating_id` is unique per rating.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingCreated {
    /// Identity of the stored rating.
    pub rating_id: String,
    /// Trip the rating is about.
    pub trip_id: TripId,
    /// Driver or rider being rated.
    pub rated_id: String,
    /// Who gave the rating.
    pub rater_type: RaterType,
    /// Score, `1..=5`.
    pub rating: i32,
}

/// Any event on the lifecycle subjects.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// `trip.created`
    TripCreated(TripCreated),
    /// `trip.accepted`
    TripAccepted(TripAccepted),
    /// `trip.started`
    TripStarted(TripStarted),
    /// `trip.completed`
    TripCompleted(TripCompleted),
    /// `trip.cancelled`
    TripCancelled(TripCancelled),
    /// `driver.online`
    DriverOnline(DriverStatusChanged),
    /// `driver.offline`
    DriverOffline(DriverStatusChanged),
    /// `driver.location`
    DriverLocation(DriverLocationUpdated),
    /// `rating.created`
    RatingCreated(RatingCreated),
}

impl LifecycleEvent {
    /// Subject this event is published on.
    #[must_use]
    pub const fn subject(&self) -> Subject {
        match self {
            Self::TripCreated(_) => Subject::TripCreated,
            Self::TripAccepted(_) => Subject::TripAccepted,
            Self::TripStarted(_) => Subject::TripStarted,
            Self::TripCompleted(_) => Subject::TripCompleted,
            Self::TripCancelled(_) => Subject::TripCancelled,
            Self::DriverOnline(_) => Subject::DriverOnline,
            Self::DriverOffline(_) => Subject::DriverOffline,
            Self::DriverLocation(_) => Subject::DriverLocation,
            Self::RatingCreated(_) => Subject::RatingCreated,
        }
    }

    /// Partition key: trip id, driver id, or the rated party.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::TripCreated(e) => e.trip_id.to_string(),
            Self::TripAccepted(e) => e.trip_id.to_string(),
            Self::TripStarted(e) => e.trip_id.to_string(),
            Self::TripCompleted(e) => e.trip_id.to_string(),
            Self::TripCancelled(e) => e.trip_id.to_string(),
            Self::DriverOnline(e) | Self::DriverOffline(e) => e.driver_id.to_string(),
            Self::DriverLocation(e) => e.driver_id.to_string(),
            Self::RatingCreated(e) => e.rated_id.clone(),
        }
    }

    /// Producing side for `trip.*` events; `None` for driver and rating subjects.
    #[must_use]
    pub const fn origin(&self) -> Option<EventOrigin> {
        match self {
            Self::TripCreated(e) => Some(e.origin),
            Self::TripAccepted(e) => Some(e.origin),
            Self::TripStarted(e) => Some(e.origin),
            Self::TripCompleted(e) => Some(e.origin),
            Self::TripCancelled(e) => Some(e.origin),
            Self::DriverOnline(_)
            | Self::DriverOffline(_)
            | Self::DriverLocation(_)
            | Self::RatingCreated(_) => None,
        }
    }

    /// Encode for the transport.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if JSON encoding fails.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        let data = match self {
            Self::TripCreated(e) => serde_json::to_vec(e),
            Self::TripAccepted(e) => serde_json::to_vec(e),
            Self::TripStarted(e) => serde_json::to_vec(e),
            Self::TripCompleted(e) => serde_json::to_vec(e),
            Self::TripCancelled(e) => serde_json::to_vec(e),
            Self::DriverOnline(e) | Self::DriverOffline(e) => serde_json::to_vec(e),
            Self::DriverLocation(e) => serde_json::to_vec(e),
            Self::RatingCreated(e) => serde_json::to_vec(e),
        }
        .map_err(|e| EventError::SerializationError(e.to_string()))?;

        Ok(SerializedEvent::new(
            self.subject().as_str().to_string(),
            self.key(),
            data,
        ))
    }

    /// Decode a message received from the transport.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownSubject`] for subjects outside the contract and
    /// [`EventError::DeserializationError`] for malformed payloads.
    pub fn from_serialized(event: &SerializedEvent) -> Result<Self, EventError> {
        let subject: Subject = event.subject.parse()?;
        let data = event.data.as_slice();

        let decoded = match subject {
            Subject::TripCreated => serde_json::from_slice(data).map(Self::TripCreated),
            Subject::TripAccepted => serde_json::from_slice(data).map(Self::TripAccepted),
            Subject::TripStarted => serde_json::from_slice(data).map(Self::TripStarted),
            Subject::TripCompleted => serde_json::from_slice(data).map(Self::TripCompleted),
            Subject::TripCancelled => serde_json::from_slice(data).map(Self::TripCancelled),
            Subject::DriverOnline => serde_json::from_slice(data).map(Self::DriverOnline),
            Subject::DriverOffline => serde_json::from_slice(data).map(Self::DriverOffline),
            Subject::DriverLocation => serde_json::from_slice(data).map(Self::DriverLocation),
            Subject::RatingCreated => serde_json::from_slice(data).map(Self::RatingCreated),
        };

        decoded.map_err(|e| EventError::DeserializationError(format!("{subject}: {e}")))
    }
}

/// An encoded event as it travels on the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEvent {
    /// Subject name (e.g. `trip.accepted`).
    pub subject: String,

    /// Partition key: trip id or driver id.
    pub key: String,

    /// JSON-encoded payload.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(subject: String, key: String, data: Vec<u8>) -> Self {
        Self { subject, key, data }
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ subject: {}, key: {}, size: {} bytes }}",
            self.subject,
            self.key,
            self.data.len()
        )
    }
}
