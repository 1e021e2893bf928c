//! The trip record and its state machine.
//!
//! ```text
//!  Requested ──assign──► Accepted ──start──► InProgress ──complete──► Completed
//!      │                    │                    │
//!      └──────cancel────────┴───────cancel───────┴──────────────────► Cancelled
//! ```
//!
//! [`Trip::apply`] is the single definition of what a transition does to a record.
//! Store implementations call it inside their atomic section (or mirror it in a
//! conditional `UPDATE`), so the rules live here and nowhere else.

use crate::fare::FareEstimate;
use crate::geo::Location;
use crate::ids::{DriverId, RiderId, TripId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a trip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    /// Waiting for a driver.
    Requested,
    /// A driver has been assigned and is heading to pickup.
    Accepted,
    /// Rider on board.
    InProgress,
    /// Terminal: trip finished normally.
    Completed,
    /// Terminal: trip abandoned (by a participant or by expiry).
    Cancelled,
}

impl TripStatus {
    /// Statuses that can still change.
    pub const ACTIVE: [Self; 3] = [Self::Requested, Self::Accepted, Self::InProgress];

    /// Position along the lifecycle. Transitions never decrease it.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Requested => 0,
            Self::Accepted => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Cancelled => 3,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a driver id must be present in this status.
    #[must_use]
    pub const fn requires_driver(self) -> bool {
        matches!(self, Self::Accepted | Self::InProgress | Self::Completed)
    }

    /// Storage / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`TripStatus`] from storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown trip status: {0}")]
pub struct ParseTripStatusError(String);

impl FromStr for TripStatus {
    type Err = ParseTripStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "accepted" => Ok(Self::Accepted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseTripStatusError(other.to_string())),
        }
    }
}

/// Reason recorded when the expiry sweep cancels an unanswered request.
pub const EXPIRED_REASON: &str = "expired";

/// A requested change to a trip's lifecycle state.
#[derive(Clone, Debug, PartialEq)]
pub enum TripTransition {
    /// Bind a driver to a waiting trip.
    Assign {
        /// Driver taking the trip.
        driver_id: DriverId,
    },
    /// Rider picked up.
    Start,
    /// Rider dropped off.
    Complete {
        /// Fare charged, supplied by the driver.
        actual_fare: f64,
        /// Trip duration in minutes, supplied by the driver.
        actual_duration_minutes: u32,
    },
    /// Abandon the trip.
    Cancel {
        /// Free-form reason; [`EXPIRED_REASON`] for sweeper cancellations.
        reason: String,
    },
    /// Abandon a trip that is still waiting for a driver. Used by the expiry
    /// sweep so it can never cancel a trip that was accepted concurrently.
    Expire,
}

impl TripTransition {
    /// Statuses from which this transition may be applied.
    #[must_use]
    pub const fn allowed_from(&self) -> &'static [TripStatus] {
        match self {
            Self::Assign { .. } | Self::Expire => &[TripStatus::Requested],
            Self::Start => &[TripStatus::Accepted],
            Self::Complete { .. } => &[TripStatus::InProgress],
            Self::Cancel { .. } => &TripStatus::ACTIVE,
        }
    }

    /// Status after the transition is applied.
    #[must_use]
    pub const fn target(&self) -> TripStatus {
        match self {
            Self::Assign { .. } => TripStatus::Accepted,
            Self::Start => TripStatus::InProgress,
            Self::Complete { .. } => TripStatus::Completed,
            Self::Cancel { .. } | Self::Expire => TripStatus::Cancelled,
        }
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Assign { .. } => "assign",
            Self::Start => "start",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
            Self::Expire => "expire",
        }
    }
}

/// A transition was attempted from a status that does not permit it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {attempted} a trip that is {current}")]
pub struct TransitionRejected {
    /// Status the trip was in.
    pub current: TripStatus,
    /// Transition name.
    pub attempted: &'static str,
}

/// The persisted trip record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    /// Trip identity.
    pub id: TripId,
    /// Rider who requested the trip.
    pub rider_id: RiderId,
    /// Assigned driver; `None` until the first successful assignment.
    pub driver_id: Option<DriverId>,
    /// Pickup point.
    pub pickup: Location,
    /// Dropoff point.
    pub dropoff: Location,
    /// Current lifecycle status.
    pub status: TripStatus,
    /// Fare estimated at creation.
    pub estimated_fare: f64,
    /// Great-circle pickup-to-dropoff distance in km.
    pub estimated_distance_km: f64,
    /// Duration estimated at creation, in minutes.
    pub estimated_duration_minutes: u32,
    /// Fare charged, set on completion.
    pub actual_fare: Option<f64>,
    /// Actual duration in minutes, set on completion.
    pub actual_duration_minutes: Option<u32>,
    /// Why the trip was cancelled.
    pub cancellation_reason: Option<String>,
    /// When the trip was requested.
    pub created_at: DateTime<Utc>,
    /// When a driver was assigned.
    pub accepted_at: Option<DateTime<Utc>>,
    /// When the rider was picked up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the rider was dropped off.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the trip was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Build a fresh trip in [`TripStatus::Requested`].
    #[must_use]
    pub fn requested(
        rider_id: RiderId,
        pickup: Location,
        dropoff: Location,
        distance_km: f64,
        estimate: FareEstimate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TripId::new(),
            rider_id,
            driver_id: None,
            pickup,
            dropoff,
            status: TripStatus::Requested,
            estimated_fare: estimate.fare,
            estimated_distance_km: distance_km,
            estimated_duration_minutes: estimate.duration_minutes,
            actual_fare: None,
            actual_duration_minutes: None,
            cancellation_reason: None,
            created_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            updated_at: now,
        }
    }

    /// Whether `transition` may be applied to the record as it is now.
    #[must_use]
    pub fn permits(&self, transition: &TripTransition) -> bool {
        if !transition.allowed_from().contains(&self.status) {
            return false;
        }
        match transition {
            TripTransition::Assign { .. } => self.driver_id.is_none(),
            _ => true,
        }
    }

    /// Produce the record that results from applying `transition` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionRejected`] when the current status (or, for
    /// assignment, an existing driver) does not permit the transition.
    pub fn apply(
        &self,
        transition: &TripTransition,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionRejected> {
        if !self.permits(transition) {
            return Err(TransitionRejected {
                current: self.status,
                attempted: transition.name(),
            });
        }

        let mut next = self.clone();
        next.status = transition.target();
        next.updated_at = now;

        match transition {
            TripTransition::Assign { driver_id } => {
                next.driver_id = Some(driver_id.clone());
                next.accepted_at = Some(now);
            },
            TripTransition::Start => {
                next.started_at = Some(now);
            },
            TripTransition::Complete {
                actual_fare,
                actual_duration_minutes,
            } => {
                next.actual_fare = Some(*actual_fare);
                next.actual_duration_minutes = Some(*actual_duration_minutes);
                next.completed_at = Some(now);
            },
            TripTransition::Cancel { reason } => {
                next.cancellation_reason = Some(reason.clone());
                next.cancelled_at = Some(now);
            },
            TripTransition::Expire => {
                next.cancellation_reason = Some(EXPIRED_REASON.to_string());
                next.cancelled_at = Some(now);
            },
        }

        Ok(next)
    }
}
