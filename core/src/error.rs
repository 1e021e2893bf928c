//! Errors surfaced by saga and dispatch operations.

use crate::event_bus::EventBusError;
use crate::geo::CoordinateError;
use crate::ids::{DriverId, TripId};
use crate::store::StoreError;
use crate::trip::TripStatus;
use thiserror::Error;

/// Error returned by every trip and driver operation.
///
/// Only [`SagaError::Store`] with a transient cause is worth retrying;
/// everything else is a final answer for the caller.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// Input rejected before touching any store.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Another driver won the assignment race.
    #[error("Trip {0} is no longer available")]
    Conflict(TripId),

    /// The trip's status does not allow the requested operation.
    #[error("Cannot {attempted} trip {trip_id}: trip is {current}")]
    InvalidState {
        /// Trip the operation targeted.
        trip_id: TripId,
        /// Status found in the store.
        current: TripStatus,
        /// Operation name.
        attempted: &'static str,
    },

    /// No such trip (or not visible to the caller).
    #[error("Trip not found: {0}")]
    TripNotFound(TripId),

    /// No availability record for the driver.
    #[error("Driver not found: {0}")]
    DriverNotFound(DriverId),

    /// The caller is not a participant allowed to perform the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Event transport failure (subscription setup).
    #[error(transparent)]
    Transport(#[from] EventBusError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Whether the same call may succeed if retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::InvalidState { .. } => "invalid_state",
            Self::TripNotFound(_) | Self::DriverNotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Transport(_) => "transport",
            Self::Store(_) => "store",
        }
    }
}

impl From<CoordinateError> for SagaError {
    fn from(err: CoordinateError) -> Self {
        Self::Validation(err.to_string())
    }
}
