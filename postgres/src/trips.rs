//! `PostgreSQL` trip store.

use crate::{map_sqlx_error, sql_bound};
use chrono::{DateTime, Utc};
use rideflow_core::geo::Location;
use rideflow_core::ids::{DriverId, RiderId, TripId};
use rideflow_core::store::{StoreError, StoreFuture, TransitionOutcome, TripStore};
use rideflow_core::trip::{Trip, TripStatus, TripTransition};
use sqlx::PgPool;
use uuid::Uuid;

const TRIP_COLUMNS: &str = "id, rider_id, driver_id, \
    pickup_latitude, pickup_longitude, pickup_address, \
    dropoff_latitude, dropoff_longitude, dropoff_address, \
    status, estimated_fare, estimated_distance_km, estimated_duration_minutes, \
    actual_fare, actual_duration_minutes, cancellation_reason, \
    created_at, accepted_at, started_at, completed_at, cancelled_at, updated_at";

static ACTIVE_STATUSES: [&str; 3] = [
    TripStatus::Requested.as_str(),
    TripStatus::Accepted.as_str(),
    TripStatus::InProgress.as_str(),
];

#[derive(sqlx::FromRow)]
struct TripRow {
    id: Uuid,
    rider_id: String,
    driver_id: Option<String>,
    pickup_latitude: f64,
    pickup_longitude: f64,
    pickup_address: String,
    dropoff_latitude: f64,
    dropoff_longitude: f64,
    dropoff_address: String,
    status: String,
    estimated_fare: f64,
    estimated_distance_km: f64,
    estimated_duration_minutes: i64,
    actual_fare: Option<f64>,
    actual_duration_minutes: Option<i64>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn minutes(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

impl TryFrom<TripRow> for Trip {
    type Error = StoreError;

    fn try_from(row: TripRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TripStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Self {
            id: TripId::from_uuid(row.id),
            rider_id: RiderId::new(row.rider_id),
            driver_id: row.driver_id.map(DriverId::new),
            pickup: Location::new(row.pickup_latitude, row.pickup_longitude, row.pickup_address),
            dropoff: Location::new(
                row.dropoff_latitude,
                row.dropoff_longitude,
                row.dropoff_address,
            ),
            status,
            estimated_fare: row.estimated_fare,
            estimated_distance_km: row.estimated_distance_km,
            estimated_duration_minutes: minutes(
                row.estimated_duration_minutes,
                "estimated_duration_minutes",
            )?,
            actual_fare: row.actual_fare,
            actual_duration_minutes: row
                .actual_duration_minutes
                .map(|m| minutes(m, "actual_duration_minutes"))
                .transpose()?,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            accepted_at: row.accepted_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_trips(rows: Vec<TripRow>) -> Result<Vec<Trip>, StoreError> {
    rows.into_iter().map(Trip::try_from).collect()
}

/// Trip persistence backed by the `trips` table.
///
/// Transitions lock the row with `SELECT ... FOR UPDATE`, apply
/// [`Trip::apply`] to it, and write the result back with
/// `UPDATE ... WHERE id = $1 AND status = ANY($12)` in the same transaction.
/// Concurrent transitions on one trip therefore serialize, and every caller
/// after the first sees the already-updated row.
#[derive(Clone, Debug)]
pub struct PostgresTripStore {
    pool: PgPool,
}

impl PostgresTripStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(&self, sql: &str, key: &str) -> Result<Option<Trip>, StoreError> {
        sqlx::query_as::<_, TripRow>(sql)
            .bind(key)
            .bind(&ACTIVE_STATUSES[..])
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .map(Trip::try_from)
            .transpose()
    }

    async fn fetch_page(
        &self,
        sql: &str,
        key: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Trip>, StoreError> {
        let rows = sqlx::query_as::<_, TripRow>(sql)
            .bind(key)
            .bind(sql_bound(limit))
            .bind(sql_bound(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        into_trips(rows)
    }

    async fn apply_transition(
        &self,
        id: TripId,
        transition: TripTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, TripRow>(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(TransitionOutcome::NotFound);
        };
        let current = Trip::try_from(row)?;

        let Ok(next) = current.apply(&transition, now) else {
            // Dropping the transaction rolls back and releases the lock.
            return Ok(TransitionOutcome::Rejected(current));
        };

        let allowed: Vec<&str> = transition
            .allowed_from()
            .iter()
            .map(|status| status.as_str())
            .collect();
        let updated = sqlx::query(
            r"
            UPDATE trips SET
                driver_id = $2,
                status = $3,
                actual_fare = $4,
                actual_duration_minutes = $5,
                cancellation_reason = $6,
                accepted_at = $7,
                started_at = $8,
                completed_at = $9,
                cancelled_at = $10,
                updated_at = $11
            WHERE id = $1 AND status = ANY($12)
            ",
        )
        .bind(next.id.as_uuid())
        .bind(next.driver_id.as_ref().map(DriverId::as_str))
        .bind(next.status.as_str())
        .bind(next.actual_fare)
        .bind(next.actual_duration_minutes.map(i64::from))
        .bind(next.cancellation_reason.as_deref())
        .bind(next.accepted_at)
        .bind(next.started_at)
        .bind(next.completed_at)
        .bind(next.cancelled_at)
        .bind(next.updated_at)
        .bind(&allowed)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if updated.rows_affected() == 0 {
            return Ok(TransitionOutcome::Rejected(current));
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::debug!(
            trip_id = %id,
            transition = transition.name(),
            status = %next.status,
            "Trip transition committed"
        );
        Ok(TransitionOutcome::Applied(next))
    }
}

impl TripStore for PostgresTripStore {
    fn insert(&self, trip: &Trip) -> StoreFuture<'_, ()> {
        let trip = trip.clone();
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO trips ({TRIP_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                  $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
            ))
            .bind(trip.id.as_uuid())
            .bind(trip.rider_id.as_str())
            .bind(trip.driver_id.as_ref().map(DriverId::as_str))
            .bind(trip.pickup.coordinates.latitude)
            .bind(trip.pickup.coordinates.longitude)
            .bind(&trip.pickup.address)
            .bind(trip.dropoff.coordinates.latitude)
            .bind(trip.dropoff.coordinates.longitude)
            .bind(&trip.dropoff.address)
            .bind(trip.status.as_str())
            .bind(trip.estimated_fare)
            .bind(trip.estimated_distance_km)
            .bind(i64::from(trip.estimated_duration_minutes))
            .bind(trip.actual_fare)
            .bind(trip.actual_duration_minutes.map(i64::from))
            .bind(trip.cancellation_reason.as_deref())
            .bind(trip.created_at)
            .bind(trip.accepted_at)
            .bind(trip.started_at)
            .bind(trip.completed_at)
            .bind(trip.cancelled_at)
            .bind(trip.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        })
    }

    fn get(&self, id: TripId) -> StoreFuture<'_, Option<Trip>> {
        Box::pin(async move {
            sqlx::query_as::<_, TripRow>(&format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .map(Trip::try_from)
                .transpose()
        })
    }

    fn transition(
        &self,
        id: TripId,
        transition: TripTransition,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, TransitionOutcome> {
        Box::pin(self.apply_transition(id, transition, now))
    }

    fn list_for_rider<'a>(
        &'a self,
        rider_id: &'a RiderId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TRIP_COLUMNS} FROM trips WHERE rider_id = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
            );
            self.fetch_page(&sql, rider_id.as_str(), limit, offset).await
        })
    }

    fn list_for_driver<'a>(
        &'a self,
        driver_id: &'a DriverId,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'a, Vec<Trip>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TRIP_COLUMNS} FROM trips WHERE driver_id = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
            );
            self.fetch_page(&sql, driver_id.as_str(), limit, offset).await
        })
    }

    fn active_for_rider<'a>(&'a self, rider_id: &'a RiderId) -> StoreFuture<'a, Option<Trip>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TRIP_COLUMNS} FROM trips WHERE rider_id = $1 AND status = ANY($2) \
                 ORDER BY created_at DESC LIMIT 1"
            );
            self.fetch_optional(&sql, rider_id.as_str()).await
        })
    }

    fn active_for_driver<'a>(
        &'a self,
        driver_id: &'a DriverId,
    ) -> StoreFuture<'a, Option<Trip>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TRIP_COLUMNS} FROM trips WHERE driver_id = $1 AND status = ANY($2) \
                 ORDER BY created_at DESC LIMIT 1"
            );
            self.fetch_optional(&sql, driver_id.as_str()).await
        })
    }

    fn list_expired_requests(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<TripId>> {
        Box::pin(async move {
            let ids: Vec<(Uuid,)> = sqlx::query_as(
                r"
                SELECT id FROM trips
                WHERE status = $1 AND created_at < $2
                ORDER BY created_at
                LIMIT $3
                ",
            )
            .bind(TripStatus::Requested.as_str())
            .bind(cutoff)
            .bind(sql_bound(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(ids.into_iter().map(|(id,)| TripId::from_uuid(id)).collect())
        })
    }
}
