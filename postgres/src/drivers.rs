//! `PostgreSQL` driver availability store.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use rideflow_core::driver::{DriverAvailability, DriverProfile};
use rideflow_core::geo::Coordinates;
use rideflow_core::ids::{DriverId, TripId};
use rideflow_core::store::{DriverStore, StoreError, StoreFuture};
use sqlx::PgPool;
use uuid::Uuid;

const DRIVER_COLUMNS: &str = "driver_id, is_online, latitude, longitude, current_trip_id, \
    completed_trips, vehicle_type, vehicle_model, vehicle_color, plate_number, rating, updated_at";

#[derive(sqlx::FromRow)]
struct DriverRow {
    driver_id: String,
    is_online: bool,
    latitude: Option<f64>,
    longitude: Option<f64>,
    current_trip_id: Option<Uuid>,
    completed_trips: i64,
    vehicle_type: String,
    vehicle_model: String,
    vehicle_color: String,
    plate_number: String,
    rating: f64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DriverRow> for DriverAvailability {
    type Error = StoreError;

    fn try_from(row: DriverRow) -> Result<Self, Self::Error> {
        let location = match (row.latitude, row.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            (None, None) => None,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "driver {} has a partial location",
                    row.driver_id
                )));
            },
        };
        let completed_trips = u64::try_from(row.completed_trips).map_err(|_| {
            StoreError::Corrupt(format!(
                "completed_trips out of range: {}",
                row.completed_trips
            ))
        })?;

        Ok(Self {
            driver_id: DriverId::new(row.driver_id),
            is_online: row.is_online,
            location,
            current_trip_id: row.current_trip_id.map(TripId::from_uuid),
            completed_trips,
            profile: DriverProfile {
                vehicle_type: row.vehicle_type,
                vehicle_model: row.vehicle_model,
                vehicle_color: row.vehicle_color,
                plate_number: row.plate_number,
                rating: row.rating,
            },
            updated_at: row.updated_at,
        })
    }
}

/// Driver availability backed by the `driver_availability` table.
///
/// Every write is an `INSERT ... ON CONFLICT DO UPDATE`, so the first report
/// from a driver creates the record.
#[derive(Clone, Debug)]
pub struct PostgresDriverStore {
    pool: PgPool,
}

impl PostgresDriverStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, DriverRow, sqlx::postgres::PgArguments>,
    ) -> Result<DriverAvailability, StoreError> {
        query
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
            .and_then(DriverAvailability::try_from)
    }
}

impl DriverStore for PostgresDriverStore {
    fn get<'a>(&'a self, driver_id: &'a DriverId) -> StoreFuture<'a, Option<DriverAvailability>> {
        Box::pin(async move {
            sqlx::query_as::<_, DriverRow>(&format!(
                "SELECT {DRIVER_COLUMNS} FROM driver_availability WHERE driver_id = $1"
            ))
            .bind(driver_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .map(DriverAvailability::try_from)
            .transpose()
        })
    }

    fn set_online<'a>(
        &'a self,
        driver_id: &'a DriverId,
        online: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO driver_availability (driver_id, is_online, updated_at) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (driver_id) DO UPDATE SET \
                     is_online = EXCLUDED.is_online, updated_at = EXCLUDED.updated_at \
                 RETURNING {DRIVER_COLUMNS}"
            );
            let record = self
                .fetch_one(
                    sqlx::query_as(&sql)
                        .bind(driver_id.as_str())
                        .bind(online)
                        .bind(now),
                )
                .await?;
            tracing::debug!(%driver_id, online, "Driver availability stored");
            Ok(record)
        })
    }

    fn set_location<'a>(
        &'a self,
        driver_id: &'a DriverId,
        location: Coordinates,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO driver_availability (driver_id, latitude, longitude, updated_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (driver_id) DO UPDATE SET \
                     latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude, \
                     updated_at = EXCLUDED.updated_at \
                 RETURNING {DRIVER_COLUMNS}"
            );
            self.fetch_one(
                sqlx::query_as(&sql)
                    .bind(driver_id.as_str())
                    .bind(location.latitude)
                    .bind(location.longitude)
                    .bind(now),
            )
            .await
        })
    }

    fn upsert_profile<'a>(
        &'a self,
        driver_id: &'a DriverId,
        profile: DriverProfile,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, DriverAvailability> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO driver_availability \
                     (driver_id, vehicle_type, vehicle_model, vehicle_color, plate_number, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (driver_id) DO UPDATE SET \
                     vehicle_type = EXCLUDED.vehicle_type, \
                     vehicle_model = EXCLUDED.vehicle_model, \
                     vehicle_color = EXCLUDED.vehicle_color, \
                     plate_number = EXCLUDED.plate_number, \
                     updated_at = EXCLUDED.updated_at \
                 RETURNING {DRIVER_COLUMNS}"
            );
            self.fetch_one(
                sqlx::query_as(&sql)
                    .bind(driver_id.as_str())
                    .bind(&profile.vehicle_type)
                    .bind(&profile.vehicle_model)
                    .bind(&profile.vehicle_color)
                    .bind(&profile.plate_number)
                    .bind(now),
            )
            .await
        })
    }

    fn list_dispatchable(&self) -> StoreFuture<'_, Vec<DriverAvailability>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, DriverRow>(&format!(
                "SELECT {DRIVER_COLUMNS} FROM driver_availability \
                 WHERE is_online AND current_trip_id IS NULL \
                   AND latitude IS NOT NULL AND longitude IS NOT NULL"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            rows.into_iter().map(DriverAvailability::try_from).collect()
        })
    }

    fn count_available(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM driver_availability WHERE is_online AND current_trip_id IS NULL",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            u64::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative count: {count}")))
        })
    }

    fn claim_for_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO driver_availability (driver_id, current_trip_id, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (driver_id) DO UPDATE SET
                    current_trip_id = EXCLUDED.current_trip_id,
                    updated_at = EXCLUDED.updated_at
                WHERE driver_availability.current_trip_id IS NULL
                   OR driver_availability.current_trip_id = EXCLUDED.current_trip_id
                ",
            )
            .bind(driver_id.as_str())
            .bind(trip_id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn release_from_trip<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE driver_availability
                SET current_trip_id = NULL, updated_at = $3
                WHERE driver_id = $1 AND current_trip_id = $2
                ",
            )
            .bind(driver_id.as_str())
            .bind(trip_id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn record_completion<'a>(
        &'a self,
        driver_id: &'a DriverId,
        trip_id: TripId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE driver_availability
                SET current_trip_id = NULL,
                    completed_trips = completed_trips + 1,
                    updated_at = $3
                WHERE driver_id = $1 AND current_trip_id = $2
                ",
            )
            .bind(driver_id.as_str())
            .bind(trip_id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn record_rating<'a>(
        &'a self,
        driver_id: &'a DriverId,
        rating_id: &'a str,
        trip_id: TripId,
        score: u8,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

            let inserted = sqlx::query(
                r"
                INSERT INTO driver_ratings (rating_id, driver_id, trip_id, score, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (rating_id) DO NOTHING
                ",
            )
            .bind(rating_id)
            .bind(driver_id.as_str())
            .bind(trip_id.as_uuid())
            .bind(i16::from(score))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if inserted.rows_affected() == 0 {
                tx.commit().await.map_err(map_sqlx_error)?;
                return Ok(false);
            }

            sqlx::query(
                r"
                INSERT INTO driver_availability (driver_id, rating, updated_at)
                SELECT $1, AVG(score)::DOUBLE PRECISION, $2
                FROM driver_ratings WHERE driver_id = $1
                ON CONFLICT (driver_id) DO UPDATE SET
                    rating = EXCLUDED.rating,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(driver_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            tx.commit().await.map_err(map_sqlx_error)?;
            Ok(true)
        })
    }
}
