//! # Rideflow `PostgreSQL`
//!
//! `PostgreSQL` implementations of the [`TripStore`] and [`DriverStore`] traits.
//!
//! Trip transitions are conditional `UPDATE ... WHERE status = ANY(...)`
//! statements, so the database row lock is the only arbiter when several
//! callers race on one trip. Driver availability writes are single-statement
//! upserts.
//!
//! ## Example
//!
//! ```no_run
//! use rideflow_postgres::{PostgresDriverStore, PostgresTripStore, PoolSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = rideflow_postgres::connect("postgres://localhost/rideflow", &PoolSettings::default()).await?;
//! rideflow_postgres::migrate(&pool).await?;
//!
//! let trips = PostgresTripStore::new(pool.clone());
//! let drivers = PostgresDriverStore::new(pool);
//! # Ok(())
//! # }
//! ```
//!
//! [`TripStore`]: rideflow_core::store::TripStore
//! [`DriverStore`]: rideflow_core::store::DriverStore

use rideflow_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

mod drivers;
mod trips;

pub use drivers::PostgresDriverStore;
pub use trips::PostgresTripStore;

/// Connection pool bounds.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long to wait for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect to database: {e}")))?;

    tracing::info!(
        max_connections = settings.max_connections,
        "PostgreSQL pool ready"
    );
    Ok(pool)
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to run migrations: {e}")))
}

/// Classify a driver error so callers can tell retryable failures apart.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        },
        sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
            StoreError::Duplicate(db.message().to_string())
        },
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Corrupt(error.to_string())
        },
        other => StoreError::DatabaseError(other.to_string()),
    }
}

/// Convert a caller page bound into a SQL `LIMIT`/`OFFSET` value.
pub(crate) fn sql_bound(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn missing_rows_are_not_transient() {
        let mapped = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(matches!(mapped, StoreError::DatabaseError(_)));
        assert!(!mapped.is_transient());
    }

    #[test]
    fn oversized_bounds_saturate() {
        assert_eq!(sql_bound(25), 25);
        assert_eq!(sql_bound(usize::MAX), i64::MAX);
    }
}
