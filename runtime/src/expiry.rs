//! Background cancellation of requests nobody accepted.
//!
//! Each sweep lists `Requested` trips created before `now - window` and expires
//! them one at a time through [`TripSaga::expire_trip`]. That transition is
//! only allowed from `Requested`, so a trip accepted between the listing and
//! the expiry is left alone.

use crate::metrics::TripMetrics;
use crate::retry::{RetryPolicy, retry_store};
use crate::saga::TripSaga;
use rideflow_core::environment::Clock;
use rideflow_core::error::SagaError;
use rideflow_core::store::TripStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Default time a request may wait for a driver.
pub const DEFAULT_EXPIRY_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// Default pause between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of trips examined per sweep.
pub const DEFAULT_SWEEP_BATCH: usize = 100;

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Age at which an unaccepted request is cancelled.
    pub window: chrono::Duration,
    /// Pause between sweeps.
    pub interval: Duration,
    /// Upper bound on trips expired per sweep.
    pub batch_size: usize,
    /// Bounds on the listing query.
    pub store_retry: RetryPolicy,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_EXPIRY_WINDOW,
            interval: DEFAULT_SWEEP_INTERVAL,
            batch_size: DEFAULT_SWEEP_BATCH,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Periodic expiry of stale requests.
pub struct ExpirySweeper {
    trips: Arc<dyn TripStore>,
    saga: TripSaga,
    clock: Arc<dyn Clock>,
    config: ExpiryConfig,
}

impl ExpirySweeper {
    /// Create a sweeper. `trips` must be the store behind `saga`.
    #[must_use]
    pub fn new(
        trips: Arc<dyn TripStore>,
        saga: TripSaga,
        clock: Arc<dyn Clock>,
        config: ExpiryConfig,
    ) -> Self {
        Self {
            trips,
            saga,
            clock,
            config,
        }
    }

    /// Run one sweep. Returns how many trips were expired.
    ///
    /// Pages through every overdue request, `batch_size` at a time, until a
    /// page comes back short. A failure on one trip is logged and the sweep
    /// moves on to the next; a full page in which nothing could be expired
    /// ends the sweep so the next tick retries it.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] if the stale trips cannot be listed.
    pub async fn sweep_once(&self) -> Result<usize, SagaError> {
        let started = Instant::now();
        let cutoff = self.clock.now() - self.config.window;
        let batch_size = self.config.batch_size.max(1);

        let mut expired = 0_usize;
        loop {
            // Expired trips leave `Requested`, so each listing starts at the
            // oldest request still waiting.
            let stale = retry_store(&self.config.store_retry, || {
                self.trips.list_expired_requests(cutoff, batch_size)
            })
            .await?;
            let listed = stale.len();

            let mut expired_in_page = 0_usize;
            for trip_id in stale {
                match self.saga.expire_trip(trip_id).await {
                    Ok(Some(_)) => expired_in_page += 1,
                    Ok(None) => {},
                    Err(e) => tracing::warn!(%trip_id, error = %e, "Failed to expire trip"),
                }
            }
            expired += expired_in_page;

            if listed < batch_size {
                break;
            }
            if expired_in_page == 0 {
                tracing::warn!(listed, %cutoff, "No progress on a full page of overdue trips");
                break;
            }
        }

        TripMetrics::record_expired(u64::try_from(expired).unwrap_or(u64::MAX));
        TripMetrics::record_sweep(started.elapsed());
        if expired > 0 {
            tracing::info!(expired, %cutoff, "Expired unaccepted trip requests");
        }
        Ok(expired)
    }

    /// Spawn the sweep loop. It stops on `shutdown`.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                window_secs = self.config.window.num_seconds(),
                interval = ?self.config.interval,
                "Expiry sweeper started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Expiry sweeper stopped");
        })
    }
}

impl std::fmt::Debug for ExpirySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirySweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
