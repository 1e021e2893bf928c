//! Rideflow node.
//!
//! Runs both sides of the trip choreography in one process:
//!
//! - the trip-side consumer (`trip-service` group) applying driver requests
//!   to trips through the saga
//! - the driver-side consumer (`driver-service` group) keeping availability in
//!   step with authoritative trip events
//! - the expiry sweep cancelling requests nobody accepted
//!
//! Several nodes may run against the same database and brokers; the consumer
//! groups split deliveries between them and the stores arbitrate races.

mod config;

use anyhow::Context;
use config::Config;
use rideflow_core::environment::{Clock, SystemClock};
use rideflow_core::event::Subject;
use rideflow_core::event_bus::EventBus;
use rideflow_core::store::{DriverStore, TripStore};
use rideflow_postgres::{PostgresDriverStore, PostgresTripStore};
use rideflow_redpanda::RedpandaEventBus;
use rideflow_runtime::handlers::{
    DRIVER_SERVICE_GROUP, DRIVER_SERVICE_SUBJECTS, TRIP_SERVICE_GROUP, TRIP_SERVICE_SUBJECTS,
};
use rideflow_runtime::metrics::MetricsServer;
use rideflow_runtime::{
    DispatchService, DriverEventHandler, EventConsumer, EventHandler, ExpirySweeper, TripEventHandler,
    TripSaga,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        brokers = %config.redpanda.brokers,
        expiry_window_secs = config.expiry.window_secs,
        consumer_concurrency = config.consumer.concurrency,
        "Starting Rideflow node"
    );

    let mut metrics = MetricsServer::new(config.server.metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    info!("Connecting to PostgreSQL...");
    let pool = rideflow_postgres::connect(&config.postgres.url, &config.pool_settings())
        .await
        .context("Failed to connect to PostgreSQL")?;
    rideflow_postgres::migrate(&pool)
        .await
        .context("Failed to migrate database")?;
    let trips: Arc<dyn TripStore> = Arc::new(PostgresTripStore::new(pool.clone()));
    let drivers: Arc<dyn DriverStore> = Arc::new(PostgresDriverStore::new(pool));
    info!("Stores ready");

    let event_bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .producer_acks(&config.redpanda.acks)
            .auto_offset_reset(&config.redpanda.auto_offset_reset)
            .build()
            .context("Failed to create event bus")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let saga = TripSaga::new(
        Arc::clone(&trips),
        Arc::clone(&event_bus),
        Arc::clone(&clock),
        config.saga_config(),
    );
    let dispatch = DispatchService::new(
        Arc::clone(&drivers),
        Arc::clone(&event_bus),
        Arc::clone(&clock),
        config.dispatch_config(),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let trip_consumer = consumer(
        &config,
        TRIP_SERVICE_GROUP,
        &TRIP_SERVICE_SUBJECTS,
        Arc::clone(&event_bus),
        Arc::new(TripEventHandler::new(saga.clone())),
        shutdown_tx.subscribe(),
    )?;
    tasks.push(("trip consumer", trip_consumer.spawn()));

    let driver_consumer = consumer(
        &config,
        DRIVER_SERVICE_GROUP,
        &DRIVER_SERVICE_SUBJECTS,
        Arc::clone(&event_bus),
        Arc::new(DriverEventHandler::new(
            drivers,
            Arc::clone(&clock),
            config.retry_policy(),
        )),
        shutdown_tx.subscribe(),
    )?;
    tasks.push(("driver consumer", driver_consumer.spawn()));

    let sweeper = ExpirySweeper::new(trips, saga, clock, config.expiry_config());
    tasks.push(("expiry sweeper", sweeper.spawn(shutdown_tx.subscribe())));

    tasks.push((
        "availability gauge",
        spawn_availability_gauge(
            dispatch,
            Duration::from_secs(config.dispatch.availability_refresh_secs),
            shutdown_tx.subscribe(),
        ),
    ));

    info!(tasks = tasks.len(), "Rideflow node running");
    shutdown_signal().await;

    // Receivers may already be gone if a task exited early.
    let _ = shutdown_tx.send(());
    let deadline = Duration::from_secs(config.server.shutdown_timeout_secs);
    for (name, handle) in tasks {
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => info!(task = name, "Stopped"),
            Ok(Err(e)) => error!(task = name, error = %e, "Task panicked"),
            Err(_) => warn!(task = name, "Did not stop before the shutdown deadline"),
        }
    }

    info!("Rideflow node stopped");
    Ok(())
}

fn consumer(
    config: &Config,
    group: &str,
    subjects: &[Subject],
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<EventConsumer> {
    EventConsumer::builder()
        .name(group)
        .topics(subjects.iter().map(|s| s.as_str().to_string()).collect())
        .group(group)
        .event_bus(event_bus)
        .handler(handler)
        .shutdown(shutdown)
        .concurrency(config.consumer.concurrency)
        .retry_delay(Duration::from_secs(config.consumer.retry_delay_secs))
        .build()
        .with_context(|| format!("Failed to build {group} consumer"))
}

/// Periodically refresh the available-driver gauge.
fn spawn_availability_gauge(
    dispatch: DispatchService,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = dispatch.available_driver_count().await {
                        warn!(error = %e, "Failed to count available drivers");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal, shutting down gracefully..."),
        () = terminate => info!("Received SIGTERM signal, shutting down gracefully..."),
    }
}
