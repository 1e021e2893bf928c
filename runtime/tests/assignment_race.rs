//! Integration tests for concurrent driver assignment.
//!
//! Many drivers race for the same trip from separate tasks on a multi-threaded
//! runtime. The store's conditional transition is the only arbiter.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use rideflow_core::actor::Actor;
use rideflow_core::error::SagaError;
use rideflow_core::ids::{DriverId, RiderId};
use rideflow_core::trip::TripStatus;
use rideflow_runtime::{SagaConfig, TripRequest, TripSaga};
use rideflow_testing::helpers::{dropoff, pickup};
use rideflow_testing::{InMemoryEventBus, InMemoryTripStore, test_clock};
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn saga(bus: &InMemoryEventBus) -> TripSaga {
    TripSaga::new(
        Arc::new(InMemoryTripStore::new()),
        Arc::new(bus.clone()),
        Arc::new(test_clock()),
        SagaConfig::default(),
    )
}

async fn requested_trip(saga: &TripSaga) -> rideflow_core::trip::Trip {
    saga.create_trip(
        &Actor::Rider(RiderId::new("rider-1")),
        TripRequest {
            pickup: pickup(),
            dropoff: dropoff(),
        },
    )
    .await
    .unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_assignments_wins() {
    const RACERS: usize = 32;

    let bus = InMemoryEventBus::new();
    let saga = saga(&bus);
    let trip = requested_trip(&saga).await;
    let trip_id = trip.id;

    let barrier = Arc::new(tokio::sync::Barrier::new(RACERS));
    let mut tasks = Vec::with_capacity(RACERS);
    for i in 0..RACERS {
        let saga = saga.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            let driver = DriverId::new(format!("driver-{i:02}"));
            barrier.wait().await;
            saga.assign_driver(&Actor::Driver(driver.clone()), trip_id, driver)
                .await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(trip) => winners.push(trip.driver_id.unwrap()),
            Err(SagaError::Conflict(id)) => {
                assert_eq!(id, trip.id);
                conflicts += 1;
            },
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, RACERS - 1);

    let stored = saga.get_trip(&Actor::System, trip.id).await.unwrap();
    assert_eq!(stored.status, TripStatus::Accepted);
    assert_eq!(stored.driver_id.as_ref(), Some(&winners[0]));

    // Only the winner's acceptance is announced.
    assert_eq!(bus.published_on("trip.accepted").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_racing_assignment_leaves_a_consistent_trip() {
    for _ in 0..20 {
        let bus = InMemoryEventBus::new();
        let saga = saga(&bus);
        let trip_id = requested_trip(&saga).await.id;
        let rider = Actor::Rider(RiderId::new("rider-1"));

        let assign = {
            let saga = saga.clone();
            tokio::spawn(async move {
                saga.assign_driver(&Actor::System, trip_id, DriverId::new("d-1"))
                    .await
            })
        };
        let cancel = {
            let saga = saga.clone();
            tokio::spawn(async move { saga.cancel_trip(&rider, trip_id, "changed plans").await })
        };
        let (assigned, cancelled) = (assign.await.unwrap(), cancel.await.unwrap());

        let stored = saga.get_trip(&Actor::System, trip_id).await.unwrap();
        assert!(cancelled.is_ok(), "cancel is valid from Requested and Accepted");
        assert_eq!(stored.status, TripStatus::Cancelled);
        match assigned {
            Ok(_) => assert_eq!(stored.driver_id, Some(DriverId::new("d-1"))),
            Err(SagaError::Conflict(_)) => assert!(stored.driver_id.is_none()),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
