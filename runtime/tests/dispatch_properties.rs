//! Property tests for candidate search and assignment over generated inputs.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code

use proptest::prelude::*;
use rideflow_core::actor::Actor;
use rideflow_core::driver::DriverAvailability;
use rideflow_core::environment::Clock;
use rideflow_core::error::SagaError;
use rideflow_core::geo::{Coordinates, Location};
use rideflow_core::ids::{DriverId, RiderId, TripId};
use rideflow_runtime::{DispatchConfig, DispatchService, SagaConfig, TripRequest, TripSaga};
use rideflow_testing::properties::{coordinates, driver_id};
use rideflow_testing::{InMemoryDriverStore, InMemoryEventBus, InMemoryTripStore, test_clock};
use std::collections::HashSet;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

/// A driver somewhere near `origin`, online unless `busy`.
fn driver_near(
    id: DriverId,
    origin: Coordinates,
    offset: (f64, f64),
    busy: bool,
) -> DriverAvailability {
    let mut driver = DriverAvailability::new(id, test_clock().now());
    driver.is_online = true;
    driver.location = Some(Coordinates::new(
        (origin.latitude + offset.0).clamp(-89.9, 89.9),
        (origin.longitude + offset.1).clamp(-179.9, 179.9),
    ));
    if busy {
        driver.current_trip_id = Some(TripId::new());
    }
    driver
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn candidates_are_idle_nearby_and_nearest_first(
        pickup in coordinates(),
        fleet in proptest::collection::vec(
            (driver_id(), -0.08f64..0.08, -0.08f64..0.08, any::<bool>()),
            0..30,
        ),
        radius in 0.5f64..10.0,
        limit in 1usize..12,
    ) {
        let drivers = InMemoryDriverStore::new();
        let mut idle = HashSet::new();
        for (id, dlat, dlng, busy) in fleet {
            if !busy {
                idle.insert(id.clone());
            }
            drivers.put(driver_near(id, pickup, (dlat, dlng), busy));
        }
        // A later duplicate id replaces the earlier record.
        let idle: HashSet<DriverId> = drivers
            .all()
            .into_iter()
            .filter(|d| d.current_trip_id.is_none() && idle.contains(&d.driver_id))
            .map(|d| d.driver_id)
            .collect();

        let service = DispatchService::new(
            Arc::new(drivers),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(test_clock()),
            DispatchConfig::default(),
        );
        let found = runtime()
            .block_on(service.find_candidates(pickup, Some(radius), Some(limit)))
            .unwrap();

        prop_assert!(found.len() <= limit);
        let mut seen = HashSet::new();
        for candidate in &found {
            prop_assert!(candidate.distance_km <= radius);
            prop_assert!(idle.contains(&candidate.driver_id));
            prop_assert!(seen.insert(candidate.driver_id.clone()));
        }
        for pair in found.windows(2) {
            prop_assert!(pair[0].distance_km <= pair[1].distance_km);
        }
    }

    #[test]
    fn first_assignment_wins_and_sticks(
        pickup in coordinates(),
        dropoff in coordinates(),
        contenders in proptest::collection::vec(driver_id(), 1..8),
    ) {
        let saga = TripSaga::new(
            Arc::new(InMemoryTripStore::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(test_clock()),
            SagaConfig::default(),
        );

        runtime().block_on(async {
            let trip = saga
                .create_trip(
                    &Actor::Rider(RiderId::new("rider-1")),
                    TripRequest {
                        pickup: Location::new(pickup.latitude, pickup.longitude, "pickup"),
                        dropoff: Location::new(dropoff.latitude, dropoff.longitude, "dropoff"),
                    },
                )
                .await
                .unwrap();

            let winner = contenders[0].clone();
            saga.assign_driver(&Actor::System, trip.id, winner.clone()).await.unwrap();
            for other in &contenders[1..] {
                let result = saga.assign_driver(&Actor::System, trip.id, other.clone()).await;
                prop_assert!(matches!(result, Err(SagaError::Conflict(_))));
            }

            let stored = saga.get_trip(&Actor::System, trip.id).await.unwrap();
            prop_assert_eq!(stored.driver_id, Some(winner));
            prop_assert_eq!(stored.accepted_at, Some(test_clock().now()));
            Ok(())
        })?;
    }
}
