//! Mode facade integration tests.
//!
//! Verifies:
//! - Racing mode changes from the same starting mode have one winner
//! - A connected facade replicates through a real driver
//! - A supervisor can resolve a reconnection while calls wait on it

mod common;

use std::sync::Arc;

use canopy_core::{TreeDriver, TreeReplica};
use canopy_replica::{
    DriverError, DriverMode, ModeFacade, ReplicaDriver, ReplicationDriver, SharedDriver,
};
use serde_json::json;
use tokio::sync::Barrier;

use common::{fragmented, init_logging, open_store, reference};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mode_race_has_one_winner() {
    init_logging();
    let (_dir, store) = open_store();
    let downstream = Arc::new(TreeReplica::new(json!({})));
    let facade = Arc::new(ModeFacade::disconnected("race", Arc::clone(&downstream)));
    let driver: SharedDriver =
        Arc::new(ReplicationDriver::new(fragmented("race"), Arc::new(store), downstream).unwrap());

    let from = facade.current_implementation();
    let to = Arc::new(DriverMode::Connected(driver));
    let barrier = Arc::new(Barrier::new(2));

    let racers: Vec<_> = (0..2)
        .map(|_| {
            let facade = Arc::clone(&facade);
            let from = Arc::clone(&from);
            let to = Arc::clone(&to);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                facade.change_implementation(&from, to)
            })
        })
        .collect();

    let mut wins = 0;
    for racer in racers {
        if racer.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert!(Arc::ptr_eq(&facade.current_implementation(), &to));
}

#[tokio::test]
async fn test_connected_facade_replicates() {
    init_logging();
    let (_dir, store) = open_store();
    let downstream = Arc::new(TreeReplica::new(json!({"catalog": {}})));
    let driver = ReplicationDriver::new(fragmented("facade"), Arc::new(store), Arc::clone(&downstream)).unwrap();
    let facade = ModeFacade::connected("facade", Arc::clone(&downstream), Arc::new(driver));

    assert_eq!(facade.initial_root().await.unwrap(), json!({"catalog": {}}));
    facade
        .submit_replacement(&reference("/catalog/e1"), json!({"x": 1}))
        .await
        .unwrap();
    facade.flush().await.unwrap();
    assert_eq!(
        downstream.snapshot().unwrap(),
        json!({"catalog": {"e1": {"x": 1}}})
    );

    facade.close().await;
    assert_eq!(facade.current_implementation().name(), "disconnected");
    assert!(matches!(
        facade.submit_deletion(&reference("/catalog/e1")).await,
        Err(DriverError::Disconnected)
    ));
    // Disconnected mode answers from the downstream's own initial state
    assert_eq!(facade.initial_root().await.unwrap(), json!({"catalog": {}}));
}

#[tokio::test]
async fn test_supervisor_resolves_reconnection() {
    init_logging();
    let (_dir, store) = open_store();
    let downstream = Arc::new(TreeReplica::new(json!({"catalog": {}})));
    let facade = Arc::new(ModeFacade::disconnected("supervised", Arc::clone(&downstream)));

    let handle = facade
        .begin_reconnection(&facade.current_implementation())
        .unwrap();
    let waiting = {
        let facade = Arc::clone(&facade);
        tokio::spawn(async move {
            facade
                .submit_replacement(&reference("/catalog/e1"), json!({"x": 1}))
                .await?;
            facade.flush().await
        })
    };

    let driver = ReplicationDriver::new(fragmented("supervised"), Arc::new(store), Arc::clone(&downstream)).unwrap();
    driver.initial_root().await.unwrap();
    let driver: SharedDriver = Arc::new(driver);
    assert!(handle.complete(Arc::clone(&driver)));

    waiting.await.unwrap().unwrap();
    assert_eq!(facade.current_implementation().name(), "connected");
    assert_eq!(
        downstream.snapshot().unwrap(),
        json!({"catalog": {"e1": {"x": 1}}})
    );

    facade.close().await;
}
