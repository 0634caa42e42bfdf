// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject failures and verify graceful degradation.
//!
//! These run against the in-memory stores, so no Docker is needed. They check
//! the engine keeps going (or fails cleanly) without panics, deadlocks or
//! duplicated documents.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, MemoryPair};
use mongo_bisync::{
    circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError},
    config::SyncConfig,
    coordinator::{CoordinatorState, Direction, WorkerState},
    reconcile::ReconcileDirection,
    resume::ResumeTokenStore,
    ResumeToken,
};
use mongodb::bson::{doc, Bson};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;

const WITHIN: Duration = Duration::from_secs(3);

// =============================================================================
// Resume Token Crash Recovery
// =============================================================================

/// Test: Unflushed positions are lost, flushed ones survive
#[tokio::test]
async fn resume_store_crash_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("resume.db");

    {
        let store = ResumeTokenStore::open(&db_path).await.unwrap();
        store
            .set(Direction::LocalToRemote, ResumeToken::from_bytes(vec![1]))
            .await;
        store.flush_dirty().await.unwrap();
        store
            .set(Direction::LocalToRemote, ResumeToken::from_bytes(vec![2]))
            .await;
        store.flush_dirty().await.unwrap();

        // Never flushed: simulates a crash.
        store
            .set(Direction::LocalToRemote, ResumeToken::from_bytes(vec![3]))
            .await;
    }

    let store = ResumeTokenStore::open(&db_path).await.unwrap();
    assert_eq!(
        store.get(Direction::LocalToRemote).await,
        Some(ResumeToken::from_bytes(vec![2]))
    );
    assert_eq!(store.get(Direction::RemoteToLocal).await, None);
}

/// Test: Directions are stored independently
#[tokio::test]
async fn resume_store_direction_isolation() {
    let dir = tempdir().unwrap();
    let store = ResumeTokenStore::open(dir.path().join("resume.db"))
        .await
        .unwrap();

    store
        .set(Direction::LocalToRemote, ResumeToken::from_bytes(vec![10]))
        .await;
    store
        .set(Direction::RemoteToLocal, ResumeToken::from_bytes(vec![20]))
        .await;
    assert_eq!(store.flush_dirty().await.unwrap(), 2);

    store.clear(Direction::LocalToRemote).await.unwrap();
    assert_eq!(store.get(Direction::LocalToRemote).await, None);
    assert_eq!(
        store.get(Direction::RemoteToLocal).await,
        Some(ResumeToken::from_bytes(vec![20]))
    );
    store.close().await;

    // The clear reached disk.
    let reopened = ResumeTokenStore::open(dir.path().join("resume.db"))
        .await
        .unwrap();
    assert_eq!(reopened.get(Direction::LocalToRemote).await, None);
    assert!(reopened.get(Direction::RemoteToLocal).await.is_some());
}

/// Test: Rapid position updates collapse into one write
#[tokio::test]
async fn resume_store_rapid_updates() {
    let dir = tempdir().unwrap();
    let store = ResumeTokenStore::open(dir.path().join("resume.db"))
        .await
        .unwrap();

    for i in 0..1000u32 {
        store
            .set(
                Direction::RemoteToLocal,
                ResumeToken::from_bytes(i.to_be_bytes().to_vec()),
            )
            .await;
    }

    assert_eq!(store.dirty_count().await, 1);
    assert_eq!(store.flush_dirty().await.unwrap(), 1);
    assert_eq!(
        store.get(Direction::RemoteToLocal).await,
        Some(ResumeToken::from_bytes(999u32.to_be_bytes().to_vec()))
    );
}

// =============================================================================
// Store Failure Injection
// =============================================================================

/// Test: A target outage loses live events, reconcile restores them
#[tokio::test]
async fn target_outage_then_reconcile() {
    let pair = MemoryPair::new();
    pair.sync.start().await.unwrap();

    pair.remote.set_fail_writes(true);
    for i in 0..5 {
        pair.local.insert_raw("orders", doc! { "_id": i });
    }

    assert!(
        eventually(WITHIN, || pair.sync.status().local_to_remote.apply_errors >= 5).await
    );
    assert_eq!(pair.remote.len("orders"), 0);
    // Apply errors do not kill the worker.
    assert_eq!(pair.sync.status().local_to_remote.state, WorkerState::Running);

    pair.remote.set_fail_writes(false);
    let report = pair.sync.reconcile(ReconcileDirection::LocalToRemote).await;
    assert_eq!(report.inserted, 5);
    assert_eq!(pair.remote.len("orders"), 5);

    pair.sync.stop().await;
}

/// Test: Breaks spaced wider than the stability window are each supervised
#[tokio::test]
async fn repeated_feed_breaks_recover() {
    let pair = MemoryPair::new();
    pair.sync.start().await.unwrap();

    for round in 0..5 {
        pair.local.break_feeds();
        pair.remote.break_feeds();
        // Longer than `max_retry_interval` (200ms in the test config).
        sleep(Duration::from_millis(300)).await;
        pair.local.insert_raw("bills", doc! { "_id": round });
    }

    assert!(eventually(WITHIN, || pair.remote.len("bills") == 5).await);
    let status = pair.sync.status();
    assert_eq!(status.state, CoordinatorState::Running);
    assert!(status.local_to_remote.restarts >= 5);
    assert!(status.healthy);

    pair.sync.stop().await;
}

/// Test: A flapping source runs out of restarts and degrades the coordinator
#[tokio::test]
async fn flapping_source_exhausts_restart_budget() {
    let pair = MemoryPair::new();
    pair.sync.start().await.unwrap();

    // Each reopen works but the stream drops again well inside the window.
    for _ in 0..10 {
        pair.local.break_feeds();
        sleep(Duration::from_millis(80)).await;
    }

    assert!(
        eventually(WITHIN, || {
            pair.sync.status().local_to_remote.state == WorkerState::Failed
        })
        .await
    );
    let status = pair.sync.status();
    assert_eq!(status.local_to_remote.restarts, 3);
    assert_eq!(status.state, CoordinatorState::Degraded);
    assert!(!status.healthy);

    pair.sync.stop().await;
}

/// Test: A source that refuses to reopen degrades the coordinator
#[tokio::test]
async fn unrecoverable_source_degrades() {
    let pair = MemoryPair::new();
    pair.sync.start().await.unwrap();

    pair.remote.set_fail_watch(true);
    pair.remote.break_feeds();

    assert!(
        eventually(WITHIN, || {
            pair.sync.status().remote_to_local.state == WorkerState::Failed
        })
        .await
    );
    assert_eq!(pair.sync.state(), CoordinatorState::Degraded);

    // The other direction keeps working.
    pair.local.insert_raw("bills", doc! { "_id": "still-flowing" });
    assert!(
        eventually(WITHIN, || {
            pair.remote.get("bills", &Bson::String("still-flowing".into())).is_some()
        })
        .await
    );

    // Source heals, start() brings the failed direction back.
    pair.remote.set_fail_watch(false);
    let report = pair.sync.start().await.unwrap();
    assert_eq!(report.started, vec![Direction::RemoteToLocal]);
    assert_eq!(pair.sync.state(), CoordinatorState::Running);

    pair.sync.stop().await;
}

/// Test: Interleaved writers on both sides converge without duplicates
#[tokio::test]
async fn concurrent_writers_converge() {
    let pair = Arc::new(MemoryPair::new());
    pair.sync.start().await.unwrap();

    let local = Arc::clone(&pair.local);
    let remote = Arc::clone(&pair.remote);
    let a = tokio::spawn(async move {
        for i in 0..50 {
            local.insert_raw("orders", doc! { "_id": format!("l{i}") });
            tokio::task::yield_now().await;
        }
    });
    let b = tokio::spawn(async move {
        for i in 0..50 {
            remote.insert_raw("orders", doc! { "_id": format!("r{i}") });
            tokio::task::yield_now().await;
        }
    });
    a.await.unwrap();
    b.await.unwrap();

    assert!(
        eventually(WITHIN, || {
            pair.local.len("orders") == 100 && pair.remote.len("orders") == 100
        })
        .await
    );
    pair.settle(Duration::from_millis(200)).await;
    assert_eq!(pair.local.len("orders"), 100);
    assert_eq!(pair.remote.len("orders"), 100);

    pair.sync.stop().await;
}

/// Test: Stop during an outage returns promptly
#[tokio::test]
async fn stop_during_outage_does_not_hang() {
    let config = SyncConfig {
        worker: mongo_bisync::config::WorkerConfig {
            circuit_failure_threshold: 1,
            circuit_reset_timeout_sec: 60,
            ..mongo_bisync::config::WorkerConfig::for_testing()
        },
        ..SyncConfig::for_testing()
    };
    let pair = MemoryPair::with_config(config);
    pair.sync.start().await.unwrap();

    pair.remote.set_fail_writes(true);
    pair.local.insert_raw("bills", doc! { "_id": 1 });
    pair.local.insert_raw("bills", doc! { "_id": 2 });
    sleep(Duration::from_millis(100)).await;

    // Worker is parked waiting for the circuit.
    tokio::time::timeout(Duration::from_secs(5), pair.sync.stop())
        .await
        .expect("stop should not hang");
    assert_eq!(pair.sync.state(), CoordinatorState::Stopped);
}

// =============================================================================
// Circuit Breaker Stress Tests
// =============================================================================

/// Test: An open circuit stops calls reaching the target
#[tokio::test]
async fn circuit_breaker_prevents_cascade() {
    let executed = Arc::new(AtomicU32::new(0));
    let circuit = CircuitBreaker::new(
        "cascade-test",
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(100),
        },
    );

    for _ in 0..10 {
        let counter = executed.clone();
        let _: Result<(), CircuitError<&str>> = circuit
            .call(|| async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err("target down")
            })
            .await;
    }

    assert!(executed.load(Ordering::Relaxed) < 10);
    assert!(circuit.rejections() > 0);

    sleep(Duration::from_millis(150)).await;

    let result: Result<(), CircuitError<&str>> = circuit.call(|| async { Ok(()) }).await;
    assert!(result.is_ok());
}

/// Test: Rapid open/recover cycles
#[tokio::test]
async fn circuit_breaker_rapid_cycles() {
    let circuit = CircuitBreaker::new(
        "rapid-cycle",
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
        },
    );

    for cycle in 0..5 {
        for _ in 0..2 {
            let _: Result<(), CircuitError<&str>> =
                circuit.call(|| async { Err("fail") }).await;
        }
        sleep(Duration::from_millis(15)).await;

        let result: Result<i32, CircuitError<&str>> = circuit.call(|| async { Ok(42) }).await;
        assert!(result.is_ok(), "cycle {} should recover", cycle);
    }
}

/// Test: Concurrent callers share one breaker
#[tokio::test]
async fn circuit_breaker_concurrent_access() {
    use tokio::task::JoinSet;

    let circuit = Arc::new(CircuitBreaker::new(
        "concurrent",
        CircuitConfig {
            failure_threshold: 100,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        },
    ));

    let mut tasks = JoinSet::new();
    for _ in 0..100 {
        let c = circuit.clone();
        tasks.spawn(async move {
            let result: Result<(), CircuitError<&str>> = c.call(|| async { Ok(()) }).await;
            result.is_ok()
        });
    }

    let mut ok = 0;
    while let Some(r) = tasks.join_next().await {
        if r.unwrap() {
            ok += 1;
        }
    }
    assert_eq!(ok, 100);
    assert_eq!(circuit.calls_total(), 100);
}
