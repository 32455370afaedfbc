//! Flush behavior of the queue manager against the fake remote.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{harness, record};
use stockroom_core::{MutationSpec, MutationStatus, QueuedMutation};
use stockroom_db::QueueStore;
use stockroom_sync::{RemoteError, SyncError};

#[tokio::test]
async fn test_executes_in_enqueue_order() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.remote.seed("lots", "L-2", json!({ "qty": 1 }));

    h.manager
        .enqueue(MutationSpec::update("lots", "L-2", record(json!({ "qty": 5 })), None))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::create("movements", record(json!({ "qty": 5 }))))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await
        .unwrap();

    let summary = h.manager.flush().await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(
        h.remote.call_log(),
        vec!["PATCH lots/L-2", "POST movements", "DELETE lots/L-1"]
    );
    assert!(h.manager.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));

    h.manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await
        .unwrap();
    // Never existed on the server
    h.manager
        .enqueue(MutationSpec::delete("lots", "L-404"))
        .await
        .unwrap();

    let summary = h.manager.flush().await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert!(h.remote.record("lots", "L-1").is_none());
}

#[tokio::test]
async fn test_lost_create_response_does_not_double_apply() {
    let h = harness().await;
    h.remote.lose_next_create_response();

    let id = h
        .manager
        .enqueue(MutationSpec::create("lots", record(json!({ "code": "L-9" }))))
        .await
        .unwrap();

    let first = h.manager.flush().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(h.remote.records_in("lots").len(), 1);

    let second = h.manager.flush().await.unwrap();
    assert_eq!(second.succeeded, 1);

    // Same idempotency key both times, one server record
    let keys: Vec<_> = h
        .remote
        .calls()
        .into_iter()
        .filter_map(|call| call.idempotency_key)
        .collect();
    assert_eq!(keys, vec![id.clone(), id]);
    assert_eq!(h.remote.records_in("lots").len(), 1);
}

#[tokio::test]
async fn test_rejected_mutation_does_not_stop_the_rest() {
    let h = harness().await;
    for id in ["L-1", "L-2", "L-3"] {
        h.remote.seed("lots", id, json!({ "qty": 1 }));
    }
    h.remote.fail_record(
        "lots",
        "L-2",
        RemoteError::Client {
            status: 400,
            message: "qty must be positive".into(),
        },
        1,
    );

    let mut ids = Vec::new();
    for (id, qty) in [("L-1", 2), ("L-2", -1), ("L-3", 4)] {
        ids.push(
            h.manager
                .enqueue(MutationSpec::update("lots", id, record(json!({ "qty": qty })), None))
                .await
                .unwrap(),
        );
    }

    let summary = h.manager.flush().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let failed = h.manager.get(&ids[1]).await.unwrap().unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .contains("qty must be positive"));

    assert_eq!(h.remote.record("lots", "L-1").unwrap()["qty"], json!(2));
    assert_eq!(h.remote.record("lots", "L-3").unwrap()["qty"], json!(4));

    // A second flush leaves the failed entry alone
    let again = h.manager.flush().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_transient_failures_stop_at_max_retries() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.remote.fail_all(Some(RemoteError::Server {
        status: 503,
        message: "maintenance".into(),
    }));

    let id = h
        .manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 2 })), None))
        .await
        .unwrap();

    // max_retries = 3
    assert_eq!(h.manager.flush().await.unwrap().retried, 1);
    assert_eq!(h.manager.flush().await.unwrap().retried, 1);
    assert_eq!(h.manager.flush().await.unwrap().failed, 1);

    let entry = h.manager.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, MutationStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert!(entry.next_attempt_at.is_none());

    // Never retried automatically, even once the server recovers
    h.remote.fail_all(None);
    h.manager.flush().await.unwrap();
    assert_eq!(h.remote.calls().len(), 3);

    // Manual retry starts over
    h.manager.retry_failed(&id).await.unwrap();
    let entry = h.manager.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, MutationStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert!(entry.last_error.is_none());

    assert_eq!(h.manager.flush().await.unwrap().succeeded, 1);
}

#[tokio::test]
async fn test_retry_failed_rejects_other_statuses() {
    let h = harness().await;
    let id = h
        .manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await
        .unwrap();

    assert!(matches!(
        h.manager.retry_failed(&id).await,
        Err(SyncError::Core(_))
    ));
    assert!(matches!(
        h.manager.retry_failed("missing").await,
        Err(SyncError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_retried_entry_blocks_later_entries_on_same_record() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.remote.seed("lots", "L-2", json!({ "qty": 1 }));
    h.remote
        .fail_record("lots", "L-1", RemoteError::Network("reset".into()), 1);

    h.manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 2 })), None))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 3 })), None))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::update("lots", "L-2", record(json!({ "qty": 9 })), None))
        .await
        .unwrap();

    let first = h.manager.flush().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.deferred, 1);
    assert_eq!(first.succeeded, 1);

    let second = h.manager.flush().await.unwrap();
    assert_eq!(second.succeeded, 2);

    // Last write wins because order held
    assert_eq!(h.remote.record("lots", "L-1").unwrap()["qty"], json!(3));
}

#[tokio::test]
async fn test_provisional_create_id_is_rebound() {
    let h = harness().await;
    h.remote.seed("bins", "B-1", json!({ "label": "dock" }));

    h.manager
        .enqueue(
            MutationSpec::create("lots", record(json!({ "code": "L-9" })))
                .with_provisional_id("tmp-1"),
        )
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::update("lots", "tmp-1", record(json!({ "qty": 5 })), None))
        .await
        .unwrap();
    h.manager
        .enqueue(MutationSpec::create(
            "movements",
            record(json!({ "lot_id": "tmp-1", "bin_id": "B-1" })),
        ))
        .await
        .unwrap();

    // The create fails once: its dependents wait
    h.remote.fail_all(Some(RemoteError::Network("offline".into())));
    let first = h.manager.flush().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.deferred, 2);
    assert_eq!(h.remote.calls().len(), 1);

    h.remote.fail_all(None);
    let second = h.manager.flush().await.unwrap();
    assert_eq!(second.succeeded, 3);

    let lot = h.remote.record("lots", "srv-1").unwrap();
    assert_eq!(lot["qty"], json!(5));

    let movements = h.remote.records_in("movements");
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0]["lot_id"], json!("srv-1"));
    assert_eq!(movements[0]["bin_id"], json!("B-1"));
}

#[tokio::test]
async fn test_interrupted_entries_are_recovered_on_init() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));

    let mut orphan = QueuedMutation::from_spec(MutationSpec::update(
        "lots",
        "L-1",
        record(json!({ "qty": 7 })),
        None,
    ));
    orphan.status = MutationStatus::InFlight;
    h.store.insert(&orphan).await.unwrap();

    // Not picked up while still marked in flight
    assert!(h.manager.flush().await.unwrap().is_empty());

    assert_eq!(h.manager.init().await.unwrap(), 1);
    assert_eq!(h.manager.flush().await.unwrap().succeeded, 1);
    assert_eq!(h.remote.record("lots", "L-1").unwrap()["qty"], json!(7));
}

#[tokio::test]
async fn test_concurrent_flush_is_coalesced() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 2 })), None))
        .await
        .unwrap();

    h.remote.pause();
    let manager = Arc::clone(&h.manager);
    let running = tokio::spawn(async move { manager.flush().await });

    h.remote.wait_entered().await;
    assert!(h.manager.is_processing());
    assert!(h.manager.try_flush().await.unwrap().is_none());

    h.remote.resume();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(!h.manager.is_processing());
    assert!(h.manager.last_sync_at().await.is_some());
    assert_eq!(h.remote.calls().len(), 1);
}

#[tokio::test]
async fn test_slow_remote_counts_as_transient() {
    let h = harness().await;
    let manager = stockroom_sync::SyncQueueManager::new(h.store.clone(), h.remote.clone())
        .with_retry_policy(common::fast_policy())
        .with_request_timeout(Duration::from_millis(50));

    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.remote.set_latency(Some(Duration::from_millis(500)));

    let id = manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 2 })), None))
        .await
        .unwrap();

    let summary = manager.flush().await.unwrap();
    assert_eq!(summary.retried, 1);

    let entry = manager.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, MutationStatus::Pending);
    assert!(entry.last_error.unwrap().contains("timed out"));
    assert!(entry.next_attempt_at.unwrap() <= Utc::now());
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_storage() {
    let h = harness().await;

    let mut spec = MutationSpec::delete("lots", "L-1");
    spec.record_id = None;

    assert!(matches!(
        h.manager.enqueue(spec).await,
        Err(SyncError::Validation(_))
    ));
    assert!(h.manager.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_storage_failure_reaches_the_caller() {
    let h = harness().await;
    h.db.close().await;

    let result = h
        .manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await;

    match result {
        Err(err @ SyncError::Storage(_)) => assert!(err.is_retryable()),
        other => panic!("expected storage error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_discard_removes_one_entry() {
    let h = harness().await;
    let id = h
        .manager
        .enqueue(MutationSpec::delete("lots", "L-1"))
        .await
        .unwrap();

    h.manager.discard(&id).await.unwrap();
    assert!(h.manager.get(&id).await.unwrap().is_none());
    assert!(matches!(
        h.manager.discard(&id).await,
        Err(SyncError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_oversized_retry_after_is_capped() {
    let h = harness().await;
    h.remote.seed("lots", "L-1", json!({ "qty": 1 }));
    h.remote.fail_record(
        "lots",
        "L-1",
        RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(u64::MAX)),
        },
        1,
    );

    let id = h
        .manager
        .enqueue(MutationSpec::update("lots", "L-1", record(json!({ "qty": 2 })), None))
        .await
        .unwrap();

    assert_eq!(h.manager.flush().await.unwrap().retried, 1);

    // Held back no longer than max_backoff (one second here)
    let entry = h.manager.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, MutationStatus::Pending);
    let next = entry.next_attempt_at.unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + chrono::Duration::seconds(2));
}

#[tokio::test]
async fn test_entries_behind_a_failed_create_say_why() {
    let h = harness().await;
    let create_id = h
        .manager
        .enqueue(
            MutationSpec::create("lots", record(json!({ "code": "L-9" })))
                .with_provisional_id("tmp-1"),
        )
        .await
        .unwrap();
    let update_id = h
        .manager
        .enqueue(MutationSpec::update("lots", "tmp-1", record(json!({ "qty": 5 })), None))
        .await
        .unwrap();

    h.remote.fail_all(Some(RemoteError::Client {
        status: 422,
        message: "code taken".into(),
    }));
    let first = h.manager.flush().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 1);

    let stalled = h.manager.get(&update_id).await.unwrap().unwrap();
    assert_eq!(stalled.status, MutationStatus::Pending);
    assert_eq!(
        stalled.last_error,
        Some(format!("waiting for failed create {create_id}"))
    );

    // Retrying the create releases the dependent
    h.remote.fail_all(None);
    h.manager.retry_failed(&create_id).await.unwrap();
    assert_eq!(h.manager.flush().await.unwrap().succeeded, 2);
    assert_eq!(h.remote.record("lots", "srv-1").unwrap()["qty"], json!(5));
}
