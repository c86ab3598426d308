//! Redelivery, outages, poison messages, lost tasks and interrupted finalization.

mod common;

use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use common::{ImageServer, TestSystem};
use imagebatch_core::messaging::{
    submit_message, EnqueueReason, ImageUnitMessage, Lane, QueuedMessage, TaskQueue,
};
use imagebatch_core::error::ImageBatchError;
use imagebatch_core::orchestration::{DispatchOutcome, IntakeRow};
use imagebatch_core::state_machine::{BatchState, UnitState};
use imagebatch_core::store::BatchStore;
use imagebatch_core::worker::MessageDisposition;

const LONG: Duration = Duration::from_secs(60);

fn unit_of(message: &QueuedMessage) -> uuid::Uuid {
    message
        .parse::<ImageUnitMessage>()
        .expect("unit message")
        .image_unit_uuid
}

#[tokio::test]
async fn test_redelivered_completed_unit_is_not_counted_twice() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let b = images.serve_png("/b.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});
    let pool = harness.system.worker_pool();
    let store = harness.system.store();

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str(), b.as_str()])], None)
        .await
        .unwrap();

    let first = harness.queue.read(Lane::Image, LONG, 1).await.unwrap();
    assert_eq!(pool.handle_message(&first[0]).await, MessageDisposition::Acked);
    let done = store.find_unit(unit_of(&first[0])).await.unwrap().unwrap();
    assert_eq!(done.status, UnitState::Completed);

    // Same unit delivered again, as after a lost ack
    let duplicate = ImageUnitMessage::for_unit(&done, Lane::Image, EnqueueReason::Dispatch);
    submit_message(harness.queue.as_ref(), Lane::Image, &duplicate)
        .await
        .unwrap();

    let rest = harness.queue.read(Lane::Image, LONG, 10).await.unwrap();
    assert_eq!(rest.len(), 2);
    let (dup, other): (Vec<_>, Vec<_>) = rest
        .into_iter()
        .partition(|m| unit_of(m) == done.image_unit_uuid);

    assert_eq!(pool.handle_message(&dup[0]).await, MessageDisposition::Acked);
    let batch = store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.remaining_units, 1);
    assert_eq!(batch.status, BatchState::Processing);
    let unchanged = store.find_unit(done.image_unit_uuid).await.unwrap().unwrap();
    assert_eq!(unchanged.attempts, 1);
    assert_eq!(unchanged.output_url, done.output_url);

    assert_eq!(pool.handle_message(&other[0]).await, MessageDisposition::Acked);
    let batch = store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.remaining_units, 0);
    assert_eq!(batch.status, BatchState::Completed);
    assert_eq!(store.list_reports(report.batch_uuid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_store_outage_leaves_message_for_redelivery() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();

    harness.store.set_available(false);
    let messages = harness
        .queue
        .read(Lane::Image, Duration::ZERO, 1)
        .await
        .unwrap();
    assert_eq!(
        harness.system.worker_pool().handle_message(&messages[0]).await,
        MessageDisposition::Retained
    );
    assert_eq!(harness.lane_depth(Lane::Image).await, 1);

    harness.store.set_available(true);
    harness.drain().await;
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );
    assert_eq!(harness.lane_depth(Lane::Image).await, 0);
}

#[tokio::test]
async fn test_message_read_too_often_fails_its_unit() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|config| config.queue.max_read_count = 2);

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();

    // Two deliveries that never settle
    for _ in 0..2 {
        harness
            .queue
            .read(Lane::Image, Duration::ZERO, 1)
            .await
            .unwrap();
    }
    let third = harness
        .queue
        .read(Lane::Image, Duration::ZERO, 1)
        .await
        .unwrap();
    assert_eq!(third[0].read_count, 3);
    assert_eq!(
        harness.system.worker_pool().handle_message(&third[0]).await,
        MessageDisposition::Archived
    );

    let archived = harness.queue.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].reason, "read 3 times");

    let unit = harness
        .system
        .store()
        .find_unit(unit_of(&third[0]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.status, UnitState::Failed);
    assert!(unit.error_message.unwrap().starts_with("abandoned"));
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Failed
    );
}

#[tokio::test]
async fn test_malformed_payload_is_archived() {
    let harness = TestSystem::new(|_| {});
    harness
        .queue
        .submit(Lane::Image, json!({ "not": "a unit" }))
        .await
        .unwrap();

    assert_eq!(
        harness
            .system
            .worker_pool()
            .poll_once(Lane::Image)
            .await
            .unwrap(),
        1
    );
    let archived = harness.queue.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].reason, "malformed payload");
    assert_eq!(harness.lane_depth(Lane::Image).await, 0);
}

#[tokio::test]
async fn test_message_for_unknown_unit_is_archived() {
    let harness = TestSystem::new(|_| {});
    let message = json!({
        "batch_uuid": uuid::Uuid::new_v4(),
        "product_uuid": uuid::Uuid::new_v4(),
        "image_unit_uuid": uuid::Uuid::new_v4(),
        "source_url": "http://example.com/a.png",
        "metadata": {
            "lane": "image",
            "reason": "dispatch",
            "enqueued_at": Utc::now(),
        }
    });
    harness.queue.submit(Lane::Image, message).await.unwrap();

    harness.drain().await;
    assert_eq!(harness.queue.archived().len(), 1);
}

#[tokio::test]
async fn test_reconciler_resubmits_lost_tasks() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let b = images.serve_png("/b.png", 8, 8).await;
    let harness = TestSystem::new(|config| {
        config.reconciliation.enabled = true;
        config.reconciliation.stale_after_seconds = 60;
    });
    let mut received = harness.system.publisher().subscribe();

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str(), b.as_str()])], None)
        .await
        .unwrap();

    // Tasks vanish from the queue without being processed
    for message in harness.queue.read(Lane::Image, LONG, 10).await.unwrap() {
        harness.queue.ack(&message.handle).await.unwrap();
    }
    assert_eq!(harness.drain().await, 0);

    let reconciler = harness.system.reconciler();
    let fresh = reconciler.sweep().await.unwrap();
    assert_eq!(fresh.examined, 0);

    let units = harness
        .system
        .store()
        .list_units(report.batch_uuid)
        .await
        .unwrap();
    for unit in &units {
        harness
            .store
            .backdate_unit(unit.image_unit_uuid, Utc::now() - chrono::Duration::hours(1));
    }

    let summary = reconciler.sweep().await.unwrap();
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.resubmitted, 2);
    // Touched units are not stale again straight away
    assert_eq!(reconciler.sweep().await.unwrap().resubmitted, 0);

    assert_eq!(harness.drain().await, 2);
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );

    let mut requeued = 0;
    while let Ok(event) = received.try_recv() {
        if event.name == imagebatch_core::constants::events::UNIT_REQUEUED {
            requeued += 1;
        }
    }
    assert_eq!(requeued, 2);
}

#[tokio::test]
async fn test_reconciler_ignores_finished_batches() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();
    harness.drain().await;

    for unit in harness
        .system
        .store()
        .list_units(report.batch_uuid)
        .await
        .unwrap()
    {
        harness
            .store
            .backdate_unit(unit.image_unit_uuid, Utc::now() - chrono::Duration::hours(1));
    }
    assert_eq!(harness.system.reconciler().sweep().await.unwrap().examined, 0);
}

/// Process the only image message once under an injected store fault
async fn process_with_fault(harness: &TestSystem, operation: &'static str) -> MessageDisposition {
    harness.store.fail_next(operation);
    let messages = harness
        .queue
        .read(Lane::Image, Duration::ZERO, 1)
        .await
        .unwrap();
    harness.system.worker_pool().handle_message(&messages[0]).await
}

#[tokio::test]
async fn test_release_interrupted_before_outcomes_load_is_finalized_on_redelivery() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();

    assert_eq!(
        process_with_fault(&harness, "list_reports").await,
        MessageDisposition::Retained
    );
    let stuck = harness.store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(stuck.remaining_units, 0);
    assert_eq!(stuck.status, BatchState::Processing);
    assert!(stuck.finalized_at.is_none());
    assert_eq!(harness.status(report.batch_uuid).await.percentage, 100.0);

    // The redelivered unit is already terminal; its duplicate report releases again
    assert_eq!(harness.drain().await, 1);
    let batch = harness.store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchState::Completed);
    assert!(batch.finalized_at.is_some());
    assert!(batch.output_artifact.is_some());
    assert_eq!(harness.lane_depth(Lane::Image).await, 0);
}

#[tokio::test]
async fn test_failed_finalization_commit_is_retried_on_redelivery() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});
    let mut received = harness.system.publisher().subscribe();

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();

    assert_eq!(
        process_with_fault(&harness, "commit_finalization").await,
        MessageDisposition::Retained
    );
    let stuck = harness.store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(stuck.status, BatchState::Processing);
    assert!(stuck.output_artifact.is_none());

    harness.drain().await;
    let batch = harness.store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchState::Completed);
    let artifact = batch.output_artifact.expect("export key");
    assert!(artifact.ends_with(&format!("{}.csv", report.batch_uuid)));

    let mut finalized = 0;
    while let Ok(event) = received.try_recv() {
        if event.name == imagebatch_core::constants::events::BATCH_FINALIZED {
            finalized += 1;
        }
    }
    assert_eq!(finalized, 1);
}

#[tokio::test]
async fn test_reconciler_finalizes_drained_batch_whose_message_was_lost() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|config| {
        config.reconciliation.enabled = true;
        config.reconciliation.stale_after_seconds = 60;
    });

    let report = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap();

    harness.store.fail_next("list_reports");
    let messages = harness.queue.read(Lane::Image, LONG, 1).await.unwrap();
    assert_eq!(
        harness.system.worker_pool().handle_message(&messages[0]).await,
        MessageDisposition::Retained
    );
    // The retained message never comes back
    harness.queue.ack(&messages[0].handle).await.unwrap();
    assert_eq!(harness.drain().await, 0);

    let reconciler = harness.system.reconciler();
    assert_eq!(reconciler.sweep().await.unwrap().refinalized, 0);

    harness
        .store
        .backdate_batch(report.batch_uuid, Utc::now() - chrono::Duration::hours(1));
    let summary = reconciler.sweep().await.unwrap();
    assert_eq!(summary.refinalized, 1);
    assert_eq!(summary.redispatched, 0);
    assert_eq!(summary.resubmitted, 0);

    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );
    // Finalized batches drop out of the sweep
    assert_eq!(reconciler.sweep().await.unwrap().refinalized, 0);
}

#[tokio::test]
async fn test_dispatch_failure_keeps_batch_id_and_reconciler_dispatches_it() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|config| {
        config.reconciliation.enabled = true;
        config.reconciliation.stale_after_seconds = 60;
    });

    harness.store.fail_next("start_dispatch");
    let err = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    let ImageBatchError::DispatchFailed { report, .. } = err else {
        panic!("expected DispatchFailed");
    };
    assert_eq!(report.unit_count, 1);

    let batch = harness.store.find_batch(report.batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchState::Pending);
    assert_eq!(harness.lane_depth(Lane::Image).await, 0);

    harness
        .store
        .backdate_batch(report.batch_uuid, Utc::now() - chrono::Duration::hours(1));
    let summary = harness.system.reconciler().sweep().await.unwrap();
    assert_eq!(summary.redispatched, 1);
    assert_eq!(harness.lane_depth(Lane::Image).await, 1);

    harness.drain().await;
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );
}

#[tokio::test]
async fn test_dispatch_failure_can_be_retried_by_caller() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let harness = TestSystem::new(|_| {});

    harness.store.fail_next("start_dispatch");
    let Err(ImageBatchError::DispatchFailed { report, .. }) = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str()])], None)
        .await
    else {
        panic!("expected DispatchFailed");
    };

    let outcome = harness.system.dispatch(report.batch_uuid).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Dispatched(_)));
    harness.drain().await;
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );
}

#[tokio::test]
async fn test_queue_outage_during_dispatch_is_recovered_from_stale_units() {
    let images = ImageServer::start().await;
    let a = images.serve_png("/a.png", 8, 8).await;
    let b = images.serve_png("/b.png", 8, 8).await;
    let harness = TestSystem::new(|config| {
        config.reconciliation.enabled = true;
        config.reconciliation.stale_after_seconds = 60;
    });

    harness.queue.set_rejecting_submits(true);
    let err = harness
        .system
        .submit_batch(&[IntakeRow::new("1", "SKU1", [a.as_str(), b.as_str()])], None)
        .await
        .unwrap_err();
    let ImageBatchError::DispatchFailed { report, source } = err else {
        panic!("expected DispatchFailed");
    };
    assert!(matches!(*source, ImageBatchError::Messaging(_)));

    // Dispatch started, so the batch is no longer pending and a retry is a no-op
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Processing
    );
    assert!(matches!(
        harness.system.dispatch(report.batch_uuid).await.unwrap(),
        DispatchOutcome::AlreadyDispatched
    ));

    harness.queue.set_rejecting_submits(false);
    for unit in harness.store.list_units(report.batch_uuid).await.unwrap() {
        assert_eq!(unit.status, UnitState::Pending);
        harness
            .store
            .backdate_unit(unit.image_unit_uuid, Utc::now() - chrono::Duration::hours(1));
    }
    assert_eq!(harness.system.reconciler().sweep().await.unwrap().resubmitted, 2);

    harness.drain().await;
    assert_eq!(
        harness.status(report.batch_uuid).await.status,
        BatchState::Completed
    );
}
