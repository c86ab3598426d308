//! PostgreSQL store and queue. Needs `DATABASE_URL`; run with `cargo test -- --ignored`.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;

use imagebatch_core::messaging::{Lane, LaneQueueNames, PostgresTaskQueue, TaskQueue};
use imagebatch_core::models::{BatchCompletion, ReportOutcome, UnitReport, UnitTransition};
use imagebatch_core::orchestration::{decompose, IntakeRow};
use imagebatch_core::state_machine::{BatchState, UnitState};
use imagebatch_core::store::{BatchStore, PostgresBatchStore};

async fn seeded_batch(store: &PostgresBatchStore) -> uuid::Uuid {
    let rows = vec![
        IntakeRow::new("1", "SKU1", ["http://example.com/a.png", "http://example.com/b.png"]),
        IntakeRow::new("2", "SKU2", Vec::<String>::new()),
    ];
    let (new_batch, _) = decompose(&rows, Some("input.csv".to_string())).unwrap();
    store.create_batch(&new_batch).await.unwrap().batch_uuid
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires PostgreSQL"]
async fn test_create_batch_persists_graph(pool: PgPool) {
    let store = PostgresBatchStore::new(pool);
    let batch_uuid = seeded_batch(&store).await;

    let batch = store.find_batch(batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchState::Pending);
    assert_eq!(batch.expected_total, 2);
    assert_eq!(batch.remaining_units, 2);
    assert_eq!(batch.input_artifact.as_deref(), Some("input.csv"));

    let products = store.list_products(batch_uuid).await.unwrap();
    assert_eq!(products.iter().map(|p| p.serial).collect::<Vec<_>>(), vec![1, 2]);
    let units = store.list_units(batch_uuid).await.unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].source_url, "http://example.com/a.png");

    assert!(store.start_dispatch(batch_uuid, Utc::now()).await.unwrap());
    assert!(!store.start_dispatch(batch_uuid, Utc::now()).await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires PostgreSQL"]
async fn test_unit_transition_is_compare_and_set(pool: PgPool) {
    let store = PostgresBatchStore::new(pool);
    let batch_uuid = seeded_batch(&store).await;
    let unit = store.list_units(batch_uuid).await.unwrap().remove(0);

    let start = UnitTransition::new(unit.image_unit_uuid, UnitState::Pending, UnitState::Processing);
    assert!(store.transition_unit(&start).await.unwrap());
    assert!(!store.transition_unit(&start).await.unwrap());

    let complete =
        UnitTransition::new(unit.image_unit_uuid, UnitState::Processing, UnitState::Completed)
            .with_output_url("file:///out/a.png");
    assert!(store.transition_unit(&complete).await.unwrap());

    let stored = store.find_unit(unit.image_unit_uuid).await.unwrap().unwrap();
    assert_eq!(stored.status, UnitState::Completed);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.output_url.as_deref(), Some("file:///out/a.png"));

    let counts = store.count_units(batch_uuid).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.pending, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires PostgreSQL"]
async fn test_report_and_decrement_is_idempotent(pool: PgPool) {
    let store = PostgresBatchStore::new(pool);
    let batch_uuid = seeded_batch(&store).await;
    let units = store.list_units(batch_uuid).await.unwrap();

    let first = UnitReport::completed(batch_uuid, units[0].image_unit_uuid);
    assert_eq!(
        store.record_report(&first).await.unwrap(),
        ReportOutcome::Pending { remaining: 1 }
    );
    assert_eq!(
        store.record_report(&first).await.unwrap(),
        ReportOutcome::Duplicate
    );

    let second = UnitReport::failed(batch_uuid, units[1].image_unit_uuid, "HTTP 404");
    assert_eq!(
        store.record_report(&second).await.unwrap(),
        ReportOutcome::Released
    );
    assert_eq!(store.list_reports(batch_uuid).await.unwrap().len(), 2);

    let completion = BatchCompletion {
        batch_uuid,
        status: BatchState::Failed,
        output_artifact: Some(format!("{batch_uuid}/{batch_uuid}.csv")),
    };
    assert!(store.commit_finalization(&completion).await.unwrap());
    assert!(!store.commit_finalization(&completion).await.unwrap());

    let batch = store.find_batch(batch_uuid).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchState::Failed);
    assert!(batch.finalized_at.is_some());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires PostgreSQL"]
async fn test_stalled_batches_exclude_finalized(pool: PgPool) {
    let store = PostgresBatchStore::new(pool);
    let pending = seeded_batch(&store).await;

    let future = Utc::now() + chrono::Duration::seconds(60);
    let stalled = store.find_stalled_batches(future, 10).await.unwrap();
    assert_eq!(stalled.iter().map(|b| b.batch_uuid).collect::<Vec<_>>(), vec![pending]);

    let past = Utc::now() - chrono::Duration::seconds(60);
    assert!(store.find_stalled_batches(past, 10).await.unwrap().is_empty());

    store
        .commit_finalization(&BatchCompletion {
            batch_uuid: pending,
            status: BatchState::Completed,
            output_artifact: None,
        })
        .await
        .unwrap();
    assert!(store.find_stalled_batches(future, 10).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires PostgreSQL"]
async fn test_queue_visibility_and_archive(pool: PgPool) {
    let queue = PostgresTaskQueue::new(pool, LaneQueueNames::default()).await;
    queue.ensure_queues().await.unwrap();
    // Creating again is a no-op
    queue.ensure_queues().await.unwrap();
    let handle = queue.submit(Lane::Image, json!({ "n": 1 })).await.unwrap();
    queue.submit(Lane::Fast, json!({ "n": 2 })).await.unwrap();

    let read = queue
        .read(Lane::Image, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].handle, handle);
    assert_eq!(read[0].read_count, 1);

    // Invisible while in flight
    assert!(queue
        .read(Lane::Image, Duration::from_secs(30), 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(queue.depth(Lane::Image).await.unwrap(), 1);

    // A lapsed visibility timeout redelivers with a higher read count
    let second = queue.submit(Lane::Image, json!({ "n": 3 })).await.unwrap();
    let first_read = queue.read(Lane::Image, Duration::ZERO, 10).await.unwrap();
    assert_eq!(first_read.len(), 1);
    assert_eq!(first_read[0].handle, second);
    let redelivered = queue.read(Lane::Image, Duration::from_secs(30), 10).await.unwrap();
    assert_eq!(redelivered[0].handle, second);
    assert_eq!(redelivered[0].read_count, 2);
    queue.ack(&second).await.unwrap();
    assert!(queue.ack(&second).await.is_err());

    queue.archive(&handle, "poison").await.unwrap();
    assert_eq!(queue.depth(Lane::Image).await.unwrap(), 0);
    assert_eq!(queue.depth(Lane::Fast).await.unwrap(), 1);
}
