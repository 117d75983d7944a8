//! End-to-end bus runs: post, dispatch through the pool, retire to history.
//!
//! Run with: `cargo test -p busq-worker --test bus_test`

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use busq_worker::{
    InMemoryQueueStorage, PersistentBus, PostMetadata, ProcessingState, QueueConfig, QueueStorage,
    SearchKeys, SystemClock,
};
use helpers::{bus_config, eventually, AccountCreated, FailingFirst, Gated, Panicking, Recording};

fn bus(config: QueueConfig, storage: &Arc<InMemoryQueueStorage>) -> PersistentBus {
    PersistentBus::new(config, storage.clone(), Arc::new(SystemClock)).unwrap()
}

async fn history(bus: &PersistentBus, storage: &InMemoryQueueStorage, state: ProcessingState) -> i64 {
    storage
        .history_count(Some(state), bus.queue().table())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_posted_events_are_dispatched_once() {
    busq_worker::telemetry::init_test_telemetry();
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(bus_config("node-a"), &storage);
    let handler = Recording::default();
    bus.register::<AccountCreated, _>(handler.clone());

    assert!(bus.start().await.is_ok());
    assert!(bus.is_started().await);

    for account_id in 0..10 {
        bus.post(&AccountCreated { account_id }, PostMetadata::new(1, 0))
            .await
            .unwrap();
    }

    assert!(eventually(|| async { handler.count() == 10 }).await);
    assert!(
        eventually(|| async { history(&bus, &storage, ProcessingState::Processed).await == 10 })
            .await
    );
    bus.stop().await;
    assert!(!bus.is_started().await);

    assert_eq!(handler.count(), 10);
    assert!(bus
        .get_available_or_in_processing_events(SearchKeys::key1(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        bus.get_historical_events(SearchKeys::key1(1))
            .await
            .unwrap()
            .len(),
        10
    );
}

#[tokio::test]
async fn test_backlog_written_before_start_is_dispatched() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(bus_config("node-a"), &storage);
    let handler = Recording::default();
    bus.register::<AccountCreated, _>(handler.clone());

    for account_id in 0..250 {
        bus.post(&AccountCreated { account_id }, PostMetadata::default())
            .await
            .unwrap();
    }
    assert_eq!(bus.nb_ready_entries().await.unwrap(), 250);

    bus.start().await.unwrap();
    assert!(eventually(|| async { handler.count() == 250 }).await);
    bus.stop().await;
    assert_eq!(bus.nb_ready_entries().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retryable_failures_within_budget_end_processed() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let config = bus_config("node-a");
    let max_failure_retries = config.max_failure_retries as usize;
    let bus = bus(config, &storage);
    let handler = FailingFirst::new(max_failure_retries);
    bus.register::<AccountCreated, _>(handler.clone());

    bus.start().await.unwrap();
    let id = bus
        .post(&AccountCreated { account_id: 1 }, PostMetadata::default())
        .await
        .unwrap();

    assert!(
        eventually(|| async { history(&bus, &storage, ProcessingState::Processed).await == 1 })
            .await
    );
    bus.stop().await;

    assert_eq!(handler.attempts(), max_failure_retries + 1);
    assert_eq!(history(&bus, &storage, ProcessingState::Failed).await, 0);
    let retired = storage.history_entry(id, bus.queue().table()).unwrap();
    assert_eq!(retired.error_count, max_failure_retries as i32);
    assert_eq!(bus.stats().total_retried, max_failure_retries as u64);
}

#[tokio::test]
async fn test_exhausted_retries_end_failed() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(
        QueueConfig {
            max_failure_retries: 1,
            ..bus_config("node-a")
        },
        &storage,
    );
    let handler = FailingFirst::new(usize::MAX);
    bus.register::<AccountCreated, _>(handler.clone());

    bus.start().await.unwrap();
    let id = bus
        .post(&AccountCreated { account_id: 1 }, PostMetadata::default())
        .await
        .unwrap();

    assert!(
        eventually(|| async { history(&bus, &storage, ProcessingState::Failed).await == 1 }).await
    );
    bus.stop().await;

    // Attempts at error counts 0 and 1 are retried, the one at 2 fails.
    assert_eq!(handler.attempts(), 3);
    let retired = storage.history_entry(id, bus.queue().table()).unwrap();
    assert_eq!(retired.error_count, 3);
    assert_eq!(history(&bus, &storage, ProcessingState::Processed).await, 0);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_bus() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(
        QueueConfig {
            max_failure_retries: 0,
            ..bus_config("node-a")
        },
        &storage,
    );
    bus.register::<AccountCreated, _>(Panicking);

    bus.start().await.unwrap();
    bus.post(&AccountCreated { account_id: 1 }, PostMetadata::default())
        .await
        .unwrap();

    assert!(
        eventually(|| async { history(&bus, &storage, ProcessingState::Failed).await == 1 }).await
    );
    assert!(bus.is_started().await);
    bus.stop().await;
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(bus_config("node-a"), &storage);

    bus.stop().await;
    bus.start().await.unwrap();
    bus.start().await.unwrap();
    assert!(bus.is_started().await);
    bus.stop().await;
    bus.stop().await;
    assert!(!bus.is_started().await);
    assert!(!bus.queue().is_open());
}

#[tokio::test]
async fn test_two_nodes_share_one_table() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let a = bus(bus_config("node-a"), &storage);
    let b = bus(bus_config("node-b"), &storage);
    let on_a = Recording::default();
    let on_b = Recording::default();
    a.register::<AccountCreated, _>(on_a.clone());
    b.register::<AccountCreated, _>(on_b.clone());

    a.start().await.unwrap();
    b.start().await.unwrap();
    for account_id in 0..40 {
        let node = if account_id % 2 == 0 { &a } else { &b };
        node.post(&AccountCreated { account_id }, PostMetadata::default())
            .await
            .unwrap();
    }

    assert!(eventually(|| async { on_a.count() + on_b.count() == 40 }).await);
    a.stop().await;
    b.stop().await;
    assert_eq!(on_a.count() + on_b.count(), 40);
    assert_eq!(history(&a, &storage, ProcessingState::Processed).await, 40);
}

#[tokio::test]
async fn test_storage_outage_does_not_stop_polling() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(
        QueueConfig {
            use_inflight_queue: false,
            ..bus_config("node-a")
        },
        &storage,
    );
    let handler = Recording::default();
    bus.register::<AccountCreated, _>(handler.clone());

    for account_id in 0..3 {
        bus.post(&AccountCreated { account_id }, PostMetadata::default())
            .await
            .unwrap();
    }

    storage.set_failing(true);
    bus.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.count(), 0);
    assert!(bus.is_started().await);

    storage.set_failing(false);
    assert!(eventually(|| async { handler.count() == 3 }).await);
    bus.stop().await;
    assert_eq!(history(&bus, &storage, ProcessingState::Processed).await, 3);
}

#[tokio::test]
async fn test_stop_terminates_handlers_after_shutdown_timeout() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let bus = bus(
        QueueConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..bus_config("node-a")
        },
        &storage,
    );
    let handler = Gated::closed();
    bus.register::<AccountCreated, _>(handler.clone());

    bus.start().await.unwrap();
    let id = bus
        .post(&AccountCreated { account_id: 1 }, PostMetadata::default())
        .await
        .unwrap();
    assert!(eventually(|| async { handler.started() == 1 }).await);

    bus.stop().await;
    assert!(!bus.is_started().await);

    // Opening the gate after stop must not let the aborted handler finish.
    handler.open();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.completed(), 0);

    let row = storage.entry(id, bus.queue().table()).unwrap();
    assert_eq!(row.processing_state, ProcessingState::InProcessing);
}
