//! End-to-end saga scenarios against the `standalone` profile's SQLite
//! stores: the boundary cases the orchestrator, outbox and inbox must agree
//! on together, not just in isolation.

#![cfg(all(feature = "sqlite", feature = "channel"))]

use sqlx::SqlitePool;
use uuid::Uuid;

use saga_fabric::envelope::{Command, CommandType, Event, EventType};
use saga_fabric::inbox::sqlite::SqliteInboxStore;
use saga_fabric::inbox::{InboxMessage, InboxStore};
use saga_fabric::outbox::sqlite::SqliteOutboxStore;
use saga_fabric::outbox::{OutboxStatus, OutboxStore};
use saga_fabric::participant::{drive_participant, DriveOutcome, HandlerError, ParticipantHandler};
use saga_fabric::saga::payload::SagaOrderItem;
use saga_fabric::saga::repository::sqlite::SqliteSagaRepository;
use saga_fabric::saga::repository::SagaRepository;
use saga_fabric::saga::{new_create_order_saga, SagaOrchestrator, SagaStatus, StepStatus};

async fn fresh_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    SqliteOutboxStore::init_schema(&pool).await.unwrap();
    SqliteInboxStore::init_schema(&pool).await.unwrap();
    SqliteSagaRepository::init_schema(&pool).await.unwrap();
    pool
}

fn orchestrator() -> SagaOrchestrator<SqliteSagaRepository, SqliteOutboxStore> {
    SagaOrchestrator::new(SqliteSagaRepository::new(), SqliteOutboxStore::new())
}

async fn latest_command_for(pool: &SqlitePool, topic: &str) -> Command {
    let outbox = SqliteOutboxStore::new();
    let mut conn = pool.acquire().await.unwrap();
    let rows = outbox.get_not_sent(&mut conn, 10).await.unwrap();
    let row = rows
        .iter()
        .rev()
        .find(|r| r.topic == topic)
        .unwrap_or_else(|| panic!("no outbox row published to {topic}"));
    serde_json::from_slice(&row.payload).unwrap()
}

/// Walks the saga forward through `ReserveInventory`, the step under test
/// lives past this point.
async fn start_and_advance_to_reserve_inventory(pool: &SqlitePool) -> Uuid {
    let repo = SqliteSagaRepository::new();
    let orch = orchestrator();

    let saga = new_create_order_saga(
        "user-1",
        "payment-method-1",
        vec![SagaOrderItem { product_id: "p1".to_string(), name: String::new(), quantity: 2, price: 0 }],
    );
    let saga_id = saga.id;

    let mut tx = pool.begin().await.unwrap();
    orch.start(&mut *tx, saga).await.unwrap();
    tx.commit().await.unwrap();

    let order_id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(
        &mut *tx,
        &Event::new(EventType::OrderCreated, Some(saga_id), serde_json::json!({"order_id": order_id})),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(
        &mut *tx,
        &Event::new(
            EventType::ProductsValidated,
            Some(saga_id),
            serde_json::json!({"order_items": [{"product_id": "p1", "name": "Widget", "price": 500}]}),
        ),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert_eq!(found.current_step, 2);
    assert_eq!(found.status, SagaStatus::Running);

    saga_id
}

#[tokio::test]
async fn happy_path_walks_all_five_steps_to_completed() {
    let pool = fresh_pool().await;
    let orch = orchestrator();
    let repo = SqliteSagaRepository::new();

    let saga_id = start_and_advance_to_reserve_inventory(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::InventoryReserved, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let payment_id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(
        &mut *tx,
        &Event::new(
            EventType::PaymentCompleted,
            Some(saga_id),
            serde_json::json!({"payment_id": payment_id, "payment_sum": 1000, "payment_external_id": "ext-1"}),
        ),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::OrderCompleted, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert_eq!(found.status, SagaStatus::Completed);
    assert!(found.satisfies_completion_invariant());
    let p = found.payload.as_create_order().unwrap();
    assert_eq!(p.payment_sum, 1000);
    assert_eq!(p.payment_external_id.as_deref(), Some("ext-1"));
}

#[tokio::test]
async fn inventory_shortfall_walks_compensation_back_to_compensated() {
    let pool = fresh_pool().await;
    let orch = orchestrator();
    let repo = SqliteSagaRepository::new();

    let saga_id = start_and_advance_to_reserve_inventory(&pool).await;

    // Inventory service reports failure: orchestrator must start
    // compensating from the previous step (ValidateProducts has no
    // compensation, so the walk lands on CancelOrder).
    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::InventoryReserveFailed, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert!(found.compensating);
    assert_eq!(found.status, SagaStatus::Compensating);
    assert_eq!(found.current_step, 0, "ValidateProducts has no compensation and is skipped");

    let cancel = latest_command_for(&pool, "order-commands").await;
    assert_eq!(cancel.command_type, CommandType::CancelOrder);

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::OrderCancelled, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert_eq!(found.status, SagaStatus::Compensated);
    assert!(found.satisfies_compensated_invariant());
}

#[tokio::test]
async fn payment_decline_compensates_inventory_then_order() {
    let pool = fresh_pool().await;
    let orch = orchestrator();
    let repo = SqliteSagaRepository::new();

    let saga_id = start_and_advance_to_reserve_inventory(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::InventoryReserved, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::PaymentFailed, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let release = latest_command_for(&pool, "inventory-commands").await;
    assert_eq!(release.command_type, CommandType::ReleaseInventory);

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::InventoryReleased, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let cancel = latest_command_for(&pool, "order-commands").await;
    assert_eq!(cancel.command_type, CommandType::CancelOrder);

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::OrderCancelled, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert_eq!(found.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn unknown_event_type_is_rejected_without_corrupting_saga_state() {
    let pool = fresh_pool().await;
    let orch = orchestrator();
    let repo = SqliteSagaRepository::new();

    let saga_id = start_and_advance_to_reserve_inventory(&pool).await;
    let before = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();

    let mut tx = pool.begin().await.unwrap();
    let result = orch
        .handle_event(&mut *tx, &Event::new(EventType::Unknown("SomeFutureEvent".to_string()), Some(saga_id), serde_json::json!({})))
        .await;
    assert!(result.is_err());
    drop(tx); // rolled back, nothing committed

    let after = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert_eq!(before.current_step, after.current_step);
    assert_eq!(before.status, after.status);
}

/// A trivial handler used only to exercise `drive_participant`'s dedup
/// template, not real business logic.
struct EchoHandler;

#[async_trait::async_trait]
impl ParticipantHandler for EchoHandler {
    type Conn = sqlx::SqliteConnection;
    type Incoming = Command;

    async fn handle(
        &self,
        _conn: &mut Self::Conn,
        incoming: &Command,
    ) -> Result<Option<saga_fabric::outbox::OutboxMessage>, HandlerError> {
        let event = Event::new(EventType::OrderCreated, incoming.saga_id, serde_json::json!({}));
        let bytes = serde_json::to_vec(&event).unwrap();
        Ok(Some(saga_fabric::outbox::OutboxMessage::new("order-events", "k", bytes)))
    }
}

#[tokio::test]
async fn duplicate_command_redelivery_is_skipped_after_completion() {
    let pool = fresh_pool().await;
    let outbox = SqliteOutboxStore::new();
    let inbox = SqliteInboxStore::new();
    let handler = EchoHandler;

    let command = Command::new(CommandType::CreateOrder, Some(Uuid::new_v4()), serde_json::json!({}));
    let raw = serde_json::to_vec(&command).unwrap();

    let first = drive_participant(&pool, &outbox, &inbox, &handler, "order-commands", "k", &raw).await.unwrap();
    assert_eq!(first, DriveOutcome::Processed);

    // Redelivery of the identical command (same command_id): must be
    // recognized as already completed and skipped, not reprocessed.
    let second = drive_participant(&pool, &outbox, &inbox, &handler, "order-commands", "k", &raw).await.unwrap();
    assert_eq!(second, DriveOutcome::DuplicateSkipped);

    let mut conn = pool.acquire().await.unwrap();
    let rows = outbox.get_not_sent(&mut conn, 10).await.unwrap();
    assert_eq!(rows.len(), 1, "the duplicate must not publish a second reply");
}

#[tokio::test]
async fn crash_between_store_and_completed_is_retried_not_skipped() {
    // A message stored in the inbox (T1 committed) but never marked
    // completed (T2 never ran, e.g. the process crashed) must be retried on
    // redelivery, not skipped.
    let pool = fresh_pool().await;
    let outbox = SqliteOutboxStore::new();
    let inbox = SqliteInboxStore::new();
    let handler = EchoHandler;

    let command = Command::new(CommandType::CreateOrder, Some(Uuid::new_v4()), serde_json::json!({}));
    let raw = serde_json::to_vec(&command).unwrap();
    let message_id = command.command_id;

    {
        let mut conn = pool.acquire().await.unwrap();
        inbox
            .store(&mut conn, InboxMessage::new(message_id, "Command", "order-commands", "k", raw.clone()))
            .await
            .unwrap();
        // No mark_as_completed: simulated crash after T1, before T2.
    }

    let outcome = drive_participant(&pool, &outbox, &inbox, &handler, "order-commands", "k", &raw).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Processed, "a stored-but-incomplete message must still run T2");

    let mut conn = pool.acquire().await.unwrap();
    let rows = outbox.get_not_sent(&mut conn, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn relay_crash_recovery_resets_stale_pending_rows_for_reclaim() {
    use saga_fabric::relay::{RelayConfig, RelayWorker};

    let pool = fresh_pool().await;
    let outbox = SqliteOutboxStore::new();
    let broker = saga_fabric::broker::channel::ChannelBroker::new();

    let msg = saga_fabric::outbox::OutboxMessage::new("order-events", "k", b"{}".to_vec());
    let id = msg.id;
    {
        let mut conn = pool.acquire().await.unwrap();
        outbox.publish(&mut conn, msg).await.unwrap();
        outbox.batch_mark_as_pending(&mut conn, &[id]).await.unwrap();
    }

    // Backdate the claim window so recover_stale treats this row as
    // abandoned by a crashed relay.
    let relay = RelayWorker::new(pool.clone(), outbox.clone(), broker)
        .with_config(RelayConfig { stale_pending_after: chrono::Duration::seconds(-1), ..RelayConfig::default() });
    let recovered = relay.recover_stale().await.unwrap();
    assert_eq!(recovered, 1);

    let mut conn = pool.acquire().await.unwrap();
    let not_sent = outbox.get_not_sent(&mut conn, 10).await.unwrap();
    assert_eq!(not_sent.len(), 1);
    assert_eq!(not_sent[0].status, OutboxStatus::Init);
}

#[tokio::test]
async fn compensation_failure_parks_the_saga_after_max_retries() {
    use saga_fabric::saga::CompensationRetryPolicy;

    let pool = fresh_pool().await;
    let repo_for_orch = SqliteSagaRepository::new();
    let orch = SagaOrchestrator::new(repo_for_orch, SqliteOutboxStore::new())
        .with_compensation_retry(CompensationRetryPolicy { max_attempts: 2, ..CompensationRetryPolicy::default() });
    let repo = SqliteSagaRepository::new();

    let saga_id = start_and_advance_to_reserve_inventory(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    orch.handle_event(&mut *tx, &Event::new(EventType::InventoryReserveFailed, Some(saga_id), serde_json::json!({})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    for _ in 0..3 {
        let mut tx = pool.begin().await.unwrap();
        orch.handle_event(&mut *tx, &Event::new(EventType::OrderCancelFailed, Some(saga_id), serde_json::json!({})))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    let found = repo.find(&mut *pool.acquire().await.unwrap(), saga_id).await.unwrap().unwrap();
    assert!(found.parked_reason.is_some());
    assert_eq!(found.steps[0].compensate_status, StepStatus::Running, "never silently marked completed");
}
