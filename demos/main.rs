//! Standalone demo: runs the create-order saga end to end against the
//! `standalone` profile (SQLite stores, in-memory channel broker, no
//! external services) in a single process.
//!
//! Wires four toy participants (order, product, inventory, payment) plus
//! the relay worker and the saga orchestrator together the way a real
//! deployment would split them across services, just without the network
//! hop — useful as a smoke test and as a reading aid for how the pieces
//! above fit together.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use saga_fabric::broker::channel::ChannelBroker;
use saga_fabric::broker::{Broker, BrokerMessage};
use saga_fabric::envelope::{Command, CommandType, Event, EventType};
use saga_fabric::inbox::sqlite::SqliteInboxStore;
use saga_fabric::outbox::sqlite::SqliteOutboxStore;
use saga_fabric::outbox::OutboxMessage;
use saga_fabric::participant::{drive_participant, HandlerError, ParticipantHandler};
use saga_fabric::relay::RelayWorker;
use saga_fabric::saga::payload::SagaOrderItem;
use saga_fabric::saga::repository::sqlite::SqliteSagaRepository;
use saga_fabric::saga::repository::SagaRepository;
use saga_fabric::saga::{new_create_order_saga, SagaOrchestrator, SagaStatus};

/// Handles everything published to `order-commands`: order lifecycle
/// commands plus product validation, since both share that topic in the
/// create-order saga's step definitions.
struct OrderCommandsHandler;

#[async_trait]
impl ParticipantHandler for OrderCommandsHandler {
    type Conn = sqlx::SqliteConnection;
    type Incoming = Command;

    async fn handle(&self, _conn: &mut Self::Conn, incoming: &Command) -> Result<Option<OutboxMessage>, HandlerError> {
        let saga_id = incoming.saga_id;
        let (event_type, payload) = match &incoming.command_type {
            CommandType::CreateOrder => {
                let order_id = Uuid::new_v4();
                info!(%order_id, "order service: created order");
                (EventType::OrderCreated, serde_json::json!({ "order_id": order_id }))
            }
            CommandType::CancelOrder => {
                info!("order service: cancelled order (compensation)");
                (EventType::OrderCancelled, serde_json::json!({}))
            }
            CommandType::ValidateProducts => {
                let items: Vec<SagaOrderItem> = serde_json::from_value(
                    incoming.payload.get("order_items").cloned().unwrap_or(serde_json::json!([])),
                )
                .unwrap_or_default();
                let enriched: Vec<_> = items
                    .into_iter()
                    .map(|mut item| {
                        item.name = format!("Product {}", item.product_id);
                        item.price = 1000;
                        item
                    })
                    .collect();
                info!(count = enriched.len(), "product service: validated order items");
                (EventType::ProductsValidated, serde_json::json!({ "order_items": enriched }))
            }
            CommandType::CompleteOrder => {
                info!("order service: completed order");
                (EventType::OrderCompleted, serde_json::json!({}))
            }
            other => return Err(HandlerError::Business(format!("order-commands handler cannot process {other:?}"))),
        };

        let event = Event::new(event_type, saga_id, payload);
        let bytes = serde_json::to_vec(&event).map_err(|e| HandlerError::Database(e.to_string()))?;
        let key = saga_id.map(|s| s.to_string()).unwrap_or_default();
        Ok(Some(OutboxMessage::new("order-events", key, bytes)))
    }
}

struct InventoryCommandsHandler;

#[async_trait]
impl ParticipantHandler for InventoryCommandsHandler {
    type Conn = sqlx::SqliteConnection;
    type Incoming = Command;

    async fn handle(&self, _conn: &mut Self::Conn, incoming: &Command) -> Result<Option<OutboxMessage>, HandlerError> {
        let saga_id = incoming.saga_id;
        let (event_type, payload) = match &incoming.command_type {
            CommandType::ReserveInventory => {
                info!("inventory service: reserved inventory");
                (EventType::InventoryReserved, serde_json::json!({}))
            }
            CommandType::ReleaseInventory => {
                info!("inventory service: released inventory (compensation)");
                (EventType::InventoryReleased, serde_json::json!({}))
            }
            other => return Err(HandlerError::Business(format!("inventory-commands handler cannot process {other:?}"))),
        };

        let event = Event::new(event_type, saga_id, payload);
        let bytes = serde_json::to_vec(&event).map_err(|e| HandlerError::Database(e.to_string()))?;
        let key = saga_id.map(|s| s.to_string()).unwrap_or_default();
        Ok(Some(OutboxMessage::new("inventory-events", key, bytes)))
    }
}

struct PaymentCommandsHandler;

#[async_trait]
impl ParticipantHandler for PaymentCommandsHandler {
    type Conn = sqlx::SqliteConnection;
    type Incoming = Command;

    async fn handle(&self, _conn: &mut Self::Conn, incoming: &Command) -> Result<Option<OutboxMessage>, HandlerError> {
        let saga_id = incoming.saga_id;
        let (event_type, payload) = match &incoming.command_type {
            CommandType::ProcessPayment => {
                let payment_id = Uuid::new_v4();
                info!(%payment_id, "payment service: charged payment");
                (
                    EventType::PaymentCompleted,
                    serde_json::json!({ "payment_id": payment_id, "payment_sum": 2000, "payment_external_id": "demo-charge-1" }),
                )
            }
            CommandType::RefundPayment => {
                info!("payment service: refunded payment (compensation)");
                (EventType::PaymentRefunded, serde_json::json!({}))
            }
            other => return Err(HandlerError::Business(format!("payment-commands handler cannot process {other:?}"))),
        };

        let event = Event::new(event_type, saga_id, payload);
        let bytes = serde_json::to_vec(&event).map_err(|e| HandlerError::Database(e.to_string()))?;
        let key = saga_id.map(|s| s.to_string()).unwrap_or_default();
        Ok(Some(OutboxMessage::new("payment-events", key, bytes)))
    }
}

/// Subscribe `handler` to `topic` on `broker`, driving every delivered
/// message through `drive_participant` against `pool`/`outbox`/`inbox`.
async fn subscribe_participant<H>(
    broker: &ChannelBroker,
    topic: &'static str,
    pool: SqlitePool,
    outbox: SqliteOutboxStore,
    inbox: SqliteInboxStore,
    handler: H,
) -> saga_fabric::broker::Result<()>
where
    H: ParticipantHandler<Conn = sqlx::SqliteConnection, Incoming = Command> + Send + Sync + 'static,
{
    let handler = std::sync::Arc::new(handler);
    let closure = move |msg: BrokerMessage| {
        let pool = pool.clone();
        let handler = handler.clone();
        async move {
            match drive_participant(&pool, &outbox, &inbox, handler.as_ref(), topic, &msg.key, &msg.value).await {
                Ok(outcome) => {
                    info!(?outcome, topic, "participant processed message");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, topic, "participant failed to process message");
                    Err(saga_fabric::broker::BrokerError::Consume(e.to_string()))
                }
            }
        }
        .boxed()
    };
    broker.subscribe(topic, Box::new(closure)).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let pool = SqlitePool::connect("sqlite::memory:").await?;
    SqliteOutboxStore::init_schema(&pool).await?;
    SqliteInboxStore::init_schema(&pool).await?;
    SqliteSagaRepository::init_schema(&pool).await?;

    let outbox = SqliteOutboxStore::new();
    let inbox = SqliteInboxStore::new();
    let repo = SqliteSagaRepository::new();
    let broker = ChannelBroker::new();

    subscribe_participant(&broker, "order-commands", pool.clone(), outbox.clone(), inbox.clone(), OrderCommandsHandler).await?;
    subscribe_participant(&broker, "inventory-commands", pool.clone(), outbox.clone(), inbox.clone(), InventoryCommandsHandler).await?;
    subscribe_participant(&broker, "payment-commands", pool.clone(), outbox.clone(), inbox.clone(), PaymentCommandsHandler).await?;

    let orchestrator = std::sync::Arc::new(SagaOrchestrator::new(repo, outbox.clone()));
    for topic in ["order-events", "inventory-events", "payment-events"] {
        let pool = pool.clone();
        let orchestrator = orchestrator.clone();
        broker
            .subscribe(
                topic,
                Box::new(move |msg: BrokerMessage| {
                    let pool = pool.clone();
                    let orchestrator = orchestrator.clone();
                    async move {
                        let event: Event = serde_json::from_slice(&msg.value)
                            .map_err(|e| saga_fabric::broker::BrokerError::Consume(e.to_string()))?;
                        let mut tx = pool
                            .begin()
                            .await
                            .map_err(|e| saga_fabric::broker::BrokerError::Consume(e.to_string()))?;
                        orchestrator
                            .handle_event(&mut *tx, &event)
                            .await
                            .map_err(|e| saga_fabric::broker::BrokerError::Consume(e.to_string()))?;
                        // `tx` derefs to `&mut SqliteConnection`, satisfying `R::Conn`.
                        tx.commit().await.map_err(|e| saga_fabric::broker::BrokerError::Consume(e.to_string()))?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await?;
    }

    broker
        .start_consume(&[
            "order-commands".to_string(),
            "inventory-commands".to_string(),
            "payment-commands".to_string(),
            "order-events".to_string(),
            "inventory-events".to_string(),
            "payment-events".to_string(),
        ])
        .await?;

    let relay = RelayWorker::new(pool.clone(), outbox.clone(), broker.clone());
    tokio::spawn(async move { relay.run().await });

    let saga = new_create_order_saga(
        "user-1",
        "payment-method-1",
        vec![SagaOrderItem { product_id: "p1".to_string(), name: String::new(), quantity: 2, price: 0 }],
    );
    let saga_id = saga.id;

    let orchestrator_start = SagaOrchestrator::new(SqliteSagaRepository::new(), outbox.clone());
    {
        let mut tx = pool.begin().await?;
        orchestrator_start.start(&mut *tx, saga).await?;
        tx.commit().await?;
    }

    info!(%saga_id, "saga started, waiting for it to settle");

    let repo_poll = SqliteSagaRepository::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut conn = pool.acquire().await?;
        if let Some(found) = repo_poll.find(&mut *conn, saga_id).await? {
            if matches!(found.status, SagaStatus::Completed | SagaStatus::Compensated) {
                info!(status = found.status.as_str(), "saga settled");
                println!("final saga status: {}", found.status.as_str());
                return Ok(());
            }
        }
    }

    println!("saga did not settle within the demo's wait window");
    Ok(())
}
