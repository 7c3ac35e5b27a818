//! Per-saga-kind payload, merged from reply events and projected into
//! forward/compensation command payloads.
//!
//! Payload bytes travel opaquely through the orchestrator everywhere except
//! here: `merge_event`/`map_forward`/`map_compensate` are the only places
//! that peek at a command or event's `payload` field, and only for the
//! types they know about — a closed set of tagged variants per saga kind,
//! not open reflection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{CommandType, Event, EventType};

/// One order line, carried end to end through the create-order saga.
///
/// `quantity` is authoritative from the saga's own payload; `name`/`price`
/// are filled in once `ValidateProducts` replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaOrderItem {
    pub product_id: String,
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub price: i64,
}

/// Accumulated payload for the create-order saga.
///
/// `payment_external_id` is carried alongside `payment_id` as the gateway's
/// own reference, since a real refund call needs it to address the original
/// charge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateOrderSagaPayload {
    pub user_id: String,
    pub order_id: Option<Uuid>,
    pub order_items: Vec<SagaOrderItem>,
    pub payment_method_id: String,
    pub payment_id: Option<Uuid>,
    pub payment_sum: i64,
    pub payment_external_id: Option<String>,
}

/// Closed set of payload shapes, one per saga kind this crate drives.
///
/// Adding a new saga kind means adding a variant here plus arms in
/// `merge_event`/`map_forward`/`map_compensate` — never a reflective
/// lookup over the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum SagaPayload {
    CreateOrder(CreateOrderSagaPayload),
}

impl SagaPayload {
    pub fn as_create_order(&self) -> Option<&CreateOrderSagaPayload> {
        match self {
            SagaPayload::CreateOrder(p) => Some(p),
        }
    }
}

/// Merge an incoming reply event into the saga payload.
///
/// Merge is field-overwrite, so it is idempotent by construction: applying
/// the same event twice leaves the payload unchanged
/// (`merge(merge(p, e), e) == merge(p, e)`).
pub fn merge_event(payload: &mut SagaPayload, event: &Event) {
    let SagaPayload::CreateOrder(p) = payload;
    match event.event_type {
        EventType::OrderCreated => {
            if let Some(order_id) = event
                .payload
                .get("order_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                p.order_id = Some(order_id);
            }
        }
        EventType::ProductsValidated => {
            if let Some(items) = event.payload.get("order_items").and_then(|v| v.as_array()) {
                for item in items {
                    let Some(product_id) = item.get("product_id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if let Some(existing) = p.order_items.iter_mut().find(|i| i.product_id == product_id) {
                        if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
                            existing.name = name.to_string();
                        }
                        if let Some(price) = item.get("price").and_then(|v| v.as_i64()) {
                            existing.price = price;
                        }
                    }
                }
            }
        }
        EventType::PaymentCompleted => {
            if let Some(payment_id) = event
                .payload
                .get("payment_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                p.payment_id = Some(payment_id);
            }
            if let Some(sum) = event.payload.get("payment_sum").and_then(|v| v.as_i64()) {
                p.payment_sum = sum;
            }
            if let Some(ext_id) = event.payload.get("payment_external_id").and_then(|v| v.as_str()) {
                p.payment_external_id = Some(ext_id.to_string());
            }
        }
        // Every other reply event type changes orchestration state
        // (current_step, status) but not the payload.
        _ => {}
    }
}

/// Project the accumulated saga payload onto a forward command's schema.
pub fn map_forward(command: &CommandType, payload: &SagaPayload) -> serde_json::Value {
    let SagaPayload::CreateOrder(p) = payload;
    match command {
        CommandType::CreateOrder => serde_json::json!({
            "user_id": p.user_id,
            "payment_method_id": p.payment_method_id,
            "order_items": p.order_items,
        }),
        CommandType::ValidateProducts => serde_json::json!({ "order_items": p.order_items }),
        CommandType::ReserveInventory => serde_json::json!({ "order_items": p.order_items }),
        CommandType::ProcessPayment => serde_json::json!({
            "order_id": p.order_id,
            "user_id": p.user_id,
            "payment_sum": p.payment_sum,
            "payment_method_id": p.payment_method_id,
        }),
        CommandType::CompleteOrder => serde_json::json!({ "order_id": p.order_id }),
        other => serde_json::json!({ "unmapped_command": format!("{other:?}") }),
    }
}

/// Project the accumulated saga payload onto a compensation command's
/// schema.
pub fn map_compensate(command: &CommandType, payload: &SagaPayload) -> serde_json::Value {
    let SagaPayload::CreateOrder(p) = payload;
    match command {
        CommandType::CancelOrder => serde_json::json!({ "order_id": p.order_id }),
        CommandType::ReleaseInventory => serde_json::json!({ "order_items": p.order_items }),
        CommandType::RefundPayment => serde_json::json!({ "payment_id": p.payment_id }),
        other => serde_json::json!({ "unmapped_command": format!("{other:?}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> SagaPayload {
        SagaPayload::CreateOrder(CreateOrderSagaPayload {
            user_id: "u1".to_string(),
            order_items: vec![SagaOrderItem {
                product_id: "p1".to_string(),
                name: String::new(),
                quantity: 2,
                price: 0,
            }],
            payment_method_id: "m1".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn order_created_sets_order_id() {
        let mut payload = base_payload();
        let order_id = Uuid::new_v4();
        let event = Event::new(EventType::OrderCreated, None, serde_json::json!({"order_id": order_id}));
        merge_event(&mut payload, &event);
        assert_eq!(payload.as_create_order().unwrap().order_id, Some(order_id));
    }

    #[test]
    fn products_validated_enriches_matching_item_keeping_saga_quantity() {
        let mut payload = base_payload();
        let event = Event::new(
            EventType::ProductsValidated,
            None,
            serde_json::json!({"order_items": [{"product_id": "p1", "name": "Widget", "price": 500}]}),
        );
        merge_event(&mut payload, &event);
        let item = &payload.as_create_order().unwrap().order_items[0];
        assert_eq!(item.name, "Widget");
        assert_eq!(item.price, 500);
        assert_eq!(item.quantity, 2, "quantity stays saga-authoritative");
    }

    #[test]
    fn payment_completed_sets_payment_fields() {
        let mut payload = base_payload();
        let payment_id = Uuid::new_v4();
        let event = Event::new(
            EventType::PaymentCompleted,
            None,
            serde_json::json!({"payment_id": payment_id, "payment_sum": 1000, "payment_external_id": "ext-1"}),
        );
        merge_event(&mut payload, &event);
        let p = payload.as_create_order().unwrap();
        assert_eq!(p.payment_id, Some(payment_id));
        assert_eq!(p.payment_sum, 1000);
        assert_eq!(p.payment_external_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn merge_is_idempotent_under_redelivery() {
        let mut once = base_payload();
        let event = Event::new(
            EventType::PaymentCompleted,
            None,
            serde_json::json!({"payment_id": Uuid::new_v4(), "payment_sum": 750}),
        );
        merge_event(&mut once, &event);
        let mut twice = once.clone();
        merge_event(&mut twice, &event);
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn unrelated_event_type_is_identity() {
        let payload = base_payload();
        let mut mutated = payload.clone();
        let event = Event::new(EventType::InventoryReserved, None, serde_json::json!({"whatever": 1}));
        merge_event(&mut mutated, &event);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::to_value(&mutated).unwrap()
        );
    }
}
