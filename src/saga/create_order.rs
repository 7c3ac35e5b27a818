//! The create-order saga definition: five steps, in order, each a
//! forward/compensation command pair with its matching event types.

use chrono::Utc;
use uuid::Uuid;

use crate::envelope::{CommandType, EventType};

use super::payload::{CreateOrderSagaPayload, SagaOrderItem, SagaPayload};
use super::{Saga, SagaStatus, Step, StepStatus};

/// Build a fresh create-order saga in `status=init`, `current_step=0`,
/// ready to be handed to `SagaOrchestrator::start`.
pub fn new_create_order_saga(
    user_id: impl Into<String>,
    payment_method_id: impl Into<String>,
    items: Vec<SagaOrderItem>,
) -> Saga {
    let steps = vec![
        Step {
            command: CommandType::CreateOrder,
            command_status: StepStatus::Init,
            command_success_event: EventType::OrderCreated,
            command_fail_event: EventType::OrderCreateFailed,
            compensate: Some(CommandType::CancelOrder),
            compensate_status: StepStatus::Init,
            compensate_success_event: Some(EventType::OrderCancelled),
            compensate_fail_event: Some(EventType::OrderCancelFailed),
            command_topic: "order-commands".to_string(),
        },
        Step {
            command: CommandType::ValidateProducts,
            command_status: StepStatus::Init,
            command_success_event: EventType::ProductsValidated,
            command_fail_event: EventType::ProductsValidationFailed,
            compensate: None,
            compensate_status: StepStatus::Init,
            compensate_success_event: None,
            compensate_fail_event: None,
            command_topic: "order-commands".to_string(),
        },
        Step {
            command: CommandType::ReserveInventory,
            command_status: StepStatus::Init,
            command_success_event: EventType::InventoryReserved,
            command_fail_event: EventType::InventoryReserveFailed,
            compensate: Some(CommandType::ReleaseInventory),
            compensate_status: StepStatus::Init,
            compensate_success_event: Some(EventType::InventoryReleased),
            compensate_fail_event: Some(EventType::InventoryReleaseFailed),
            command_topic: "inventory-commands".to_string(),
        },
        Step {
            command: CommandType::ProcessPayment,
            command_status: StepStatus::Init,
            command_success_event: EventType::PaymentCompleted,
            command_fail_event: EventType::PaymentFailed,
            compensate: Some(CommandType::RefundPayment),
            compensate_status: StepStatus::Init,
            compensate_success_event: Some(EventType::PaymentRefunded),
            compensate_fail_event: Some(EventType::PaymentRefundFailed),
            command_topic: "payment-commands".to_string(),
        },
        Step {
            command: CommandType::CompleteOrder,
            command_status: StepStatus::Init,
            command_success_event: EventType::OrderCompleted,
            command_fail_event: EventType::OrderCompleteFailed,
            compensate: None,
            compensate_status: StepStatus::Init,
            compensate_success_event: None,
            compensate_fail_event: None,
            command_topic: "order-commands".to_string(),
        },
    ];

    let now = Utc::now();
    Saga {
        id: Uuid::new_v4(),
        current_step: 0,
        status: SagaStatus::Init,
        steps,
        payload: SagaPayload::CreateOrder(CreateOrderSagaPayload {
            user_id: user_id.into(),
            order_id: None,
            order_items: items,
            payment_method_id: payment_method_id.into(),
            payment_id: None,
            payment_sum: 0,
            payment_external_id: None,
        }),
        compensating: false,
        compensation_attempts: 0,
        parked_reason: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_five_steps_in_spec_order() {
        let saga = new_create_order_saga("u1", "m1", vec![]);
        assert_eq!(saga.steps.len(), 5);
        assert_eq!(saga.steps[0].command, CommandType::CreateOrder);
        assert_eq!(saga.steps[1].command, CommandType::ValidateProducts);
        assert_eq!(saga.steps[2].command, CommandType::ReserveInventory);
        assert_eq!(saga.steps[3].command, CommandType::ProcessPayment);
        assert_eq!(saga.steps[4].command, CommandType::CompleteOrder);
        assert!(saga.steps[1].compensate.is_none());
        assert!(saga.steps[4].compensate.is_none());
        assert_eq!(saga.steps[2].compensate, Some(CommandType::ReleaseInventory));
    }

    #[test]
    fn starts_in_init_at_step_zero() {
        let saga = new_create_order_saga("u1", "m1", vec![]);
        assert_eq!(saga.status, SagaStatus::Init);
        assert_eq!(saga.current_step, 0);
        assert!(!saga.compensating);
    }
}
