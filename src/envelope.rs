//! Command/event envelope types shared by every participant.
//!
//! The wire format is fixed JSON per service boundary doc: commands carry
//! `command_id`/`command_type`/`saga_id`/`payload`, events carry
//! `event_id`/`event_type`/`saga_id`/`payload`. Both envelopes are immutable
//! once produced — nothing in this crate mutates a `Command` or `Event` in
//! place after construction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of forward/compensation commands exchanged between participants.
///
/// Closed set per saga kind. Unrecognized wire values deserialize to
/// `Unknown` rather than failing, so
/// a participant never rejects a command only because a newer service added
/// a type it doesn't know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum CommandType {
    CreateOrder,
    CancelOrder,
    ValidateProducts,
    ReserveInventory,
    ReleaseInventory,
    ProcessPayment,
    RefundPayment,
    CompleteOrder,
    CreateProduct,
    CreatePaymentMethod,
    CreateInventory,
    SagaCreateOrder,
    Unknown(String),
}

impl From<CommandType> for String {
    fn from(t: CommandType) -> Self {
        match t {
            CommandType::CreateOrder => "CreateOrder".to_string(),
            CommandType::CancelOrder => "CancelOrder".to_string(),
            CommandType::ValidateProducts => "ValidateProducts".to_string(),
            CommandType::ReserveInventory => "ReserveInventory".to_string(),
            CommandType::ReleaseInventory => "ReleaseInventory".to_string(),
            CommandType::ProcessPayment => "ProcessPayment".to_string(),
            CommandType::RefundPayment => "RefundPayment".to_string(),
            CommandType::CompleteOrder => "CompleteOrder".to_string(),
            CommandType::CreateProduct => "CreateProduct".to_string(),
            CommandType::CreatePaymentMethod => "CreatePaymentMethod".to_string(),
            CommandType::CreateInventory => "CreateInventory".to_string(),
            CommandType::SagaCreateOrder => "SagaCreateOrder".to_string(),
            CommandType::Unknown(s) => s,
        }
    }
}

impl From<String> for CommandType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CreateOrder" => CommandType::CreateOrder,
            "CancelOrder" => CommandType::CancelOrder,
            "ValidateProducts" => CommandType::ValidateProducts,
            "ReserveInventory" => CommandType::ReserveInventory,
            "ReleaseInventory" => CommandType::ReleaseInventory,
            "ProcessPayment" => CommandType::ProcessPayment,
            "RefundPayment" => CommandType::RefundPayment,
            "CompleteOrder" => CommandType::CompleteOrder,
            "CreateProduct" => CommandType::CreateProduct,
            "CreatePaymentMethod" => CommandType::CreatePaymentMethod,
            "CreateInventory" => CommandType::CreateInventory,
            "SagaCreateOrder" => CommandType::SagaCreateOrder,
            other => CommandType::Unknown(other.to_string()),
        }
    }
}

/// Types of events participants emit in reply to commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    OrderCreated,
    OrderCreateFailed,
    OrderCancelled,
    OrderCancelFailed,
    ProductsValidated,
    ProductsValidationFailed,
    InventoryReserved,
    InventoryReserveFailed,
    InventoryReleased,
    InventoryReleaseFailed,
    PaymentCompleted,
    PaymentFailed,
    PaymentRefunded,
    PaymentRefundFailed,
    OrderCompleted,
    OrderCompleteFailed,
    ProductCreated,
    PaymentMethodCreated,
    InventoryCreated,
    Unknown(String),
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::OrderCreated => "OrderCreated".to_string(),
            EventType::OrderCreateFailed => "OrderCreateFailed".to_string(),
            EventType::OrderCancelled => "OrderCancelled".to_string(),
            EventType::OrderCancelFailed => "OrderCancelFailed".to_string(),
            EventType::ProductsValidated => "ProductsValidated".to_string(),
            EventType::ProductsValidationFailed => "ProductsValidationFailed".to_string(),
            EventType::InventoryReserved => "InventoryReserved".to_string(),
            EventType::InventoryReserveFailed => "InventoryReserveFailed".to_string(),
            EventType::InventoryReleased => "InventoryReleased".to_string(),
            EventType::InventoryReleaseFailed => "InventoryReleaseFailed".to_string(),
            EventType::PaymentCompleted => "PaymentCompleted".to_string(),
            EventType::PaymentFailed => "PaymentFailed".to_string(),
            EventType::PaymentRefunded => "PaymentRefunded".to_string(),
            EventType::PaymentRefundFailed => "PaymentRefundFailed".to_string(),
            EventType::OrderCompleted => "OrderCompleted".to_string(),
            EventType::OrderCompleteFailed => "OrderCompleteFailed".to_string(),
            EventType::ProductCreated => "ProductCreated".to_string(),
            EventType::PaymentMethodCreated => "PaymentMethodCreated".to_string(),
            EventType::InventoryCreated => "InventoryCreated".to_string(),
            EventType::Unknown(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "OrderCreated" => EventType::OrderCreated,
            "OrderCreateFailed" => EventType::OrderCreateFailed,
            "OrderCancelled" => EventType::OrderCancelled,
            "OrderCancelFailed" => EventType::OrderCancelFailed,
            "ProductsValidated" => EventType::ProductsValidated,
            "ProductsValidationFailed" => EventType::ProductsValidationFailed,
            "InventoryReserved" => EventType::InventoryReserved,
            "InventoryReserveFailed" => EventType::InventoryReserveFailed,
            "InventoryReleased" => EventType::InventoryReleased,
            "InventoryReleaseFailed" => EventType::InventoryReleaseFailed,
            "PaymentCompleted" => EventType::PaymentCompleted,
            "PaymentFailed" => EventType::PaymentFailed,
            "PaymentRefunded" => EventType::PaymentRefunded,
            "PaymentRefundFailed" => EventType::PaymentRefundFailed,
            "OrderCompleted" => EventType::OrderCompleted,
            "OrderCompleteFailed" => EventType::OrderCompleteFailed,
            "ProductCreated" => EventType::ProductCreated,
            "PaymentMethodCreated" => EventType::PaymentMethodCreated,
            "InventoryCreated" => EventType::InventoryCreated,
            other => EventType::Unknown(other.to_string()),
        }
    }
}

fn serialize_saga_id<S: serde::Serializer>(
    id: &Option<Uuid>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => ser.serialize_str(&id.to_string()),
        None => ser.serialize_str(""),
    }
}

fn deserialize_saga_id<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Option<Uuid>, D::Error> {
    let raw = String::deserialize(de)?;
    if raw.is_empty() {
        Ok(None)
    } else {
        Uuid::parse_str(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

/// A command sent to a participant, optionally scoped to a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub command_type: CommandType,
    #[serde(
        serialize_with = "serialize_saga_id",
        deserialize_with = "deserialize_saga_id",
        default
    )]
    pub saga_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(command_type: CommandType, saga_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type,
            saga_id,
            payload,
        }
    }
}

/// An event emitted by a participant in reply to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(
        serialize_with = "serialize_saga_id",
        deserialize_with = "deserialize_saga_id",
        default
    )]
    pub saga_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, saga_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            saga_id,
            payload,
        }
    }
}

/// The producer-assigned id used as the inbox dedup key: a command's
/// `command_id` or an event's `event_id`.
pub trait MessageId {
    fn message_id(&self) -> Uuid;
}

impl MessageId for Command {
    fn message_id(&self) -> Uuid {
        self.command_id
    }
}

impl MessageId for Event {
    fn message_id(&self) -> Uuid {
        self.event_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_json() {
        let cmd = Command::new(
            CommandType::CreateOrder,
            Some(Uuid::new_v4()),
            serde_json::json!({"user_id": "u1"}),
        );
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd.command_id, back.command_id);
        assert_eq!(cmd.command_type, back.command_type);
        assert_eq!(cmd.saga_id, back.saga_id);
        assert_eq!(cmd.payload, back.payload);
    }

    #[test]
    fn empty_saga_id_round_trips_as_empty_string() {
        let cmd = Command::new(CommandType::CreateProduct, None, serde_json::json!({}));
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["saga_id"], serde_json::Value::String(String::new()));
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back.saga_id, None);
    }

    #[test]
    fn unknown_command_type_does_not_fail_deserialization() {
        let raw = serde_json::json!({
            "command_id": Uuid::new_v4().to_string(),
            "command_type": "SomeFutureCommand",
            "saga_id": "",
            "payload": {}
        });
        let cmd: Command = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.command_type, CommandType::Unknown("SomeFutureCommand".to_string()));
    }

    #[test]
    fn event_round_trips_through_json() {
        let evt = Event::new(
            EventType::OrderCreated,
            Some(Uuid::new_v4()),
            serde_json::json!({"order_id": "o1"}),
        );
        let json = serde_json::to_string(&evt).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(evt.event_id, back.event_id);
        assert_eq!(evt.event_type, back.event_type);
        assert_eq!(evt.saga_id, back.saga_id);
    }
}
