//! Saga definition model: the typed, persisted state machine the
//! orchestrator drives.
//!
//! `Step` is static per saga kind but persisted inside each `Saga` instance
//! rather than looked up from a registry, so a definition change never
//! corrupts an in-flight saga.

pub mod create_order;
pub mod orchestrator;
pub mod payload;
pub mod repository;

pub use create_order::new_create_order_saga;
pub use orchestrator::{CompensationRetryPolicy, SagaOrchestrator};
pub use payload::{merge_event, map_compensate, map_forward, CreateOrderSagaPayload, SagaOrderItem, SagaPayload};
pub use repository::{SagaRepository, SagaRepositoryError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{CommandType, EventType};

/// Status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Init,
    Running,
    Compensating,
    Completed,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Init => "init",
            SagaStatus::Running => "running",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensated => "compensated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(SagaStatus::Init),
            "running" => Some(SagaStatus::Running),
            "compensating" => Some(SagaStatus::Compensating),
            "completed" => Some(SagaStatus::Completed),
            "compensated" => Some(SagaStatus::Compensated),
            _ => None,
        }
    }

    /// Terminal statuses admit no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }
}

/// Status of a single step's forward command or compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Init,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Init => "init",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// Result of classifying an incoming event against a step's four expected
/// event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    ForwardSuccess,
    ForwardFailure,
    CompensateSuccess,
    CompensateFailure,
    Unknown,
}

/// One step of a saga: a forward command/event pair and an optional
/// compensation command/event pair.
///
/// A step with `compensate = None` has no rollback action and is skipped
/// during compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub command: CommandType,
    pub command_status: StepStatus,
    pub command_success_event: EventType,
    pub command_fail_event: EventType,
    pub compensate: Option<CommandType>,
    pub compensate_status: StepStatus,
    pub compensate_success_event: Option<EventType>,
    pub compensate_fail_event: Option<EventType>,
    pub command_topic: String,
}

impl Step {
    /// Classify `event_type` against this step's four expected event types,
    /// by exact equality, in the order step 2 lists them.
    pub fn classify(&self, event_type: &EventType) -> EventClass {
        if *event_type == self.command_success_event {
            EventClass::ForwardSuccess
        } else if *event_type == self.command_fail_event {
            EventClass::ForwardFailure
        } else if self.compensate_success_event.as_ref() == Some(event_type) {
            EventClass::CompensateSuccess
        } else if self.compensate_fail_event.as_ref() == Some(event_type) {
            EventClass::CompensateFailure
        } else {
            EventClass::Unknown
        }
    }
}

/// A persisted saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub id: Uuid,
    pub current_step: i32,
    pub status: SagaStatus,
    pub steps: Vec<Step>,
    pub payload: SagaPayload,
    pub compensating: bool,
    /// Attempts made so far at the current compensation step.
    /// Not in 's field list; added to implement the compensation
    /// retry policy without a side channel (DESIGN.md).
    pub compensation_attempts: u32,
    /// Set when an operator-forced terminal transition parks the saga after
    /// compensation retries are exhausted, rather than silently marking it
    /// compensated.
    pub parked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Saga {
    /// `status == completed` iff `current_step == len(steps)` and every
    /// step's `command_status == completed`.
    pub fn satisfies_completion_invariant(&self) -> bool {
        let at_end = self.current_step as usize == self.steps.len();
        let all_done = self.steps.iter().all(|s| s.command_status == StepStatus::Completed);
        (self.status == SagaStatus::Completed) == (at_end && all_done)
    }

    /// `status == compensated` iff `compensating && current_step < 0`.
    pub fn satisfies_compensated_invariant(&self) -> bool {
        (self.status == SagaStatus::Compensated) == (self.compensating && self.current_step < 0)
    }
}

/// Errors from saga orchestration.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga {0} not found")]
    NotFound(Uuid),

    #[error("event carries no saga_id")]
    MissingSagaId,

    #[error("current_step {0} is out of range for this saga's steps")]
    StepIndexOutOfRange(i32),

    #[error("event type {0:?} did not match any expected event for the current step")]
    UnknownEvent(EventType),

    #[error(transparent)]
    Repository(#[from] SagaRepositoryError),

    #[error(transparent)]
    Outbox(#[from] crate::outbox::OutboxError),

    #[error("failed to serialize command payload: {0}")]
    Serialize(String),
}

pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn step(success: EventType, fail: EventType, compensate: Option<(CommandType, EventType, EventType)>) -> Step {
        Step {
            command: CommandType::CreateOrder,
            command_status: StepStatus::Init,
            command_success_event: success,
            command_fail_event: fail,
            compensate: compensate.as_ref().map(|(c, _, _)| c.clone()),
            compensate_status: StepStatus::Init,
            compensate_success_event: compensate.as_ref().map(|(_, s, _)| s.clone()),
            compensate_fail_event: compensate.as_ref().map(|(_, _, f)| f.clone()),
            command_topic: "order-commands".to_string(),
        }
    }

    #[test]
    fn classifies_all_four_event_slots() {
        let s = step(
            EventType::OrderCreated,
            EventType::OrderCreateFailed,
            Some((CommandType::CancelOrder, EventType::OrderCancelled, EventType::OrderCancelFailed)),
        );
        assert_eq!(s.classify(&EventType::OrderCreated), EventClass::ForwardSuccess);
        assert_eq!(s.classify(&EventType::OrderCreateFailed), EventClass::ForwardFailure);
        assert_eq!(s.classify(&EventType::OrderCancelled), EventClass::CompensateSuccess);
        assert_eq!(s.classify(&EventType::OrderCancelFailed), EventClass::CompensateFailure);
        assert_eq!(s.classify(&EventType::PaymentCompleted), EventClass::Unknown);
    }

    #[test]
    fn step_without_compensation_never_classifies_as_compensate() {
        let s = step(EventType::ProductsValidated, EventType::ProductsValidationFailed, None);
        assert_eq!(s.classify(&EventType::ProductsValidated), EventClass::ForwardSuccess);
        assert_eq!(s.classify(&EventType::Unknown("Whatever".into())), EventClass::Unknown);
    }
}
