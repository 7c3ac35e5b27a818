//! The saga orchestrator: drives step execution and compensation on
//! replies.
//!
//! The orchestrator is itself a participant: its inbox receives reply
//! events, its outbox emits the next forward or compensation command. It
//! exposes exactly `start`/`handle_event`; everything else is private
//! dispatch, one arm per reply class (forward success/failure, compensation
//! success/failure).

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use tracing::{error, warn};

use crate::envelope::{Command, CommandType, Event};
use crate::outbox::{OutboxMessage, OutboxStore};

use super::payload::{map_compensate, map_forward, merge_event};
use super::repository::SagaRepository;
use super::{EventClass, Saga, SagaError, SagaStatus, StepStatus};

/// Compensation-failure retry policy: capped exponential backoff
/// up to `max_attempts`, after which the saga is parked for an operator
/// rather than silently marked compensated.
#[derive(Debug, Clone)]
pub struct CompensationRetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CompensationRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl CompensationRetryPolicy {
    /// The `backon` backoff builder a caller re-publishing the compensation
    /// command should schedule retries with.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts as usize)
    }
}

/// Drives the saga state machine. Generic over the saga repository and
/// outbox store backends, which must share a connection type so the caller
/// can run `start`/`handle_event` inside one ambient transaction.
pub struct SagaOrchestrator<R, O> {
    repo: R,
    outbox: O,
    compensation_retry: CompensationRetryPolicy,
}

impl<R, O> SagaOrchestrator<R, O>
where
    R: SagaRepository,
    O: OutboxStore<Conn = R::Conn>,
{
    pub fn new(repo: R, outbox: O) -> Self {
        Self {
            repo,
            outbox,
            compensation_retry: CompensationRetryPolicy::default(),
        }
    }

    pub fn with_compensation_retry(mut self, policy: CompensationRetryPolicy) -> Self {
        self.compensation_retry = policy;
        self
    }

    /// Persist a freshly-built saga and enqueue its first forward command,
    /// inside the caller's ambient transaction ("start").
    pub async fn start(&self, conn: &mut R::Conn, saga: Saga) -> super::Result<Saga> {
        self.repo.create(conn, &saga).await?;
        let mut saga = saga;
        self.execute_next_step(conn, &mut saga).await?;
        Ok(saga)
    }

    /// Execution protocol for an incoming reply event.
    pub async fn handle_event(&self, conn: &mut R::Conn, event: &Event) -> super::Result<()> {
        let saga_id = event.saga_id.ok_or(SagaError::MissingSagaId)?;
        let mut saga = self
            .repo
            .find(conn, saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if saga.status.is_terminal() {
            // Invariant violation: log at error, ack, do not retry.
            error!(saga_id = %saga_id, status = saga.status.as_str(), "event received for saga in terminal state");
            return Ok(());
        }

        let idx = saga.current_step;
        let step = saga
            .steps
            .get(usize::try_from(idx).map_err(|_| SagaError::StepIndexOutOfRange(idx))?)
            .ok_or(SagaError::StepIndexOutOfRange(idx))?
            .clone();

        match step.classify(&event.event_type) {
            EventClass::ForwardSuccess => self.handle_forward_success(conn, &mut saga, event).await,
            EventClass::ForwardFailure => self.handle_forward_failure(conn, &mut saga).await,
            EventClass::CompensateSuccess => self.handle_compensate_success(conn, &mut saga).await,
            EventClass::CompensateFailure => self.handle_compensate_failure(conn, &mut saga).await,
            EventClass::Unknown => {
                warn!(saga_id = %saga_id, event_type = ?event.event_type, "unknown event type for current step");
                Err(SagaError::UnknownEvent(event.event_type.clone()))
            }
        }
    }

    async fn handle_forward_success(&self, conn: &mut R::Conn, saga: &mut Saga, event: &Event) -> super::Result<()> {
        merge_event(&mut saga.payload, event);

        let idx = saga.current_step as usize;
        saga.steps[idx].command_status = StepStatus::Completed;
        saga.current_step += 1;
        saga.updated_at = Utc::now();

        if saga.current_step as usize == saga.steps.len() {
            saga.status = SagaStatus::Completed;
            self.repo.update(conn, saga).await?;
            return Ok(());
        }

        self.execute_next_step(conn, saga).await
    }

    /// Enqueue the forward command for `saga.current_step` and persist the
    /// saga as `running` ("Forward success" / `start`).
    async fn execute_next_step(&self, conn: &mut R::Conn, saga: &mut Saga) -> super::Result<()> {
        let idx = saga.current_step as usize;
        let next = saga.steps[idx].clone();
        let command_payload = map_forward(&next.command, &saga.payload);
        let command = Command::new(next.command.clone(), Some(saga.id), command_payload);
        let bytes = serde_json::to_vec(&command).map_err(|e| SagaError::Serialize(e.to_string()))?;
        let outbox_msg = OutboxMessage::new(next.command_topic.clone(), saga.id.to_string(), bytes);
        self.outbox.publish(conn, outbox_msg).await?;

        saga.status = SagaStatus::Running;
        saga.steps[idx].command_status = StepStatus::Running;
        saga.updated_at = Utc::now();
        self.repo.update(conn, saga).await?;
        Ok(())
    }

    async fn handle_forward_failure(&self, conn: &mut R::Conn, saga: &mut Saga) -> super::Result<()> {
        if saga.compensating {
            // Already compensating: a fail-during-compensation is handled
            // only by the compensation-failure branch.
            return Ok(());
        }

        saga.compensating = true;
        saga.status = SagaStatus::Compensating;
        let idx = saga.current_step as usize;
        saga.steps[idx].command_status = StepStatus::Failed;
        saga.current_step -= 1;
        saga.updated_at = Utc::now();
        self.repo.update(conn, saga).await?;

        self.compensate_next(conn, saga).await
    }

    /// Walk `current_step` down toward -1, skipping steps with no
    /// compensation and enqueueing the first one that has one (/// "Compensate next").
    async fn compensate_next(&self, conn: &mut R::Conn, saga: &mut Saga) -> super::Result<()> {
        loop {
            if saga.current_step < 0 {
                saga.status = SagaStatus::Compensated;
                saga.updated_at = Utc::now();
                self.repo.update(conn, saga).await?;
                return Ok(());
            }

            let idx = saga.current_step as usize;
            let step = saga.steps[idx].clone();
            match step.compensate {
                None => {
                    saga.steps[idx].compensate_status = StepStatus::Completed;
                    saga.current_step -= 1;
                    saga.updated_at = Utc::now();
                    self.repo.update(conn, saga).await?;
                    continue;
                }
                Some(compensate_cmd) => {
                    self.publish_compensate_command(conn, saga, idx, &compensate_cmd).await?;

                    saga.steps[idx].compensate_status = StepStatus::Running;
                    saga.compensation_attempts = 0;
                    saga.updated_at = Utc::now();
                    self.repo.update(conn, saga).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Enqueue the compensation command for step `idx`, mapped from the
    /// saga's current payload.
    async fn publish_compensate_command(
        &self,
        conn: &mut R::Conn,
        saga: &Saga,
        idx: usize,
        compensate_cmd: &CommandType,
    ) -> super::Result<()> {
        let step = saga.steps[idx].clone();
        let command_payload = map_compensate(compensate_cmd, &saga.payload);
        let command = Command::new(compensate_cmd.clone(), Some(saga.id), command_payload);
        let bytes = serde_json::to_vec(&command).map_err(|e| SagaError::Serialize(e.to_string()))?;
        let outbox_msg = OutboxMessage::new(step.command_topic.clone(), saga.id.to_string(), bytes);
        self.outbox.publish(conn, outbox_msg).await?;
        Ok(())
    }

    async fn handle_compensate_success(&self, conn: &mut R::Conn, saga: &mut Saga) -> super::Result<()> {
        let idx = saga.current_step as usize;
        saga.steps[idx].compensate_status = StepStatus::Completed;
        saga.compensation_attempts = 0;

        if idx == 0 {
            saga.current_step -= 1;
            saga.status = SagaStatus::Compensated;
            saga.updated_at = Utc::now();
            self.repo.update(conn, saga).await?;
            return Ok(());
        }

        saga.current_step -= 1;
        saga.updated_at = Utc::now();
        self.repo.update(conn, saga).await?;

        self.compensate_next(conn, saga).await
    }

    async fn handle_compensate_failure(&self, conn: &mut R::Conn, saga: &mut Saga) -> super::Result<()> {
        saga.compensation_attempts += 1;

        if saga.compensation_attempts > self.compensation_retry.max_attempts {
            error!(
                saga_id = %saga.id,
                attempts = saga.compensation_attempts,
                "compensation retries exhausted, parking saga for operator review"
            );
            saga.parked_reason = Some(format!(
                "compensation failed after {} attempts at step {}",
                saga.compensation_attempts, saga.current_step
            ));
            saga.updated_at = Utc::now();
            self.repo.update(conn, saga).await?;
            return Ok(());
        }

        let idx = saga.current_step as usize;
        let compensate_cmd = saga.steps[idx]
            .compensate
            .clone()
            .ok_or_else(|| SagaError::StepIndexOutOfRange(saga.current_step))?;

        let delay = self
            .compensation_retry
            .backoff()
            .build()
            .nth((saga.compensation_attempts - 1) as usize)
            .unwrap_or(self.compensation_retry.max_delay);

        warn!(
            saga_id = %saga.id,
            attempt = saga.compensation_attempts,
            delay_ms = delay.as_millis() as u64,
            "compensation failed, re-publishing compensation command after backoff"
        );
        tokio::time::sleep(delay).await;

        self.publish_compensate_command(conn, saga, idx, &compensate_cmd).await?;
        saga.steps[idx].compensate_status = StepStatus::Running;
        saga.updated_at = Utc::now();
        self.repo.update(conn, saga).await?;
        Ok(())
    }
}
