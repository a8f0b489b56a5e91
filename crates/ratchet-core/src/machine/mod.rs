//! The workflow machine: single-step saga execution.
//!
//! One invocation advances exactly one step. The executor holds the
//! execution lock for the full tool call and releases it before every
//! yield back to a transport; at-least-once queue delivery is made safe by
//! the write-once step idempotency marker. The sequence per invocation:
//!
//! 1. guard the status, 2. select the first runnable step, 3. risk-gate
//! (confirmation yield), 4. take the idempotency marker, 5. invoke the
//! tool, 6. on success register compensation then complete and enqueue the
//! next step, 7. on failure classify and consult the failover policy,
//! 8. unwind LIFO while compensating, 9. release the lock and return.

pub mod compensation;
pub mod transitions;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use ratchet_store::keys;
use ratchet_store::models::{
    CompensationEntry, DlqEntry, Execution, ExecutionError, ExecutionStatus, Intent, Plan,
    PlanStep, StepStatus,
};

use crate::error::EngineError;
use crate::events::{EventName, PublishOptions};
use crate::failover::{FailoverAction, FailoverContext, Recommendation};
use crate::invoker::InvocationContext;
use crate::messages::{FailureReason, classify_failure, user_friendly_message};
use crate::queue::QueueMessage;
use crate::services::Services;
use crate::trace::TraceContext;

use transitions::transition;

/// What one invocation of the machine did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A step completed (or the whole saga did).
    StepCompleted {
        step_id: String,
        execution_finished: bool,
        next_step_triggered: bool,
    },
    /// Redelivered message for an already-completed step; nothing ran.
    IdempotentSkip { step_id: String },
    /// The step is gated behind a confirmation token.
    AwaitingConfirmation { step_id: String, token: Uuid },
    /// The failed step was re-enqueued with backoff.
    RetryScheduled { step_id: String, attempts: u32 },
    /// The saga was sent back to planning with a replan marker.
    ReplanRequested { step_id: String },
    /// The unwind ran; `partial` means it could not finish and escalated.
    CompensationFinished { compensated: usize, partial: bool },
    /// The saga was parked in the dead-letter queue.
    Escalated { step_id: Option<String> },
    /// Pending steps remain but none is runnable; the saga failed.
    Stalled,
    /// A confirmed step was reset and re-enqueued.
    Resumed { step_id: String },
    /// The execution was cancelled.
    Cancelled,
}

/// The single-step saga executor.
#[derive(Clone)]
pub struct WorkflowMachine {
    services: Arc<Services>,
}

impl WorkflowMachine {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Accept a planned saga: persist it and enqueue its first step.
    pub async fn accept(
        &self,
        execution_id: Uuid,
        intent: Intent,
        plan: Plan,
        trace: TraceContext,
    ) -> Result<Execution, EngineError> {
        plan.validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if self.services.repo.load(execution_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "execution {execution_id} already exists"
            )));
        }

        let execution = Execution::new(execution_id, intent, plan);
        self.services.repo.save(&execution).await?;
        self.enqueue_step(execution_id, 0, None, trace).await?;
        tracing::info!(
            execution_id = %execution_id,
            steps = execution.plan.steps.len(),
            "execution accepted"
        );
        Ok(execution)
    }

    /// Install a revised plan on a saga parked in `PLANNING`.
    ///
    /// The upstream planner calls this after consuming the replan marker.
    /// Step states reset to pending on the new plan (index 0 first);
    /// registered compensations survive, since they reference side
    /// effects that already happened.
    pub async fn replace_plan(
        &self,
        execution_id: Uuid,
        plan: Plan,
        trace: TraceContext,
    ) -> Result<Execution, EngineError> {
        plan.validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let lock = self
            .services
            .locks
            .acquire(
                &keys::execution_lock(execution_id),
                self.services.config.lock.ttl(),
                "replace_plan",
            )
            .await?
            .ok_or_else(|| {
                EngineError::Conflict(format!("execution {execution_id} is locked"))
            })?;

        let result = async {
            let Some(mut execution) = self.services.repo.load(execution_id).await? else {
                return Err(EngineError::NotFound(format!("execution {execution_id}")));
            };
            if execution.status != ExecutionStatus::Planning {
                return Err(EngineError::Conflict(format!(
                    "execution {execution_id} is {}, not awaiting a plan",
                    execution.status
                )));
            }

            // The old plan's idempotency markers must not suppress the
            // new plan's steps.
            let old_len = execution.plan.steps.len();
            for index in 0..old_len.max(plan.steps.len()) {
                self.services
                    .locks
                    .reset_step_marker(execution_id, index)
                    .await?;
            }

            execution.step_states = plan
                .steps
                .iter()
                .map(|s| ratchet_store::models::StepState::new(&s.id))
                .collect();
            execution.plan = plan;
            execution.error = None;
            transition(&mut execution, ExecutionStatus::Planned)?;
            self.services.repo.save(&execution).await?;
            self.services.repo.clear_replan_marker(execution_id).await?;

            self.emit(
                execution_id,
                EventName::WorkflowResume,
                json!({
                    "reason": "plan_replaced",
                    "steps": execution.plan.steps.len(),
                }),
                false,
                trace,
            )
            .await?;
            self.enqueue_step(execution_id, 0, None, trace).await?;
            tracing::info!(
                execution_id = %execution_id,
                steps = execution.plan.steps.len(),
                "revised plan installed"
            );
            Ok(execution)
        }
        .await;

        if let Err(e) = self.services.locks.release(&lock).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to release execution lock");
        }
        result
    }

    /// Advance the saga by exactly one step.
    ///
    /// `start_index` is the queue's hint of which delivery this was
    /// for; it drives duplicate detection, not selection.
    pub async fn execute_step(
        &self,
        execution_id: Uuid,
        start_index: Option<usize>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let span = tracing::info_span!(
            "execute_step",
            execution_id = %execution_id,
            trace_id = %trace.trace_id,
        );
        self.execute_step_outer(execution_id, start_index, trace)
            .instrument(span)
            .await
    }

    async fn execute_step_outer(
        &self,
        execution_id: Uuid,
        start_index: Option<usize>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let Some(execution) = self.services.repo.load(execution_id).await? else {
            return Err(EngineError::NotFound(format!("execution {execution_id}")));
        };
        if execution.status.is_terminal() {
            // Redelivery after the saga finished.
            let step_id = execution
                .step_states
                .last()
                .map(|s| s.step_id.clone())
                .unwrap_or_default();
            return Ok(StepOutcome::IdempotentSkip { step_id });
        }

        let lock = self
            .services
            .locks
            .acquire(
                &keys::execution_lock(execution_id),
                self.services.config.lock.ttl(),
                "execute_step",
            )
            .await?
            .ok_or_else(|| {
                EngineError::Conflict(format!("execution {execution_id} is locked"))
            })?;

        let result = self.execute_step_locked(execution_id, start_index, trace).await;

        // The lock is released on every path, success or error, before the
        // outcome reaches any transport.
        if let Err(e) = self.services.locks.release(&lock).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to release execution lock");
        }
        result
    }

    /// Resume a saga parked behind a confirmation token.
    pub async fn resume_confirmed(
        &self,
        token: Uuid,
        actor_id: Option<&str>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let record = self.services.confirmations.validate(token, actor_id).await?;
        let execution_id = record.execution_id;

        let span = tracing::info_span!(
            "resume_confirmed",
            execution_id = %execution_id,
            step_id = %record.step_id,
            trace_id = %trace.trace_id,
        );
        self.resume_outer(record, trace).instrument(span).await
    }

    async fn resume_outer(
        &self,
        record: ratchet_store::models::ConfirmationRecord,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = record.execution_id;
        let lock = self
            .services
            .locks
            .acquire(
                &keys::execution_lock(execution_id),
                self.services.config.lock.ttl(),
                "resume_confirmed",
            )
            .await?
            .ok_or_else(|| {
                EngineError::Conflict(format!("execution {execution_id} is locked"))
            })?;

        let result = self.resume_locked(record, trace).await;

        if let Err(e) = self.services.locks.release(&lock).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to release execution lock");
        }
        result
    }

    /// Cancel a non-terminal execution.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        reason: &str,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let lock = self
            .services
            .locks
            .acquire(
                &keys::execution_lock(execution_id),
                self.services.config.lock.ttl(),
                "cancel",
            )
            .await?
            .ok_or_else(|| {
                EngineError::Conflict(format!("execution {execution_id} is locked"))
            })?;

        let result = async {
            let Some(mut execution) = self.services.repo.load(execution_id).await? else {
                return Err(EngineError::NotFound(format!("execution {execution_id}")));
            };
            if execution.status.is_terminal() {
                return Err(EngineError::Conflict(format!(
                    "execution {execution_id} is already {}",
                    execution.status
                )));
            }
            execution.error = Some(ExecutionError {
                code: FailureReason::Cancelled.to_string(),
                message: reason.to_owned(),
                step_id: None,
                details: None,
            });
            transition(&mut execution, ExecutionStatus::Cancelled)?;
            self.services.repo.save(&execution).await?;
            self.emit(
                execution_id,
                EventName::ExecutionFailed,
                json!({ "code": "CANCELLED", "reason": reason }),
                false,
                trace,
            )
            .await?;
            Ok(StepOutcome::Cancelled)
        }
        .await;

        if let Err(e) = self.services.locks.release(&lock).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to release execution lock");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Locked body
    // -----------------------------------------------------------------------

    async fn execute_step_locked(
        &self,
        execution_id: Uuid,
        start_index: Option<usize>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        // Reload under the lock; the pre-lock read may be stale.
        let Some(mut execution) = self.services.repo.load(execution_id).await? else {
            return Err(EngineError::NotFound(format!("execution {execution_id}")));
        };

        // 1. Guard.
        match execution.status {
            ExecutionStatus::Planned => {
                transition(&mut execution, ExecutionStatus::Executing)?;
                self.services.repo.save(&execution).await?;
                self.emit(
                    execution_id,
                    EventName::ExecutionStarted,
                    json!({ "steps": execution.plan.steps.len() }),
                    true,
                    trace,
                )
                .await?;
            }
            ExecutionStatus::Executing => {}
            ExecutionStatus::Compensating => {
                // Re-entry to a stalled unwind (reconciler's
                // COMPENSATION_RETRY path).
                return self.run_compensation(&mut execution, trace).await;
            }
            ExecutionStatus::AwaitingConfirmation | ExecutionStatus::Suspended => {
                return Err(EngineError::Conflict(format!(
                    "execution {execution_id} is {}; resume via confirmation",
                    execution.status
                )));
            }
            other => {
                return Err(EngineError::Conflict(format!(
                    "execution {execution_id} is {other}, not executable"
                )));
            }
        }

        // Duplicate delivery for a step that already completed.
        if let Some(index) = start_index {
            let step = execution.plan.steps.get(index).ok_or_else(|| {
                EngineError::Validation(format!("step index {index} out of range"))
            })?;
            let already_done = execution
                .step_state(&step.id)
                .is_some_and(|s| s.status == StepStatus::Completed);
            if already_done {
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    "duplicate delivery for completed step, skipping"
                );
                return Ok(StepOutcome::IdempotentSkip {
                    step_id: step.id.clone(),
                });
            }
        }

        // 2. Select the first pending step whose dependencies are done.
        let Some(step) = select_runnable(&execution).cloned() else {
            if execution.all_steps_done() {
                return self.finish(&mut execution, trace).await;
            }
            // Pending steps remain but none can run.
            execution.error = Some(ExecutionError {
                code: "STALLED".to_string(),
                message: "no runnable step: pending steps are blocked".to_string(),
                step_id: None,
                details: None,
            });
            transition(&mut execution, ExecutionStatus::Failed)?;
            self.services.repo.save(&execution).await?;
            self.emit(
                execution_id,
                EventName::ExecutionFailed,
                json!({ "code": "STALLED" }),
                true,
                trace,
            )
            .await?;
            return Ok(StepOutcome::Stalled);
        };

        // 3. Risk gate, unless this exact step was already confirmed.
        let confirmed_marker = format!("confirmed:{}", step.id);
        if !execution.context.contains_key(&confirmed_marker) {
            let assessment =
                self.services
                    .risk
                    .assess(&step, &execution.intent, execution.plan.steps.len());
            if self.services.risk.requires_confirmation(&step, &assessment) {
                let actor_id = execution
                    .context
                    .get("actor_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);

                // A blocking score parks the saga in SUSPENDED instead of
                // AWAITING_CONFIRMATION; its token only validates for an
                // identified approver.
                let blocked = self.services.risk.blocks(&assessment);
                let gate_status = if blocked {
                    ExecutionStatus::Suspended
                } else {
                    ExecutionStatus::AwaitingConfirmation
                };
                transition(&mut execution, gate_status)?;
                if let Some(state) = execution.step_state_mut(&step.id) {
                    state.status = StepStatus::AwaitingConfirmation;
                }
                let record = self
                    .services
                    .confirmations
                    .create(
                        execution_id,
                        &step.id,
                        step.parameters.clone(),
                        assessment,
                        actor_id,
                    )
                    .await?;
                // Snapshot tool schemas so drift is visible on resume.
                self.services
                    .versions
                    .capture(execution_id, &execution.plan, &self.services.registry)
                    .await?;
                self.services.repo.save(&execution).await?;
                self.emit(
                    execution_id,
                    EventName::ConfirmationRequested,
                    json!({
                        "step_id": step.id,
                        "token": record.token,
                        "risk": record.risk,
                        "blocked": blocked,
                        "expires_at": record.expires_at,
                    }),
                    true,
                    trace,
                )
                .await?;
                self.services
                    .heartbeats
                    .arm(execution_id, execution.next_step_index() + 1, trace)
                    .await?;
                return Ok(StepOutcome::AwaitingConfirmation {
                    step_id: step.id.clone(),
                    token: record.token,
                });
            }
        }

        // 4. Idempotency marker: the truth of "this index was attempted".
        let newly_marked = self
            .services
            .locks
            .mark_step_done(execution_id, step.index)
            .await?;
        if !newly_marked {
            // A previous invocation attempted this index and died after
            // marking. Tools are idempotent under (execution_id, step_id);
            // treat as no-op success and keep the saga moving.
            tracing::warn!(
                execution_id = %execution_id,
                step_id = %step.id,
                "idempotency marker already set, recording no-op success"
            );
            if let Some(state) = execution.step_state_mut(&step.id) {
                state.status = StepStatus::Completed;
                state.ended_at = Some(Utc::now());
            }
            execution.touch();
            self.services.repo.save(&execution).await?;
            self.emit(
                execution_id,
                EventName::StepCompleted,
                json!({ "step_id": step.id, "idempotent": true }),
                true,
                trace,
            )
            .await?;
            return self.after_step_success(&mut execution, &step, trace).await;
        }

        // 5. Invoke.
        if let Some(state) = execution.step_state_mut(&step.id) {
            state.status = StepStatus::Running;
            state.attempts += 1;
            state.started_at = Some(Utc::now());
        }
        execution.touch();
        self.services.repo.save(&execution).await?;
        let attempt = execution
            .step_state(&step.id)
            .map(|s| s.attempts)
            .unwrap_or(1);
        self.emit(
            execution_id,
            EventName::StepStarted,
            json!({ "step_id": step.id, "tool_name": step.tool_name, "attempt": attempt }),
            true,
            trace,
        )
        .await?;

        let timeout = if step.timeout_ms > 0 {
            Duration::from_millis(step.timeout_ms)
        } else {
            self.services.config.step_timeout()
        };
        let ctx = InvocationContext {
            execution_id,
            step_id: step.id.clone(),
            cancel: CancellationToken::new(),
            trace,
        };
        let result = self
            .services
            .invoker
            .invoke(&step.tool_name, step.parameters.clone(), timeout, ctx)
            .await;

        if result.success {
            // 6. Compensation is registered before (and persisted with)
            // the completed step state.
            let compensation = result.compensation.clone().or_else(|| {
                self.services
                    .registry
                    .get(&step.tool_name)
                    .and_then(|tool| tool.compensation_tool())
                    .map(|tool| crate::invoker::CompensationRequest {
                        tool,
                        parameters: step.parameters.clone(),
                    })
            });
            if let Some(compensation) = compensation {
                execution.compensations_registered.push(CompensationEntry {
                    step_id: step.id.clone(),
                    tool: compensation.tool,
                    parameters: compensation.parameters,
                });
            }
            if let Some(state) = execution.step_state_mut(&step.id) {
                state.status = StepStatus::Completed;
                state.output = result.output.clone();
                state.ended_at = Some(Utc::now());
            }
            execution.touch();
            self.services.repo.save(&execution).await?;
            self.emit(
                execution_id,
                EventName::StepCompleted,
                json!({ "step_id": step.id, "latency_ms": result.latency_ms }),
                true,
                trace,
            )
            .await?;
            self.after_step_success(&mut execution, &step, trace).await
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "tool reported failure".to_string());
            self.after_step_failure(&mut execution, &step, error, trace)
                .await
        }
    }

    // -----------------------------------------------------------------------
    // Success path
    // -----------------------------------------------------------------------

    async fn after_step_success(
        &self,
        execution: &mut Execution,
        step: &PlanStep,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        if execution.all_steps_done() {
            return match self.finish(execution, trace).await? {
                StepOutcome::StepCompleted { .. } => Ok(StepOutcome::StepCompleted {
                    step_id: step.id.clone(),
                    execution_finished: true,
                    next_step_triggered: false,
                }),
                other => Ok(other),
            };
        }

        // 9. Yield contract: enqueue the next step, arm the heartbeat,
        // return (the caller releases the lock).
        let next_index = execution.next_step_index();
        self.enqueue_step(execution.execution_id, next_index, None, trace)
            .await?;
        self.services
            .heartbeats
            .arm(execution.execution_id, next_index + 1, trace)
            .await?;
        Ok(StepOutcome::StepCompleted {
            step_id: step.id.clone(),
            execution_finished: false,
            next_step_triggered: true,
        })
    }

    async fn finish(
        &self,
        execution: &mut Execution,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = execution.execution_id;
        transition(execution, ExecutionStatus::Completed)?;
        self.services.repo.save(execution).await?;
        self.services.repo.clear_heartbeat(execution_id).await?;
        self.services.versions.clear(execution_id).await?;
        self.emit(
            execution_id,
            EventName::ExecutionCompleted,
            json!({ "steps": execution.plan.steps.len() }),
            true,
            trace,
        )
        .await?;
        tracing::info!(execution_id = %execution_id, "execution completed");
        Ok(StepOutcome::StepCompleted {
            step_id: execution
                .step_states
                .last()
                .map(|s| s.step_id.clone())
                .unwrap_or_default(),
            execution_finished: true,
            next_step_triggered: false,
        })
    }

    // -----------------------------------------------------------------------
    // Failure path
    // -----------------------------------------------------------------------

    async fn after_step_failure(
        &self,
        execution: &mut Execution,
        step: &PlanStep,
        error: String,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = execution.execution_id;
        let reason = classify_failure(&error);

        if let Some(state) = execution.step_state_mut(&step.id) {
            state.status = StepStatus::Failed;
            state.error = Some(error.clone());
            state.ended_at = Some(Utc::now());
        }
        execution.error = Some(ExecutionError {
            code: reason.to_string(),
            message: user_friendly_message(reason).to_string(),
            step_id: Some(step.id.clone()),
            details: Some(json!({ "raw_error": error })),
        });
        execution.touch();
        self.services.repo.save(execution).await?;
        self.emit(
            execution_id,
            EventName::StepFailed,
            json!({ "step_id": step.id, "reason": reason, "error": error }),
            true,
            trace,
        )
        .await?;

        let attempts = execution
            .step_state(&step.id)
            .map(|s| s.attempts)
            .unwrap_or(1);
        let context = failover_context(execution, step, reason, attempts);
        let recommendation = self.services.failover.evaluate(&context);

        if let Some(rec) = &recommendation {
            self.services
                .repo
                .save_failover_snapshot(
                    execution_id,
                    &serde_json::to_value(rec).unwrap_or(Value::Null),
                )
                .await?;
        }

        let action = recommendation
            .as_ref()
            .map(|r| r.action)
            .unwrap_or(FailoverAction::EscalateToHuman);

        tracing::info!(
            execution_id = %execution_id,
            step_id = %step.id,
            reason = %reason,
            action = %action,
            "step failed, applying failover action"
        );

        match action {
            FailoverAction::RetryWithBackoff => {
                let max = self.services.config.reconcile.max_recovery_attempts;
                if attempts > max {
                    // Retries exhausted: unwind if there is anything to
                    // unwind, otherwise park for a human.
                    if execution.compensations_registered.is_empty() {
                        self.escalate(execution, Some(&step.id), trace).await
                    } else {
                        self.start_compensation(execution, trace).await
                    }
                } else {
                    if let Some(state) = execution.step_state_mut(&step.id) {
                        state.status = StepStatus::Pending;
                    }
                    execution.touch();
                    self.services.repo.save(execution).await?;
                    // A deliberate retry is a new attempt: clear the
                    // marker so the redelivery may invoke the tool again.
                    self.services
                        .locks
                        .reset_step_marker(execution_id, step.index)
                        .await?;
                    let backoff = Duration::from_secs(1u64 << attempts.min(6));
                    self.enqueue_step(execution_id, step.index, Some(backoff), trace)
                        .await?;
                    self.services
                        .heartbeats
                        .arm(execution_id, execution.next_step_index() + 1, trace)
                        .await?;
                    Ok(StepOutcome::RetryScheduled {
                        step_id: step.id.clone(),
                        attempts,
                    })
                }
            }
            FailoverAction::SuggestAlternativeTime
            | FailoverAction::SuggestAlternativeRestaurant
            | FailoverAction::TriggerDelivery
            | FailoverAction::TriggerWaitlist
            | FailoverAction::DowngradePartySize => {
                self.request_replan(execution, step, recommendation, trace)
                    .await
            }
            FailoverAction::AbortAndRefund => self.start_compensation(execution, trace).await,
            FailoverAction::EscalateToHuman => {
                self.escalate(execution, Some(&step.id), trace).await
            }
        }
    }

    async fn request_replan(
        &self,
        execution: &mut Execution,
        step: &PlanStep,
        recommendation: Option<Recommendation>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = execution.execution_id;
        let marker = json!({
            "reason": "failover",
            "failed_step_id": step.id,
            "recommendation": recommendation,
        });
        self.services
            .repo
            .save_replan_marker(execution_id, &marker)
            .await?;
        transition(execution, ExecutionStatus::Planning)?;
        self.services.repo.save(execution).await?;
        self.emit(
            execution_id,
            EventName::ReplanRequested,
            marker,
            true,
            trace,
        )
        .await?;
        Ok(StepOutcome::ReplanRequested {
            step_id: step.id.clone(),
        })
    }

    pub(crate) async fn escalate(
        &self,
        execution: &mut Execution,
        step_id: Option<&str>,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = execution.execution_id;
        let existing = self.services.repo.load_dlq(execution_id).await?;
        let entry = DlqEntry {
            execution_id,
            detected_at: Utc::now(),
            attempts: existing.map(|e| e.attempts).unwrap_or(0) + 1,
            last_status: execution.status,
        };
        self.services.repo.upsert_dlq(&entry).await?;
        self.emit(
            execution_id,
            EventName::SagaManualInterventionRequired,
            json!({
                "execution_id": execution_id,
                "step_id": step_id,
                "attempts": entry.attempts,
                "last_status": execution.status,
            }),
            false,
            trace,
        )
        .await?;
        tracing::error!(
            execution_id = %execution_id,
            step_id = step_id.unwrap_or("-"),
            "saga escalated to dead-letter queue"
        );
        Ok(StepOutcome::Escalated {
            step_id: step_id.map(str::to_owned),
        })
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    async fn resume_locked(
        &self,
        record: ratchet_store::models::ConfirmationRecord,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        let execution_id = record.execution_id;
        let Some(mut execution) = self.services.repo.load(execution_id).await? else {
            return Err(EngineError::NotFound(format!("execution {execution_id}")));
        };

        if !matches!(
            execution.status,
            ExecutionStatus::AwaitingConfirmation | ExecutionStatus::Suspended
        ) {
            return Err(EngineError::Conflict(format!(
                "execution {execution_id} is {}, not awaiting confirmation",
                execution.status
            )));
        }

        // Single use: consume before any state change; a concurrent or
        // redelivered confirm gets NotFound from here on.
        self.services.confirmations.consume(&record).await?;

        // Schema drift gate: the world may have changed while we waited.
        let drift = self
            .services
            .versions
            .check_on_resume(execution_id, &self.services.registry)
            .await?;
        if drift.severity.requires_replan() {
            self.services
                .repo
                .save_replan_marker(execution_id, &drift.mapping_suggestion())
                .await?;
            transition(&mut execution, ExecutionStatus::Executing)?;
            transition(&mut execution, ExecutionStatus::Planning)?;
            self.services.repo.save(&execution).await?;
            self.emit(
                execution_id,
                EventName::DriftDetected,
                drift.mapping_suggestion(),
                true,
                trace,
            )
            .await?;
            return Ok(StepOutcome::ReplanRequested {
                step_id: record.step_id,
            });
        }
        if drift.severity == crate::versioning::DriftSeverity::Minor {
            self.emit(
                execution_id,
                EventName::DriftDetected,
                drift.mapping_suggestion(),
                false,
                trace,
            )
            .await?;
        }

        let step_index = execution
            .plan
            .step_by_id(&record.step_id)
            .map(|s| s.index)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "confirmed step {} is not in the plan",
                    record.step_id
                ))
            })?;

        if let Some(state) = execution.step_state_mut(&record.step_id) {
            state.status = StepStatus::Pending;
        }
        execution.context.insert(
            format!("confirmed:{}", record.step_id),
            json!(Utc::now().to_rfc3339()),
        );
        transition(&mut execution, ExecutionStatus::Executing)?;
        self.services.repo.save(&execution).await?;
        self.emit(
            execution_id,
            EventName::ConfirmationAccepted,
            json!({ "step_id": record.step_id, "token": record.token }),
            true,
            trace,
        )
        .await?;

        self.enqueue_step(execution_id, step_index, None, trace).await?;
        self.services
            .heartbeats
            .arm(execution_id, execution.next_step_index() + 1, trace)
            .await?;

        Ok(StepOutcome::Resumed {
            step_id: record.step_id,
        })
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    pub(crate) async fn enqueue_step(
        &self,
        execution_id: Uuid,
        step_index: usize,
        delay: Option<Duration>,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        let mut message = QueueMessage::new(
            format!("{}/engine/execute-step", self.services.config.engine_base_url),
            json!({
                "execution_id": execution_id,
                "start_step_index": step_index,
            }),
        )
        .with_headers(trace.headers());
        if let Some(delay) = delay {
            message = message.with_delay(delay);
        }
        self.services.queue.publish(message).await?;
        Ok(())
    }

    pub(crate) async fn emit(
        &self,
        execution_id: Uuid,
        event: EventName,
        mut data: Value,
        ordered: bool,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        if let Value::Object(map) = &mut data {
            map.entry("execution_id".to_string())
                .or_insert_with(|| json!(execution_id));
        }
        let opts = if ordered {
            PublishOptions::ordered(trace)
        } else {
            PublishOptions::unordered(trace)
        };
        self.services
            .bus
            .publish(&format!("exec:{execution_id}"), event, data, opts)
            .await
    }
}

/// The first pending step whose dependencies have all completed.
fn select_runnable(execution: &Execution) -> Option<&PlanStep> {
    execution.plan.steps.iter().find(|step| {
        let pending = execution
            .step_state(&step.id)
            .is_some_and(|s| s.status == StepStatus::Pending);
        pending
            && step.dependencies.iter().all(|dep| {
                execution.step_state(dep).is_some_and(|s| {
                    matches!(s.status, StepStatus::Completed | StepStatus::Skipped)
                })
            })
    })
}

/// Build the failover context from what the saga knows.
fn failover_context(
    execution: &Execution,
    step: &PlanStep,
    reason: FailureReason,
    attempts: u32,
) -> FailoverContext {
    let params = &execution.intent.parameters;
    let party_size = step
        .parameters
        .get("party_size")
        .or_else(|| step.parameters.get("guests"))
        .or_else(|| params.get("party_size"))
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    let restaurant_tags = params
        .get("restaurant_tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut metadata = Map::new();
    metadata.insert("step_id".to_string(), json!(step.id));
    metadata.insert("tool_name".to_string(), json!(step.tool_name));

    FailoverContext {
        intent_type: execution.intent.intent_type.clone(),
        failure_reason: reason,
        confidence: execution.intent.confidence,
        attempt_count: attempts,
        restaurant_tags,
        party_size,
        time_of_day: None,
        day_of_week: Some(Utc::now().date_naive().weekday()),
        metadata,
    }
}
