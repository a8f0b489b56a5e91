//! Dead-letter reconciliation for zombie sagas.
//!
//! A periodic scan walks the whole `task:*` keyspace for executions that
//! are neither terminal nor recently active, then handles the oldest of
//! them up to the per-cycle cap (the scan itself is unordered, so the cap
//! is only applied after the full walk). Each stalled saga is driven back
//! to life: failed steps go through the pluggable repair strategy,
//! stalled unwinds get a `COMPENSATION_RETRY`, everything else gets a
//! `WORKFLOW_RESUME` re-enqueue. Recovery attempts are tracked in the DLQ
//! entry; a saga that keeps stalling past the attempt budget is escalated
//! once and then left for a human. The reconciler never transitions a
//! terminal execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use ratchet_store::models::{DlqEntry, Execution, ExecutionStatus, StepStatus};

use crate::error::EngineError;
use crate::events::EventName;
use crate::machine::WorkflowMachine;
use crate::messages::classify_failure;
use crate::trace::TraceContext;

/// Hard cap on stalled sagas handled per scan cycle, applied oldest-first
/// after the full keyspace walk. The remainder is picked up next cycle.
const MAX_PER_CYCLE: usize = 1000;

/// Page size for the execution scan.
const SCAN_PAGE: usize = 100;

/// Aggregated result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationResult {
    pub scanned: usize,
    pub stalled: usize,
    pub resumed: usize,
    pub compensation_retries: usize,
    pub repairs_applied: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Verdict of a repair dry-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe(String),
}

/// A proposed fix for a saga with a failed step.
#[derive(Debug, Clone)]
pub struct RepairProposal {
    pub step_id: String,
    pub description: String,
}

/// Pluggable repair path: analyze the stuck saga, propose a fix, dry-run
/// validate it. The reconciler applies only `Safe` proposals.
pub trait RepairStrategy: Send + Sync {
    fn analyze(&self, execution: &Execution) -> Option<RepairProposal>;
    fn validate(&self, execution: &Execution, proposal: &RepairProposal) -> SafetyVerdict;
}

/// Default strategy: a failed step whose error classifies as transient is
/// reset to pending, as long as the saga is still in an executable status
/// and the step has retry budget left.
pub struct HeuristicRepair {
    pub max_attempts: u32,
}

impl RepairStrategy for HeuristicRepair {
    fn analyze(&self, execution: &Execution) -> Option<RepairProposal> {
        execution
            .step_states
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .and_then(|state| {
                let error = state.error.as_deref()?;
                classify_failure(error).is_retryable().then(|| RepairProposal {
                    step_id: state.step_id.clone(),
                    description: format!(
                        "reset failed step {} ({}) to pending",
                        state.step_id,
                        classify_failure(error)
                    ),
                })
            })
    }

    fn validate(&self, execution: &Execution, proposal: &RepairProposal) -> SafetyVerdict {
        if execution.status != ExecutionStatus::Executing {
            return SafetyVerdict::Unsafe(format!(
                "execution is {}, repair only applies while EXECUTING",
                execution.status
            ));
        }
        match execution.step_state(&proposal.step_id) {
            Some(state) if state.attempts <= self.max_attempts => SafetyVerdict::Safe,
            Some(state) => SafetyVerdict::Unsafe(format!(
                "step {} has exhausted its retry budget ({} attempts)",
                proposal.step_id, state.attempts
            )),
            None => SafetyVerdict::Unsafe(format!("step {} not found", proposal.step_id)),
        }
    }
}

/// The reconciler.
pub struct Reconciler {
    machine: WorkflowMachine,
    repair: Arc<dyn RepairStrategy>,
}

impl Reconciler {
    pub fn new(machine: WorkflowMachine) -> Self {
        let max_attempts = machine.services().config.reconcile.max_recovery_attempts;
        Self {
            machine,
            repair: Arc::new(HeuristicRepair { max_attempts }),
        }
    }

    pub fn with_repair_strategy(mut self, repair: Arc<dyn RepairStrategy>) -> Self {
        self.repair = repair;
        self
    }

    /// One reconciliation pass.
    pub async fn run_once(&self, trace: TraceContext) -> Result<ReconciliationResult, EngineError> {
        let services = self.machine.services();
        let min_inactive = chrono::Duration::milliseconds(
            services.config.reconcile.min_inactive_ms as i64,
        );
        let now = Utc::now();
        let mut result = ReconciliationResult::default();

        // Collect stalled candidates. The scan order is arbitrary (SCAN
        // makes no ordering promise), so the whole keyspace is walked
        // before the per-cycle cap is applied -- otherwise the cap would
        // keep an arbitrary subset instead of the oldest sagas.
        let mut candidates: Vec<(chrono::DateTime<Utc>, Uuid)> = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, page) = services.repo.scan_executions(cursor, SCAN_PAGE).await?;
            for execution in page {
                result.scanned += 1;
                if execution.status.is_terminal() {
                    continue;
                }
                if now.signed_duration_since(execution.updated_at) >= min_inactive {
                    candidates.push((execution.updated_at, execution.execution_id));
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        if candidates.len() > MAX_PER_CYCLE {
            tracing::warn!(
                candidates = candidates.len(),
                cap = MAX_PER_CYCLE,
                "stalled sagas exceed the per-cycle cap, deferring the newest"
            );
        }
        candidates.sort_by_key(|(updated_at, _)| *updated_at);
        candidates.truncate(MAX_PER_CYCLE);

        for (_, execution_id) in candidates {
            if let Err(e) = self
                .reconcile_by_id(execution_id, min_inactive, &mut result, trace)
                .await
            {
                tracing::error!(
                    execution_id = %execution_id,
                    error = %e,
                    "reconciliation failed for execution"
                );
                result.errors.push(format!("{execution_id}: {e}"));
            }
        }

        tracing::info!(
            scanned = result.scanned,
            stalled = result.stalled,
            resumed = result.resumed,
            compensation_retries = result.compensation_retries,
            repairs = result.repairs_applied,
            escalated = result.escalated,
            "reconciliation pass complete"
        );
        Ok(result)
    }

    /// Run forever with a fixed interval until cancelled.
    pub async fn run_loop(
        &self,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            if let Err(e) = self.run_once(TraceContext::new()).await {
                tracing::error!(error = %e, "reconciliation pass errored");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Reload a capped candidate and, if it is still a zombie, drive it.
    ///
    /// The scan snapshot may be stale by the time the candidate's turn
    /// comes: an execution that progressed, terminated, or vanished in
    /// the meantime is left alone.
    async fn reconcile_by_id(
        &self,
        execution_id: Uuid,
        min_inactive: chrono::Duration,
        result: &mut ReconciliationResult,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.machine.services().repo.load(execution_id).await? else {
            return Ok(());
        };
        if execution.status.is_terminal()
            || Utc::now().signed_duration_since(execution.updated_at) < min_inactive
        {
            return Ok(());
        }
        result.stalled += 1;
        self.reconcile_one(&execution, result, trace).await
    }

    async fn reconcile_one(
        &self,
        execution: &Execution,
        result: &mut ReconciliationResult,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        let services = self.machine.services();
        let execution_id = execution.execution_id;
        let max_attempts = services.config.reconcile.max_recovery_attempts;

        let existing = services.repo.load_dlq(execution_id).await?;
        let prior_attempts = existing.as_ref().map(|e| e.attempts).unwrap_or(0);

        if prior_attempts > max_attempts {
            // Already escalated; leave it for the operator.
            result.skipped += 1;
            return Ok(());
        }
        if prior_attempts == max_attempts {
            // Recovery budget spent: one final alert, then silence.
            self.bump_dlq(execution, existing, trace).await?;
            self.machine
                .emit(
                    execution_id,
                    EventName::SagaManualInterventionRequired,
                    json!({
                        "attempts": prior_attempts + 1,
                        "last_status": execution.status,
                    }),
                    false,
                    trace,
                )
                .await?;
            result.escalated += 1;
            return Ok(());
        }

        match execution.status {
            ExecutionStatus::AwaitingConfirmation | ExecutionStatus::Suspended => {
                // Waiting on a human is only a zombie once the token is
                // gone.
                let token = services.repo.confirmation_token_for(execution_id).await?;
                if token.is_some() {
                    result.skipped += 1;
                    return Ok(());
                }
                self.bump_dlq(execution, existing, trace).await?;
                self.machine
                    .emit(
                        execution_id,
                        EventName::SagaManualInterventionRequired,
                        json!({
                            "reason": "confirmation expired unanswered",
                            "last_status": execution.status,
                        }),
                        false,
                        trace,
                    )
                    .await?;
                result.escalated += 1;
            }
            ExecutionStatus::Compensating if !execution.compensations_registered.is_empty() => {
                self.bump_dlq(execution, existing, trace).await?;
                self.machine
                    .emit(
                        execution_id,
                        EventName::CompensationRetry,
                        json!({ "remaining": execution.compensations_registered.len() }),
                        false,
                        trace,
                    )
                    .await?;
                self.machine
                    .enqueue_step(execution_id, execution.next_step_index(), None, trace)
                    .await?;
                result.compensation_retries += 1;
            }
            _ if execution
                .step_states
                .iter()
                .any(|s| s.status == StepStatus::Failed) =>
            {
                // Intelligent repair: analyze -> propose -> dry-run
                // validate -> apply.
                let proposal = self.repair.analyze(execution);
                let verdict = proposal
                    .as_ref()
                    .map(|p| self.repair.validate(execution, p));
                match (proposal, verdict) {
                    (Some(proposal), Some(SafetyVerdict::Safe)) => {
                        let mut patched = execution.clone();
                        if let Some(state) = patched.step_state_mut(&proposal.step_id) {
                            state.status = StepStatus::Pending;
                        }
                        patched.touch();
                        services.repo.save(&patched).await?;
                        if let Some(step) = patched.plan.step_by_id(&proposal.step_id) {
                            services
                                .locks
                                .reset_step_marker(execution_id, step.index)
                                .await?;
                        }
                        self.bump_dlq(execution, existing, trace).await?;
                        self.machine
                            .emit(
                                execution_id,
                                EventName::WorkflowResume,
                                json!({ "repair": proposal.description }),
                                false,
                                trace,
                            )
                            .await?;
                        self.machine
                            .enqueue_step(execution_id, patched.next_step_index(), None, trace)
                            .await?;
                        result.repairs_applied += 1;
                        result.resumed += 1;
                    }
                    (_, verdict) => {
                        let reason = match verdict {
                            Some(SafetyVerdict::Unsafe(reason)) => reason,
                            _ => "no safe repair available".to_string(),
                        };
                        self.bump_dlq(execution, existing, trace).await?;
                        self.machine
                            .emit(
                                execution_id,
                                EventName::SagaManualInterventionRequired,
                                json!({ "reason": reason, "last_status": execution.status }),
                                false,
                                trace,
                            )
                            .await?;
                        result.escalated += 1;
                    }
                }
            }
            _ => {
                // Progress simply stopped: re-enter the engine.
                self.bump_dlq(execution, existing, trace).await?;
                self.machine
                    .emit(
                        execution_id,
                        EventName::WorkflowResume,
                        json!({ "next_step_index": execution.next_step_index() }),
                        false,
                        trace,
                    )
                    .await?;
                self.machine
                    .enqueue_step(execution_id, execution.next_step_index(), None, trace)
                    .await?;
                result.resumed += 1;
            }
        }
        Ok(())
    }

    /// Upsert the DLQ entry, preserving the original detection time so
    /// the index stays oldest-first.
    async fn bump_dlq(
        &self,
        execution: &Execution,
        existing: Option<DlqEntry>,
        _trace: TraceContext,
    ) -> Result<(), EngineError> {
        let entry = DlqEntry {
            execution_id: execution.execution_id,
            detected_at: existing
                .as_ref()
                .map(|e| e.detected_at)
                .unwrap_or_else(Utc::now),
            attempts: existing.map(|e| e.attempts).unwrap_or(0) + 1,
            last_status: execution.status,
        };
        self.machine.services().repo.upsert_dlq(&entry).await?;
        Ok(())
    }
}

/// Convenience for tests and the CLI: ids of executions currently parked
/// in the DLQ, oldest first.
pub async fn dlq_execution_ids(
    machine: &WorkflowMachine,
    limit: usize,
) -> Result<Vec<Uuid>, EngineError> {
    Ok(machine
        .services()
        .repo
        .list_dlq(limit)
        .await?
        .into_iter()
        .map(|e| e.execution_id)
        .collect())
}
