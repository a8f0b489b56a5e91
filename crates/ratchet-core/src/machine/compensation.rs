//! LIFO compensation unwind.
//!
//! Compensations are a stack of small records, never a graph, so the
//! unwind terminates by construction: each round pops the most recent
//! entry and invokes its compensation tool with the normal invoker
//! semantics. A failed compensation stops the unwind where it stands --
//! the stack keeps the remaining entries, the context is marked
//! `PARTIALLY_COMPENSATED`, and the saga escalates for a human. A fully
//! unwound saga lands in `FAILED` with an empty stack.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use ratchet_store::models::{Execution, ExecutionStatus};

use crate::error::EngineError;
use crate::events::EventName;
use crate::invoker::InvocationContext;
use crate::trace::TraceContext;

use super::transitions::transition;
use super::{StepOutcome, WorkflowMachine};

impl WorkflowMachine {
    /// Enter the unwind from a failed step: EXECUTING -> COMPENSATING,
    /// then run it.
    pub(crate) async fn start_compensation(
        &self,
        execution: &mut Execution,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        transition(execution, ExecutionStatus::Compensating)?;
        self.services.repo.save(execution).await?;
        self.emit(
            execution.execution_id,
            EventName::CompensationStarted,
            json!({ "registered": execution.compensations_registered.len() }),
            true,
            trace,
        )
        .await?;
        self.run_compensation(execution, trace).await
    }

    /// Pop and invoke compensations while any remain. Also the re-entry
    /// point when the reconciler retries a stalled unwind.
    pub(crate) async fn run_compensation(
        &self,
        execution: &mut Execution,
        trace: TraceContext,
    ) -> Result<StepOutcome, EngineError> {
        debug_assert_eq!(execution.status, ExecutionStatus::Compensating);
        let execution_id = execution.execution_id;
        let mut compensated = 0usize;

        while let Some(entry) = execution.compensations_registered.last().cloned() {
            let ctx = InvocationContext {
                execution_id,
                step_id: entry.step_id.clone(),
                cancel: CancellationToken::new(),
                trace,
            };
            let result = self
                .services
                .invoker
                .invoke(
                    &entry.tool,
                    entry.parameters.clone(),
                    self.services.config.step_timeout(),
                    ctx,
                )
                .await;

            if !result.success {
                let error = result.error.unwrap_or_else(|| "unknown".to_string());
                tracing::error!(
                    execution_id = %execution_id,
                    step_id = %entry.step_id,
                    tool = %entry.tool,
                    error = %error,
                    "compensation failed, stopping unwind"
                );
                execution.context.insert(
                    "compensation_status".to_string(),
                    json!("PARTIALLY_COMPENSATED"),
                );
                execution.touch();
                self.services.repo.save(execution).await?;
                self.escalate(execution, Some(&entry.step_id), trace).await?;
                return Ok(StepOutcome::CompensationFinished {
                    compensated,
                    partial: true,
                });
            }

            execution.compensations_registered.pop();
            compensated += 1;
            execution.touch();
            // Persist after every pop so a crash mid-unwind resumes where
            // it stopped.
            self.services.repo.save(execution).await?;
            tracing::info!(
                execution_id = %execution_id,
                step_id = %entry.step_id,
                tool = %entry.tool,
                "compensation applied"
            );
        }

        execution
            .context
            .insert("compensation_status".to_string(), json!("COMPENSATED"));
        transition(execution, ExecutionStatus::Failed)?;
        self.services.repo.save(execution).await?;
        self.emit(
            execution_id,
            EventName::CompensationCompleted,
            json!({ "compensated": compensated }),
            true,
            trace,
        )
        .await?;
        self.emit(
            execution_id,
            EventName::ExecutionFailed,
            json!({
                "code": execution.error.as_ref().map(|e| e.code.clone()),
                "message": execution.error.as_ref().map(|e| e.message.clone()),
            }),
            true,
            trace,
        )
        .await?;
        tracing::info!(
            execution_id = %execution_id,
            compensated,
            "saga fully compensated"
        );
        Ok(StepOutcome::CompensationFinished {
            compensated,
            partial: false,
        })
    }
}
