//! The execution status transition table.
//!
//! Every persisted status change flows through [`transition`]; a change
//! outside the table is an [`EngineError::IllegalTransition`] -- a
//! programming error that aborts the invocation rather than being masked.
//! Terminal statuses are absorbing.

use chrono::Utc;

use ratchet_store::models::{Execution, ExecutionStatus};

use crate::error::EngineError;

/// Whether `from -> to` is an edge of the transition graph.
pub fn is_allowed(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
        (from, to),
        (Received, Parsing)
            | (Parsing, Planning)
            | (Planning, Planned)
            | (Planned, Executing)
            | (Executing, Planning)
            | (Executing, AwaitingConfirmation)
            | (Executing, Suspended)
            | (Executing, Compensating)
            | (Executing, Completed)
            | (AwaitingConfirmation, Executing)
            | (AwaitingConfirmation, Suspended)
            | (Suspended, Executing)
            | (Suspended, AwaitingConfirmation)
            // Any non-terminal status may fail, time out, or be cancelled.
            | (
                Received | Parsing | Planning | Planned | Executing
                | AwaitingConfirmation | Suspended | Compensating,
                Failed | Timeout | Cancelled,
            )
    )
}

/// Apply a transition to an execution, stamping `completed_at` on entry to
/// a terminal status.
pub fn transition(execution: &mut Execution, to: ExecutionStatus) -> Result<(), EngineError> {
    let from = execution.status;
    if !is_allowed(from, to) {
        return Err(EngineError::IllegalTransition { from, to });
    }
    execution.status = to;
    if to.is_terminal() {
        execution.completed_at = Some(Utc::now());
    }
    execution.touch();
    tracing::debug!(
        execution_id = %execution.execution_id,
        from = %from,
        to = %to,
        "status transition"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use uuid::Uuid;

    use ratchet_store::models::{Intent, Plan};

    use super::*;

    const ALL: [ExecutionStatus; 12] = [
        ExecutionStatus::Received,
        ExecutionStatus::Parsing,
        ExecutionStatus::Planning,
        ExecutionStatus::Planned,
        ExecutionStatus::Executing,
        ExecutionStatus::AwaitingConfirmation,
        ExecutionStatus::Suspended,
        ExecutionStatus::Compensating,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Timeout,
        ExecutionStatus::Cancelled,
    ];

    #[test]
    fn terminal_statuses_are_absorbing() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !is_allowed(from, to),
                    "terminal {from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn every_non_terminal_status_can_fail() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(is_allowed(from, ExecutionStatus::Failed));
            assert!(is_allowed(from, ExecutionStatus::Timeout));
            assert!(is_allowed(from, ExecutionStatus::Cancelled));
        }
    }

    #[test]
    fn happy_path_edges() {
        assert!(is_allowed(ExecutionStatus::Received, ExecutionStatus::Parsing));
        assert!(is_allowed(ExecutionStatus::Parsing, ExecutionStatus::Planning));
        assert!(is_allowed(ExecutionStatus::Planning, ExecutionStatus::Planned));
        assert!(is_allowed(ExecutionStatus::Planned, ExecutionStatus::Executing));
        assert!(is_allowed(ExecutionStatus::Executing, ExecutionStatus::Completed));
    }

    #[test]
    fn replan_gate_and_suspension_edges() {
        use ExecutionStatus::*;
        assert!(is_allowed(Executing, Planning));
        assert!(is_allowed(Executing, AwaitingConfirmation));
        assert!(is_allowed(Executing, Suspended));
        assert!(is_allowed(Executing, Compensating));
        assert!(is_allowed(AwaitingConfirmation, Executing));
        assert!(is_allowed(AwaitingConfirmation, Suspended));
        assert!(is_allowed(Suspended, Executing));
        assert!(is_allowed(Suspended, AwaitingConfirmation));
    }

    #[test]
    fn forbidden_edges() {
        use ExecutionStatus::*;
        assert!(!is_allowed(Received, Executing));
        assert!(!is_allowed(Planned, Compensating));
        assert!(!is_allowed(Compensating, Executing));
        assert!(!is_allowed(Compensating, Completed));
        assert!(!is_allowed(AwaitingConfirmation, Completed));
        assert!(!is_allowed(Suspended, Compensating));
        assert!(!is_allowed(Planning, Executing));
    }

    #[test]
    fn transition_stamps_completed_at_on_terminal() {
        let mut execution = Execution::new(
            Uuid::new_v4(),
            Intent {
                raw_text: String::new(),
                intent_type: String::new(),
                confidence: 1.0,
                parameters: Map::new(),
            },
            Plan::default(),
        );
        transition(&mut execution, ExecutionStatus::Executing).unwrap();
        assert!(execution.completed_at.is_none());

        transition(&mut execution, ExecutionStatus::Completed).unwrap();
        assert!(execution.completed_at.is_some());

        // Absorbing: any further transition is illegal.
        let err = transition(&mut execution, ExecutionStatus::Executing).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
    }
}
