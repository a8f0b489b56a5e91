//! Stalled-saga detection, recovery, and escalation (S5).

mod common;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use ratchet_core::events::EventName;
use ratchet_core::reconcile::Reconciler;
use ratchet_core::trace::TraceContext;
use ratchet_store::models::{ExecutionStatus, StepStatus};

use common::{Behavior, Harness, ScriptedTool, intent, journal, linear_plan, ok_simple};

/// Park an execution mid-saga: step 0 completed, step 1 pending, last
/// activity six minutes ago.
async fn park_stalled(harness: &Harness) -> Uuid {
    let execution_id = Uuid::new_v4();
    let mut execution = harness
        .machine
        .accept(
            execution_id,
            intent("search", 0.9),
            linear_plan(&["a", "b"]),
            TraceContext::new(),
        )
        .await
        .unwrap();
    harness.queue.drain();

    execution.status = ExecutionStatus::Executing;
    execution.step_state_mut("s0").unwrap().status = StepStatus::Completed;
    execution.updated_at = Utc::now() - chrono::Duration::minutes(6);
    harness.machine.services().repo.save(&execution).await.unwrap();
    execution_id
}

#[tokio::test]
async fn s5_stalled_saga_is_resumed_then_escalated_after_max_attempts() {
    let journal = journal();
    let harness = Harness::new(vec![
        ScriptedTool::new("a", ok_simple(), journal.clone()),
        ScriptedTool::new("b", ok_simple(), journal),
    ]);
    let execution_id = park_stalled(&harness).await;
    let reconciler = Reconciler::new(harness.machine.clone());

    // First pass: detected, WORKFLOW_RESUME emitted, re-enqueued from
    // the pending index, DLQ attempt counted.
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.stalled, 1);
    assert_eq!(result.resumed, 1);
    assert_eq!(result.escalated, 0);

    let resume = harness
        .queue
        .drain()
        .into_iter()
        .find(|m| m.url.ends_with("/engine/execute-step"))
        .expect("recovery must re-enqueue execute-step");
    assert_eq!(resume.body["start_step_index"], json!(1));

    let dlq = harness
        .machine
        .services()
        .repo
        .load_dlq(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dlq.attempts, 1);
    assert!(harness.event_names().contains(&EventName::WorkflowResume));

    // The saga keeps not progressing; passes two and three burn the
    // remaining recovery budget.
    for expected_attempts in [2, 3] {
        let result = reconciler.run_once(TraceContext::new()).await.unwrap();
        assert_eq!(result.resumed, 1);
        let dlq = harness
            .machine
            .services()
            .repo
            .load_dlq(execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dlq.attempts, expected_attempts);
    }
    harness.queue.drain();
    harness.collected_events();

    // Budget spent: one final alert, no further re-enqueue.
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.escalated, 1);
    assert_eq!(result.resumed, 0);
    assert!(
        harness
            .event_names()
            .contains(&EventName::SagaManualInterventionRequired)
    );
    assert!(
        harness
            .queue
            .drain()
            .iter()
            .all(|m| !m.url.ends_with("/engine/execute-step")),
        "no recovery may fire after escalation"
    );

    // And after that: silence.
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.escalated, 0);
    assert_eq!(result.resumed, 0);
    assert_eq!(result.skipped, 1);
    assert!(harness.queue.drain().is_empty());
}

#[tokio::test]
async fn stalled_sagas_are_recovered_oldest_first() {
    let journal = journal();
    let harness = Harness::new(vec![
        ScriptedTool::new("a", ok_simple(), journal.clone()),
        ScriptedTool::new("b", ok_simple(), journal),
    ]);

    // Three stalled sagas, parked in the reverse of their age so that
    // key order cannot accidentally match activity order.
    let mut ids_oldest_first = Vec::new();
    for minutes_ago in [18i64, 12, 6] {
        let execution_id = Uuid::new_v4();
        let mut execution = harness
            .machine
            .accept(
                execution_id,
                intent("search", 0.9),
                linear_plan(&["a", "b"]),
                TraceContext::new(),
            )
            .await
            .unwrap();
        execution.status = ExecutionStatus::Executing;
        execution.step_state_mut("s0").unwrap().status = StepStatus::Completed;
        execution.updated_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        harness.machine.services().repo.save(&execution).await.unwrap();
        ids_oldest_first.push((minutes_ago, execution_id));
    }
    ids_oldest_first.sort_by_key(|(minutes_ago, _)| -minutes_ago);
    harness.queue.drain();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.stalled, 3);
    assert_eq!(result.resumed, 3);

    // The recovery re-enqueues come out in age order, oldest first.
    let recovered: Vec<Uuid> = harness
        .queue
        .drain()
        .into_iter()
        .filter(|m| m.url.ends_with("/engine/execute-step"))
        .map(|m| serde_json::from_value(m.body["execution_id"].clone()).unwrap())
        .collect();
    let expected: Vec<Uuid> = ids_oldest_first.iter().map(|(_, id)| *id).collect();
    assert_eq!(recovered, expected);
}

#[tokio::test]
async fn terminal_executions_are_never_touched() {
    let journal = journal();
    let harness = Harness::new(vec![ScriptedTool::new("a", ok_simple(), journal)]);

    let execution_id = Uuid::new_v4();
    let mut execution = harness
        .machine
        .accept(
            execution_id,
            intent("search", 0.9),
            linear_plan(&["a"]),
            TraceContext::new(),
        )
        .await
        .unwrap();
    execution.status = ExecutionStatus::Completed;
    execution.completed_at = Some(Utc::now());
    execution.updated_at = Utc::now() - chrono::Duration::hours(2);
    harness.machine.services().repo.save(&execution).await.unwrap();
    harness.queue.drain();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.scanned, 1);
    assert_eq!(result.stalled, 0);
    assert!(harness.queue.drain().is_empty());

    let reloaded = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn recently_active_sagas_are_left_alone() {
    let journal = journal();
    let harness = Harness::new(vec![
        ScriptedTool::new("a", ok_simple(), journal.clone()),
        ScriptedTool::new("b", ok_simple(), journal),
    ]);

    let execution_id = Uuid::new_v4();
    harness
        .machine
        .accept(
            execution_id,
            intent("search", 0.9),
            linear_plan(&["a", "b"]),
            TraceContext::new(),
        )
        .await
        .unwrap();
    harness.queue.drain();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.scanned, 1);
    assert_eq!(result.stalled, 0);
}

#[tokio::test]
async fn transient_failed_step_is_repaired_and_resumed() {
    let journal = journal();
    let harness = Harness::new(vec![
        ScriptedTool::new("a", ok_simple(), journal.clone()),
        ScriptedTool::new("b", ok_simple(), journal),
    ]);
    let execution_id = park_stalled(&harness).await;

    // Step 1 failed with a transient error and was left behind.
    let mut execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    {
        let state = execution.step_state_mut("s1").unwrap();
        state.status = StepStatus::Failed;
        state.attempts = 1;
        state.error = Some("TIMEOUT: b exceeded 2000ms".to_string());
    }
    execution.updated_at = Utc::now() - chrono::Duration::minutes(6);
    harness.machine.services().repo.save(&execution).await.unwrap();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.repairs_applied, 1);
    assert_eq!(result.resumed, 1);

    let repaired = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        repaired.step_state("s1").unwrap().status,
        StepStatus::Pending
    );
    assert!(
        harness
            .queue
            .drain()
            .iter()
            .any(|m| m.url.ends_with("/engine/execute-step"))
    );
}

#[tokio::test]
async fn non_retryable_failed_step_escalates_instead_of_repairing() {
    let journal = journal();
    let harness = Harness::new(vec![
        ScriptedTool::new("a", ok_simple(), journal.clone()),
        ScriptedTool::new("b", ok_simple(), journal),
    ]);
    let execution_id = park_stalled(&harness).await;

    let mut execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    {
        let state = execution.step_state_mut("s1").unwrap();
        state.status = StepStatus::Failed;
        state.error = Some("PAYMENT_FAILED: card declined".to_string());
    }
    execution.updated_at = Utc::now() - chrono::Duration::minutes(6);
    harness.machine.services().repo.save(&execution).await.unwrap();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.repairs_applied, 0);
    assert_eq!(result.escalated, 1);
    assert!(
        harness
            .event_names()
            .contains(&EventName::SagaManualInterventionRequired)
    );
}

#[tokio::test]
async fn stalled_unwind_gets_a_compensation_retry() {
    let journal = journal();
    let release = ScriptedTool::new("release_room", ok_simple(), journal.clone());
    let harness = Harness::new(vec![
        ScriptedTool::new(
            "reserve_room",
            Behavior::SucceedWithCompensation {
                tool: "release_room".to_string(),
                output: json!({}),
            },
            journal.clone(),
        ),
        ScriptedTool::new("b", ok_simple(), journal.clone()),
        release.clone(),
    ]);
    let execution_id = Uuid::new_v4();
    let mut execution = harness
        .machine
        .accept(
            execution_id,
            intent("reservation", 0.9),
            linear_plan(&["reserve_room", "b"]),
            TraceContext::new(),
        )
        .await
        .unwrap();
    harness.queue.drain();

    // A crashed unwind: compensating, one entry left, stale.
    execution.status = ExecutionStatus::Compensating;
    execution.compensations_registered.push(
        ratchet_store::models::CompensationEntry {
            step_id: "s0".to_string(),
            tool: "release_room".to_string(),
            parameters: serde_json::Map::new(),
        },
    );
    execution.updated_at = Utc::now() - chrono::Duration::minutes(6);
    harness.machine.services().repo.save(&execution).await.unwrap();

    let reconciler = Reconciler::new(harness.machine.clone());
    let result = reconciler.run_once(TraceContext::new()).await.unwrap();
    assert_eq!(result.compensation_retries, 1);
    assert!(harness.event_names().contains(&EventName::CompensationRetry));

    // Delivering the re-enqueued message finishes the unwind.
    let outcomes = harness.drive(5).await;
    assert!(!outcomes.is_empty());
    assert_eq!(release.call_count(), 1);
    let reloaded = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Failed);
}
