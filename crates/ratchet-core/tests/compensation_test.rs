//! Mid-saga failure, LIFO unwind, and partial-compensation escalation.

mod common;

use serde_json::json;
use uuid::Uuid;

use ratchet_core::events::EventName;
use ratchet_core::machine::StepOutcome;
use ratchet_core::messages::{FailureReason, user_friendly_message};
use ratchet_core::trace::TraceContext;
use ratchet_store::models::{ExecutionStatus, Plan};

use common::{Behavior, Harness, ScriptedTool, intent, journal, ok_simple, step};

/// S3 plan, with tool names that stay clear of the risk gate so the
/// failure path is exercised directly.
fn itinerary_plan() -> Plan {
    Plan {
        steps: vec![
            step("s0", 0, "reserve_room", &[]),
            step("s1", 1, "collect_deposit", &["s0"]),
            step("s2", 2, "send_itinerary", &["s1"]),
        ],
    }
}

#[tokio::test]
async fn s3_mid_saga_failure_unwinds_and_fails() {
    let journal = journal();
    let reserve = ScriptedTool::new(
        "reserve_room",
        Behavior::SucceedWithCompensation {
            tool: "release_room".to_string(),
            output: json!({ "room": 412 }),
        },
        journal.clone(),
    );
    let deposit = ScriptedTool::new(
        "collect_deposit",
        Behavior::Fail("PAYMENT_FAILED: card declined".to_string()),
        journal.clone(),
    );
    let itinerary = ScriptedTool::new("send_itinerary", ok_simple(), journal.clone());
    let release = ScriptedTool::new("release_room", ok_simple(), journal.clone());
    let harness = Harness::new(vec![reserve, deposit, itinerary.clone(), release.clone()]);

    let execution_id = Uuid::new_v4();
    harness
        .machine
        .accept(
            execution_id,
            intent("reservation", 0.9),
            itinerary_plan(),
            TraceContext::new(),
        )
        .await
        .unwrap();

    let outcomes = harness.drive(10).await;
    assert!(matches!(
        outcomes.last(),
        Some(StepOutcome::CompensationFinished {
            compensated: 1,
            partial: false,
        })
    ));

    // The registered compensation ran; the remaining step never did.
    assert_eq!(release.call_count(), 1);
    assert_eq!(itinerary.call_count(), 0);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["reserve_room", "collect_deposit", "release_room"]
    );

    let execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.compensations_registered.is_empty());

    // The surfaced failure is the friendly payment message.
    let error = execution.error.unwrap();
    assert_eq!(error.code, "PAYMENT_FAILED");
    assert_eq!(
        error.message,
        user_friendly_message(FailureReason::PaymentFailed)
    );

    let names = harness.event_names();
    assert!(names.contains(&EventName::CompensationStarted));
    assert!(names.contains(&EventName::CompensationCompleted));
    assert!(names.contains(&EventName::ExecutionFailed));
}

#[tokio::test]
async fn full_unwind_pops_compensations_in_lifo_order() {
    let journal = journal();
    let book_flight = ScriptedTool::new(
        "book_flight",
        Behavior::SucceedWithCompensation {
            tool: "cancel_flight".to_string(),
            output: json!({}),
        },
        journal.clone(),
    );
    let book_hotel = ScriptedTool::new(
        "book_hotel",
        Behavior::SucceedWithCompensation {
            tool: "cancel_hotel".to_string(),
            output: json!({}),
        },
        journal.clone(),
    );
    let book_car = ScriptedTool::new(
        "book_car",
        Behavior::SucceedWithCompensation {
            tool: "cancel_car".to_string(),
            output: json!({}),
        },
        journal.clone(),
    );
    let settle = ScriptedTool::new(
        "settle_invoice",
        Behavior::Fail("PAYMENT_FAILED: insufficient funds".to_string()),
        journal.clone(),
    );
    let cancel_flight = ScriptedTool::new("cancel_flight", ok_simple(), journal.clone());
    let cancel_hotel = ScriptedTool::new("cancel_hotel", ok_simple(), journal.clone());
    let cancel_car = ScriptedTool::new("cancel_car", ok_simple(), journal.clone());

    let harness = Harness::new(vec![
        book_flight,
        book_hotel,
        book_car,
        settle,
        cancel_flight,
        cancel_hotel,
        cancel_car,
    ]);

    let plan = Plan {
        steps: vec![
            step("s0", 0, "book_flight", &[]),
            step("s1", 1, "book_hotel", &["s0"]),
            step("s2", 2, "book_car", &["s1"]),
            step("s3", 3, "settle_invoice", &["s2"]),
        ],
    };
    let execution_id = Uuid::new_v4();
    harness
        .machine
        .accept(execution_id, intent("trip", 0.9), plan, TraceContext::new())
        .await
        .unwrap();

    let outcomes = harness.drive(10).await;
    assert!(matches!(
        outcomes.last(),
        Some(StepOutcome::CompensationFinished {
            compensated: 3,
            partial: false,
        })
    ));

    // Unwind order is the reverse of registration order.
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "book_flight",
            "book_hotel",
            "book_car",
            "settle_invoice",
            "cancel_car",
            "cancel_hotel",
            "cancel_flight",
        ]
    );

    let execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.compensations_registered.is_empty());
    assert_eq!(execution.context["compensation_status"], json!("COMPENSATED"));
}

#[tokio::test]
async fn partial_compensation_escalates_then_reconciler_finishes_the_unwind() {
    let journal = journal();
    let reserve = ScriptedTool::new(
        "reserve_room",
        Behavior::SucceedWithCompensation {
            tool: "release_room".to_string(),
            output: json!({}),
        },
        journal.clone(),
    );
    let deposit = ScriptedTool::new(
        "collect_deposit",
        Behavior::Fail("PAYMENT_FAILED: card declined".to_string()),
        journal.clone(),
    );
    let itinerary = ScriptedTool::new("send_itinerary", ok_simple(), journal.clone());
    // The compensation itself fails once, then succeeds.
    let release = ScriptedTool::new(
        "release_room",
        Behavior::FailTimes {
            n: 1,
            error: "connection refused".to_string(),
            then: json!({}),
        },
        journal.clone(),
    );
    let harness = Harness::new(vec![reserve, deposit, itinerary, release.clone()]);

    let execution_id = Uuid::new_v4();
    harness
        .machine
        .accept(
            execution_id,
            intent("reservation", 0.9),
            itinerary_plan(),
            TraceContext::new(),
        )
        .await
        .unwrap();

    let outcomes = harness.drive(10).await;
    assert!(matches!(
        outcomes.last(),
        Some(StepOutcome::CompensationFinished {
            compensated: 0,
            partial: true,
        })
    ));

    let execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    // The unwind is stuck, not abandoned: the stack still holds the
    // entry and the saga stays in COMPENSATING for recovery.
    assert_eq!(execution.status, ExecutionStatus::Compensating);
    assert_eq!(execution.compensations_registered.len(), 1);
    assert_eq!(
        execution.context["compensation_status"],
        json!("PARTIALLY_COMPENSATED")
    );
    assert!(
        !harness
            .machine
            .services()
            .repo
            .list_dlq(10)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        harness
            .event_names()
            .contains(&EventName::SagaManualInterventionRequired)
    );

    // A later delivery re-enters the unwind and finishes it.
    let outcome = harness
        .machine
        .execute_step(execution_id, None, TraceContext::new())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::CompensationFinished {
            compensated: 1,
            partial: false,
        }
    ));
    assert_eq!(release.call_count(), 2);

    let execution = harness
        .machine
        .services()
        .repo
        .load(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.compensations_registered.is_empty());
}
