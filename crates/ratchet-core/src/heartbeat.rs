//! "Did the saga advance?" checks.
//!
//! Every yield arms a deferred webhook (default 30 s) back into the engine
//! at `/engine/heartbeat-check`. The check compares the saga's progress
//! against the index expected at arm time: progressed or terminal clears
//! the heartbeat; stalled re-enqueues the step as a recovery attempt; too
//! many recoveries without progress escalates to the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ratchet_store::ExecutionRepository;
use ratchet_store::models::{DlqEntry, HeartbeatRecord, HeartbeatStatus};

use crate::error::EngineError;
use crate::events::{EventBus, EventName, PublishOptions};
use crate::queue::{QueueDriver, QueueMessage};
use crate::trace::TraceContext;

/// Outcome of one heartbeat check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatVerdict {
    /// The saga progressed (or finished); the heartbeat is cleared.
    Cleared,
    /// No progress; the expected step was re-enqueued.
    Recovered { attempts: u32 },
    /// Recovery attempts exhausted; the saga is in the dead-letter queue.
    Escalated,
}

/// Arms and evaluates heartbeats.
#[derive(Clone)]
pub struct HeartbeatService {
    repo: ExecutionRepository,
    queue: Arc<dyn QueueDriver>,
    bus: Arc<dyn EventBus>,
    engine_base_url: String,
    delay: Duration,
    max_recovery_attempts: u32,
}

impl HeartbeatService {
    pub fn new(
        repo: ExecutionRepository,
        queue: Arc<dyn QueueDriver>,
        bus: Arc<dyn EventBus>,
        engine_base_url: impl Into<String>,
        delay: Duration,
        max_recovery_attempts: u32,
    ) -> Self {
        Self {
            repo,
            queue,
            bus,
            engine_base_url: engine_base_url.into(),
            delay,
            max_recovery_attempts,
        }
    }

    /// Arm a heartbeat expecting the saga to be at or past
    /// `expected_next_step_index` when the check fires. Attempts carry
    /// over when a heartbeat for the execution already exists.
    pub async fn arm(
        &self,
        execution_id: Uuid,
        expected_next_step_index: usize,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        let attempts = self
            .repo
            .load_heartbeat(execution_id)
            .await?
            .map(|h| h.attempts)
            .unwrap_or(0);

        let now = Utc::now();
        let record = HeartbeatRecord {
            execution_id,
            expected_next_step_index,
            scheduled_at: now,
            check_at: now
                + chrono::Duration::from_std(self.delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            status: HeartbeatStatus::Pending,
            attempts,
        };
        self.repo.save_heartbeat(&record).await?;

        let body = serde_json::json!({
            "execution_id": execution_id,
            "expected_next_index": expected_next_step_index,
        });
        self.queue
            .publish(
                QueueMessage::new(
                    format!("{}/engine/heartbeat-check", self.engine_base_url),
                    body,
                )
                .with_headers(trace.headers())
                .with_delay(self.delay),
            )
            .await?;

        tracing::debug!(
            execution_id = %execution_id,
            expected_next_step_index,
            delay_sec = self.delay.as_secs(),
            "heartbeat armed"
        );
        Ok(())
    }

    /// Evaluate a fired heartbeat.
    pub async fn check(
        &self,
        execution_id: Uuid,
        expected_next_index: usize,
        trace: TraceContext,
    ) -> Result<HeartbeatVerdict, EngineError> {
        let Some(execution) = self.repo.load(execution_id).await? else {
            // Execution gone (TTL after terminal): nothing to watch.
            self.repo.clear_heartbeat(execution_id).await?;
            return Ok(HeartbeatVerdict::Cleared);
        };

        if execution.status.is_terminal() || execution.next_step_index() >= expected_next_index {
            self.repo.clear_heartbeat(execution_id).await?;
            return Ok(HeartbeatVerdict::Cleared);
        }

        // A confirmation gate is legitimately waiting on a human, not
        // stalled; the resume path arms a fresh heartbeat.
        if matches!(
            execution.status,
            ratchet_store::models::ExecutionStatus::AwaitingConfirmation
                | ratchet_store::models::ExecutionStatus::Suspended
        ) {
            self.repo.clear_heartbeat(execution_id).await?;
            return Ok(HeartbeatVerdict::Cleared);
        }

        let mut record = self
            .repo
            .load_heartbeat(execution_id)
            .await?
            .unwrap_or(HeartbeatRecord {
                execution_id,
                expected_next_step_index: expected_next_index,
                scheduled_at: Utc::now(),
                check_at: Utc::now(),
                status: HeartbeatStatus::Pending,
                attempts: 0,
            });
        record.attempts += 1;

        if record.attempts > self.max_recovery_attempts {
            record.status = HeartbeatStatus::Escalated;
            self.repo.save_heartbeat(&record).await?;
            self.escalate(&execution, record.attempts, trace).await?;
            return Ok(HeartbeatVerdict::Escalated);
        }

        record.status = HeartbeatStatus::Recovered;
        self.repo.save_heartbeat(&record).await?;

        // Recovery: re-enter the engine from the expected index.
        let next_index = execution.next_step_index();
        let body = serde_json::json!({
            "execution_id": execution_id,
            "start_step_index": next_index,
        });
        self.queue
            .publish(
                QueueMessage::new(
                    format!("{}/engine/execute-step", self.engine_base_url),
                    body,
                )
                .with_headers(trace.headers()),
            )
            .await?;
        self.bus
            .publish(
                &format!("exec:{execution_id}"),
                EventName::HeartbeatRecovered,
                serde_json::json!({
                    "execution_id": execution_id,
                    "attempts": record.attempts,
                    "expected_next_index": expected_next_index,
                }),
                PublishOptions::unordered(trace),
            )
            .await?;

        // Re-arm so an unsuccessful recovery is noticed too.
        self.arm(execution_id, expected_next_index, trace).await?;

        tracing::warn!(
            execution_id = %execution_id,
            attempts = record.attempts,
            "heartbeat recovery triggered"
        );
        Ok(HeartbeatVerdict::Recovered {
            attempts: record.attempts,
        })
    }

    async fn escalate(
        &self,
        execution: &ratchet_store::models::Execution,
        attempts: u32,
        trace: TraceContext,
    ) -> Result<(), EngineError> {
        let entry = DlqEntry {
            execution_id: execution.execution_id,
            detected_at: Utc::now(),
            attempts,
            last_status: execution.status,
        };
        self.repo.upsert_dlq(&entry).await?;
        self.bus
            .publish(
                &format!("exec:{}", execution.execution_id),
                EventName::SagaManualInterventionRequired,
                serde_json::json!({
                    "execution_id": execution.execution_id,
                    "attempts": attempts,
                    "last_status": execution.status,
                }),
                PublishOptions::unordered(trace),
            )
            .await?;
        tracing::error!(
            execution_id = %execution.execution_id,
            attempts,
            "heartbeat recovery exhausted, saga escalated"
        );
        Ok(())
    }
}
