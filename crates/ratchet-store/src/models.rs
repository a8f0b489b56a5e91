//! Persisted data model for executions, steps, confirmations, heartbeats,
//! dead-letter entries, and version fingerprints.
//!
//! Everything here serializes as JSON into the state store. Timestamps are
//! ISO-8601 UTC, ids are UUIDv4. Execution statuses use their wire casing
//! (`AWAITING_CONFIRMATION`); step statuses are lowercase.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Received,
    Parsing,
    Planning,
    Planned,
    Executing,
    AwaitingConfirmation,
    Suspended,
    Compensating,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::Parsing => "PARSING",
            Self::Planning => "PLANNING",
            Self::Planned => "PLANNED",
            Self::Executing => "EXECUTING",
            Self::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Self::Suspended => "SUSPENDED",
            Self::Compensating => "COMPENSATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(Self::Received),
            "PARSING" => Ok(Self::Parsing),
            "PLANNING" => Ok(Self::Planning),
            "PLANNED" => Ok(Self::Planned),
            "EXECUTING" => Ok(Self::Executing),
            "AWAITING_CONFIRMATION" => Ok(Self::AwaitingConfirmation),
            "SUSPENDED" => Ok(Self::Suspended),
            "COMPENSATING" => Ok(Self::Compensating),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    AwaitingConfirmation,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingConfirmation => "awaiting_confirmation",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Pending,
    Checked,
    Recovered,
    Escalated,
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Checked => "checked",
            Self::Recovered => "recovered",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Intent & plan
// ---------------------------------------------------------------------------

/// The parsed user intent. Opaque to the engine: it is carried through for
/// risk scoring and failover matching, never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub raw_text: String,
    pub intent_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// One step of a plan produced by the upstream planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Planner-assigned step id, unique within the plan.
    pub id: String,
    /// Position in the plan's step sequence.
    pub index: usize,
    /// Name of the tool to invoke.
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Ids of steps that must be completed before this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Per-step tool deadline in milliseconds.
    pub timeout_ms: u64,
    #[serde(default)]
    pub estimated_tokens: u32,
}

/// An ordered sequence of plan steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn step_by_id(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Validate the structural invariants: indexes are 0..n in order, step
    /// ids are unique, and dependencies reference known steps.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.index != i {
                return Err(PlanValidationError::IndexMismatch {
                    step_id: step.id.clone(),
                    expected: i,
                    actual: step.index,
                });
            }
            if self.steps.iter().filter(|s| s.id == step.id).count() > 1 {
                return Err(PlanValidationError::DuplicateStepId(step.id.clone()));
            }
            for dep in &step.dependencies {
                if self.step_by_id(dep).is_none() {
                    return Err(PlanValidationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Structural plan defects rejected at acceptance time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanValidationError {
    #[error("step {step_id} has index {actual}, expected {expected}")]
    IndexMismatch {
        step_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate step id {0}")]
    DuplicateStepId(String),
    #[error("step {step_id} depends on unknown step {dependency}")]
    UnknownDependency { step_id: String, dependency: String },
}

// ---------------------------------------------------------------------------
// Step state & compensation
// ---------------------------------------------------------------------------

/// Mutable per-step execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// A registered reversing action, pushed when a side-effecting step
/// completes and popped LIFO during unwind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub step_id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Structured execution-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Informational token accounting carried on the execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// The saga document, keyed by `task:{execution_id}`.
///
/// Mutated only by the execution-lock holder; every status change flows
/// through the machine's transition table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub intent: Intent,
    pub plan: Plan,
    pub step_states: Vec<StepState>,
    /// Freeform context: trace correlation, compensation status markers,
    /// checkpoint annotations.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// LIFO stack, bottom first. Pushed on successful side-effecting steps.
    #[serde(default)]
    pub compensations_registered: Vec<CompensationEntry>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create a new execution in `PLANNED` with one pending step state per
    /// plan step.
    pub fn new(execution_id: Uuid, intent: Intent, plan: Plan) -> Self {
        let now = Utc::now();
        let step_states = plan.steps.iter().map(|s| StepState::new(&s.id)).collect();
        Self {
            execution_id,
            status: ExecutionStatus::Planned,
            intent,
            plan,
            step_states,
            context: Map::new(),
            compensations_registered: Vec::new(),
            token_usage: TokenUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_state_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.step_states.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Index of the next step that has not completed, i.e. the count of
    /// completed or skipped steps. Heartbeat progress checks compare
    /// against this.
    pub fn next_step_index(&self) -> usize {
        self.step_states
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
            .count()
    }

    /// Whether every step has completed (or been skipped).
    pub fn all_steps_done(&self) -> bool {
        self.next_step_index() == self.plan.steps.len()
    }

    /// Bump `updated_at`. Call before every persist.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Assessed risk attached to a confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub score: f64,
}

/// Coarse risk band derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// A pending human confirmation, stored under both `confirmation:{token}`
/// and `confirmation:exec:{execution_id}` with a 15-minute TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub token: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub risk: RiskAssessment,
    /// Actor that requested the confirmation; a resume must present the
    /// same actor id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lock, heartbeat, DLQ, fingerprint
// ---------------------------------------------------------------------------

/// Ownership record stored under a lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl_sec: u64,
    /// Human-readable label of the operation holding the lock.
    pub operation: String,
}

impl LockRecord {
    /// A lock is stale once its TTL plus the grace window has elapsed.
    pub fn is_stale(&self, grace_sec: u64, now: DateTime<Utc>) -> bool {
        let held_for = now.signed_duration_since(self.acquired_at);
        held_for.num_seconds() > (self.ttl_sec + grace_sec) as i64
    }
}

/// Scheduled "did the saga advance?" check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub execution_id: Uuid,
    pub expected_next_step_index: usize,
    pub scheduled_at: DateTime<Utc>,
    pub check_at: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub attempts: u32,
}

/// Dead-letter record for a stalled saga, indexed in `dlq:index` by
/// detection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub execution_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_status: ExecutionStatus,
}

/// One declared tool parameter, as hashed into the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
}

/// Hash plus field list for one tool's schema. The field list is kept so
/// drift on resume can be classified, not merely detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFingerprint {
    pub hash: String,
    pub fields: Vec<FieldSpec>,
}

/// Snapshot of orchestrator and tool-schema versions captured at yield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionFingerprint {
    pub orchestrator_version: String,
    pub tools: BTreeMap<String, ToolFingerprint>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, index: usize, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            index,
            tool_name: format!("tool_{id}"),
            parameters: Map::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            requires_confirmation: false,
            timeout_ms: 8_500,
            estimated_tokens: 0,
        }
    }

    fn intent() -> Intent {
        Intent {
            raw_text: "book a table".to_string(),
            intent_type: "reservation".to_string(),
            confidence: 0.9,
            parameters: Map::new(),
        }
    }

    #[test]
    fn execution_status_wire_casing() {
        let json = serde_json::to_string(&ExecutionStatus::AwaitingConfirmation).unwrap();
        assert_eq!(json, "\"AWAITING_CONFIRMATION\"");
        let parsed: ExecutionStatus = serde_json::from_str("\"COMPENSATING\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::Compensating);
    }

    #[test]
    fn execution_status_display_fromstr_roundtrip() {
        for status in [
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
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("COMPLETE".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Executing.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
    }

    #[test]
    fn step_status_wire_casing() {
        let json = serde_json::to_string(&StepStatus::AwaitingConfirmation).unwrap();
        assert_eq!(json, "\"awaiting_confirmation\"");
    }

    #[test]
    fn plan_validation_accepts_well_formed() {
        let plan = Plan {
            steps: vec![step("a", 0, &[]), step("b", 1, &["a"]), step("c", 2, &["b"])],
        };
        plan.validate().unwrap();
    }

    #[test]
    fn plan_validation_rejects_index_mismatch() {
        let plan = Plan {
            steps: vec![step("a", 0, &[]), step("b", 2, &[])],
        };
        assert!(matches!(
            plan.validate(),
            Err(PlanValidationError::IndexMismatch { .. })
        ));
    }

    #[test]
    fn plan_validation_rejects_duplicate_ids() {
        let plan = Plan {
            steps: vec![step("a", 0, &[]), step("a", 1, &[])],
        };
        assert!(matches!(
            plan.validate(),
            Err(PlanValidationError::DuplicateStepId(_))
        ));
    }

    #[test]
    fn plan_validation_rejects_unknown_dependency() {
        let plan = Plan {
            steps: vec![step("a", 0, &["ghost"])],
        };
        assert!(matches!(
            plan.validate(),
            Err(PlanValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn new_execution_has_pending_step_per_plan_step() {
        let plan = Plan {
            steps: vec![step("a", 0, &[]), step("b", 1, &["a"])],
        };
        let exec = Execution::new(Uuid::new_v4(), intent(), plan);
        assert_eq!(exec.status, ExecutionStatus::Planned);
        assert_eq!(exec.step_states.len(), 2);
        assert!(
            exec.step_states
                .iter()
                .all(|s| s.status == StepStatus::Pending)
        );
        assert_eq!(exec.next_step_index(), 0);
        assert!(!exec.all_steps_done());
    }

    #[test]
    fn next_step_index_counts_completed_and_skipped() {
        let plan = Plan {
            steps: vec![step("a", 0, &[]), step("b", 1, &[]), step("c", 2, &[])],
        };
        let mut exec = Execution::new(Uuid::new_v4(), intent(), plan);
        exec.step_state_mut("a").unwrap().status = StepStatus::Completed;
        exec.step_state_mut("b").unwrap().status = StepStatus::Skipped;
        assert_eq!(exec.next_step_index(), 2);
        exec.step_state_mut("c").unwrap().status = StepStatus::Completed;
        assert!(exec.all_steps_done());
    }

    #[test]
    fn lock_staleness_respects_grace() {
        let lock = LockRecord {
            key: "exec:x:lock".to_string(),
            owner: Uuid::new_v4(),
            acquired_at: Utc::now() - chrono::Duration::seconds(40),
            ttl_sec: 30,
            operation: "execute_step".to_string(),
        };
        // 40s held, 30s ttl + 5s grace = 35s: stale.
        assert!(lock.is_stale(5, Utc::now()));
        // With a 15s grace the lock is still within its window.
        assert!(!lock.is_stale(15, Utc::now()));
    }

    #[test]
    fn execution_document_roundtrip() {
        let plan = Plan {
            steps: vec![step("a", 0, &[])],
        };
        let mut exec = Execution::new(Uuid::new_v4(), intent(), plan);
        exec.compensations_registered.push(CompensationEntry {
            step_id: "a".to_string(),
            tool: "release_room".to_string(),
            parameters: Map::new(),
        });
        let json = serde_json::to_string(&exec).unwrap();
        let back: Execution = serde_json::from_str(&json).unwrap();
        assert_eq!(back.execution_id, exec.execution_id);
        assert_eq!(back.compensations_registered.len(), 1);
        assert_eq!(back.compensations_registered[0].tool, "release_room");
    }
}
