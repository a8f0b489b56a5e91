//! Schema-version drift detection across yield/resume boundaries.
//!
//! When a saga yields (confirmation gate, suspension), the guard snapshots
//! the orchestrator version and a fingerprint of every tool in the plan.
//! On resume it recomputes and classifies what changed:
//!
//! - missing tool or removed field: **breaking**
//! - added required field: **major**
//! - added optional field: **minor**
//! - orchestrator version change: **orchestrator-changed**
//!
//! Breaking, major, and orchestrator changes force the saga back through
//! planning with a mapping suggestion; minor drift resumes with a warning.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ratchet_store::ExecutionRepository;
use ratchet_store::models::{Plan, ToolFingerprint, VersionFingerprint};

use crate::error::EngineError;
use crate::invoker::ToolRegistry;

/// How bad the drift is. Ordered: later variants dominate earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Minor,
    Major,
    Breaking,
    OrchestratorChanged,
}

impl DriftSeverity {
    /// Whether a saga may resume under this severity.
    pub fn requires_replan(self) -> bool {
        matches!(self, Self::Major | Self::Breaking | Self::OrchestratorChanged)
    }
}

impl fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Breaking => "breaking",
            Self::OrchestratorChanged => "orchestrator_changed",
        };
        f.write_str(s)
    }
}

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftChange {
    MissingTool { tool: String },
    RemovedField { tool: String, field: String },
    AddedRequiredField { tool: String, field: String },
    AddedOptionalField { tool: String, field: String },
    OrchestratorVersion { from: String, to: String },
}

/// Aggregate drift verdict for a resume attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub severity: DriftSeverity,
    pub changes: Vec<DriftChange>,
}

impl DriftReport {
    pub fn none() -> Self {
        Self {
            severity: DriftSeverity::None,
            changes: Vec::new(),
        }
    }

    /// A replan-marker payload describing how the old plan maps onto the
    /// changed tool surface.
    pub fn mapping_suggestion(&self) -> serde_json::Value {
        serde_json::json!({
            "reason": "schema_drift",
            "severity": self.severity,
            "changes": self.changes,
        })
    }
}

/// Classify the difference between a captured fingerprint and the current
/// tool surface. Pure; no I/O.
pub fn classify_drift(
    captured: &VersionFingerprint,
    current_tools: &BTreeMap<String, ToolFingerprint>,
    current_version: &str,
) -> DriftReport {
    let mut severity = DriftSeverity::None;
    let mut changes = Vec::new();

    if captured.orchestrator_version != current_version {
        severity = DriftSeverity::OrchestratorChanged;
        changes.push(DriftChange::OrchestratorVersion {
            from: captured.orchestrator_version.clone(),
            to: current_version.to_owned(),
        });
    }

    for (tool_name, old) in &captured.tools {
        let Some(current) = current_tools.get(tool_name) else {
            severity = severity.max(DriftSeverity::Breaking);
            changes.push(DriftChange::MissingTool {
                tool: tool_name.clone(),
            });
            continue;
        };
        if current.hash == old.hash {
            continue;
        }

        for field in &old.fields {
            if !current.fields.iter().any(|f| f.name == field.name) {
                severity = severity.max(DriftSeverity::Breaking);
                changes.push(DriftChange::RemovedField {
                    tool: tool_name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        for field in &current.fields {
            if old.fields.iter().any(|f| f.name == field.name) {
                continue;
            }
            if field.required {
                severity = severity.max(DriftSeverity::Major);
                changes.push(DriftChange::AddedRequiredField {
                    tool: tool_name.clone(),
                    field: field.name.clone(),
                });
            } else {
                severity = severity.max(DriftSeverity::Minor);
                changes.push(DriftChange::AddedOptionalField {
                    tool: tool_name.clone(),
                    field: field.name.clone(),
                });
            }
        }
    }

    DriftReport { severity, changes }
}

/// The guard: captures fingerprints on yield, checks them on resume.
#[derive(Clone)]
pub struct SchemaVersionGuard {
    repo: ExecutionRepository,
    orchestrator_version: String,
}

impl SchemaVersionGuard {
    pub fn new(repo: ExecutionRepository, orchestrator_version: impl Into<String>) -> Self {
        Self {
            repo,
            orchestrator_version: orchestrator_version.into(),
        }
    }

    /// Snapshot the fingerprint of every tool the plan references.
    pub async fn capture(
        &self,
        execution_id: Uuid,
        plan: &Plan,
        registry: &ToolRegistry,
    ) -> Result<VersionFingerprint, EngineError> {
        let all = registry.fingerprints();
        let tools: BTreeMap<String, ToolFingerprint> = plan
            .steps
            .iter()
            .filter_map(|step| {
                all.get(&step.tool_name)
                    .map(|fp| (step.tool_name.clone(), fp.clone()))
            })
            .collect();

        let fingerprint = VersionFingerprint {
            orchestrator_version: self.orchestrator_version.clone(),
            tools,
            captured_at: Utc::now(),
        };
        self.repo
            .save_fingerprint(execution_id, &fingerprint)
            .await?;
        Ok(fingerprint)
    }

    /// Recompute against the captured fingerprint. No checkpoint means no
    /// drift (nothing was promised).
    pub async fn check_on_resume(
        &self,
        execution_id: Uuid,
        registry: &ToolRegistry,
    ) -> Result<DriftReport, EngineError> {
        let Some(captured) = self.repo.load_fingerprint(execution_id).await? else {
            return Ok(DriftReport::none());
        };
        let report = classify_drift(
            &captured,
            &registry.fingerprints(),
            &self.orchestrator_version,
        );
        if report.severity != DriftSeverity::None {
            tracing::warn!(
                execution_id = %execution_id,
                severity = %report.severity,
                changes = report.changes.len(),
                "schema drift detected on resume"
            );
        }
        Ok(report)
    }

    pub async fn clear(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.repo.clear_fingerprint(execution_id).await?;
        Ok(())
    }
}
