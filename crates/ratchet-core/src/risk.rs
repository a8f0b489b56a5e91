//! Step risk classification.
//!
//! A step is gated behind human confirmation when the plan marks it
//! `requires_confirmation`, when its tool is in the configured high-risk
//! set, or when the composite score is positive. Scores above the block
//! threshold classify as `high` and block the step: the machine parks the
//! saga in `SUSPENDED` rather than `AWAITING_CONFIRMATION`, and only an
//! identified approver may resume it ([`ConfirmationService::validate`]
//! rejects anonymous confirms for high-level records). The plan-step flag
//! wins over tool-level opinions.
//!
//! [`ConfirmationService::validate`]: crate::confirm::ConfirmationService::validate

use std::collections::BTreeSet;

use serde_json::Value;

use ratchet_store::models::{Intent, PlanStep, RiskAssessment, RiskLevel};

/// Score contribution of a financial operation.
const FINANCIAL_WEIGHT: f64 = 0.3;
/// Additional contribution when the amount at stake is large.
const LARGE_AMOUNT_WEIGHT: f64 = 0.2;
/// Amounts at or above this count as large.
const LARGE_AMOUNT_THRESHOLD: f64 = 1_000.0;
/// Score contribution of low planner confidence (< 0.5).
const LOW_CONFIDENCE_WEIGHT: f64 = 0.2;
/// Score contribution of a long plan (> 5 steps).
const LONG_PLAN_WEIGHT: f64 = 0.1;
/// Score contribution of bulk/batch operations.
const BULK_WEIGHT: f64 = 0.2;

/// Composite score above which a step blocks instead of merely gating.
pub const BLOCK_THRESHOLD: f64 = 0.8;

/// Risk classifier configured with the high-risk tool set.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    high_risk_tools: BTreeSet<String>,
}

impl RiskPolicy {
    pub fn new(high_risk_tools: BTreeSet<String>) -> Self {
        Self { high_risk_tools }
    }

    /// Assess one step in the context of its intent and plan length.
    pub fn assess(&self, step: &PlanStep, intent: &Intent, plan_len: usize) -> RiskAssessment {
        let mut score = 0.0;
        let mut reasons: Vec<&str> = Vec::new();

        let amount = extract_amount(step);
        if self.is_financial(step) {
            score += FINANCIAL_WEIGHT;
            reasons.push("financial operation");
        }
        if amount.is_some_and(|a| a >= LARGE_AMOUNT_THRESHOLD) {
            score += LARGE_AMOUNT_WEIGHT;
            reasons.push("large amount");
        }
        if intent.confidence < 0.5 {
            score += LOW_CONFIDENCE_WEIGHT;
            reasons.push("low intent confidence");
        }
        if plan_len > 5 {
            score += LONG_PLAN_WEIGHT;
            reasons.push("long plan");
        }
        if is_bulk(step) {
            score += BULK_WEIGHT;
            reasons.push("bulk operation");
        }

        let level = if score > BLOCK_THRESHOLD {
            RiskLevel::High
        } else if score > 0.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        RiskAssessment {
            level,
            reason: if reasons.is_empty() {
                "no risk factors".to_string()
            } else {
                reasons.join(", ")
            },
            amount,
            score,
        }
    }

    /// Whether a step must pause for human confirmation.
    pub fn requires_confirmation(&self, step: &PlanStep, assessment: &RiskAssessment) -> bool {
        step.requires_confirmation
            || self.high_risk_tools.contains(&step.tool_name)
            || assessment.score > 0.0
    }

    /// Whether the assessment is in the blocking tier. Blocked steps park
    /// the saga in `SUSPENDED` and only an identified approver resumes
    /// them.
    pub fn blocks(&self, assessment: &RiskAssessment) -> bool {
        assessment.level == RiskLevel::High
    }

    fn is_financial(&self, step: &PlanStep) -> bool {
        self.high_risk_tools.contains(&step.tool_name)
            || step.parameters.contains_key("amount")
            || step.tool_name.contains("payment")
            || step.tool_name.contains("charge")
            || step.tool_name.contains("refund")
    }
}

fn extract_amount(step: &PlanStep) -> Option<f64> {
    step.parameters.get("amount").and_then(Value::as_f64)
}

fn is_bulk(step: &PlanStep) -> bool {
    step.tool_name.contains("bulk")
        || step.tool_name.contains("batch")
        || step
            .parameters
            .get("items")
            .and_then(Value::as_array)
            .is_some_and(|items| items.len() > 1)
}
