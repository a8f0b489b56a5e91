//! Rule-matched failover recommendations.
//!
//! When a step fails, the machine builds a [`FailoverContext`] and asks the
//! engine for the best alternative action. The engine is pure: it scores
//! the configured policies against the context and returns a
//! recommendation; the caller persists any chosen action to the replan
//! marker or triggers compensation.

pub mod engine;

use std::fmt;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::FailureReason;

pub use engine::{FailoverEngine, default_policies};

/// Alternative actions, ordered by escalation severity. `priority()` is
/// used to break scoring ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverAction {
    SuggestAlternativeTime,
    SuggestAlternativeRestaurant,
    TriggerDelivery,
    TriggerWaitlist,
    DowngradePartySize,
    RetryWithBackoff,
    EscalateToHuman,
    AbortAndRefund,
}

impl FailoverAction {
    /// Higher wins tie-breaks between equally scored policies.
    pub fn priority(self) -> u8 {
        match self {
            Self::RetryWithBackoff => 1,
            Self::SuggestAlternativeTime => 2,
            Self::SuggestAlternativeRestaurant => 3,
            Self::DowngradePartySize => 4,
            Self::TriggerWaitlist => 5,
            Self::TriggerDelivery => 6,
            Self::AbortAndRefund => 7,
            Self::EscalateToHuman => 8,
        }
    }
}

impl fmt::Display for FailoverAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SuggestAlternativeTime => "SUGGEST_ALTERNATIVE_TIME",
            Self::SuggestAlternativeRestaurant => "SUGGEST_ALTERNATIVE_RESTAURANT",
            Self::TriggerDelivery => "TRIGGER_DELIVERY",
            Self::TriggerWaitlist => "TRIGGER_WAITLIST",
            Self::DowngradePartySize => "DOWNGRADE_PARTY_SIZE",
            Self::RetryWithBackoff => "RETRY_WITH_BACKOFF",
            Self::EscalateToHuman => "ESCALATE_TO_HUMAN",
            Self::AbortAndRefund => "ABORT_AND_REFUND",
        };
        f.write_str(s)
    }
}

/// Everything the engine may match a policy against.
#[derive(Debug, Clone)]
pub struct FailoverContext {
    pub intent_type: String,
    pub failure_reason: FailureReason,
    pub confidence: f64,
    pub attempt_count: u32,
    pub restaurant_tags: Vec<String>,
    pub party_size: Option<u32>,
    pub time_of_day: Option<NaiveTime>,
    pub day_of_week: Option<Weekday>,
    pub metadata: Map<String, Value>,
}

impl FailoverContext {
    pub fn new(intent_type: impl Into<String>, failure_reason: FailureReason) -> Self {
        Self {
            intent_type: intent_type.into(),
            failure_reason,
            confidence: 1.0,
            attempt_count: 0,
            restaurant_tags: Vec::new(),
            party_size: None,
            time_of_day: None,
            day_of_week: None,
            metadata: Map::new(),
        }
    }
}

/// A policy's match condition. Intent types and failure reasons are hard
/// gates (empty list = wildcard); the remaining dimensions add bounded
/// soft bonuses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyCondition {
    #[serde(default)]
    pub intent_types: Vec<String>,
    #[serde(default)]
    pub failure_reasons: Vec<FailureReason>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub max_confidence: Option<f64>,
    /// Policy only applies while the attempt count is at or below this.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub party_size_range: Option<(u32, u32)>,
    #[serde(default)]
    pub time_range: Option<(NaiveTime, NaiveTime)>,
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub required_tags: Vec<String>,
}

/// A named policy: condition plus a priority-ordered action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub name: String,
    pub condition: PolicyCondition,
    /// Preferred first; the first entry is the recommended action.
    pub actions: Vec<FailoverAction>,
}

/// A concrete materialized suggestion attached to a recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub action: FailoverAction,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset_minutes: Option<i32>,
}

/// The engine's verdict for one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub policy: String,
    pub action: FailoverAction,
    pub score: f64,
    pub alternatives: Vec<Alternative>,
}
