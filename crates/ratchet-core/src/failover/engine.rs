//! Policy scoring and recommendation.
//!
//! Hard gates (intent type, failure reason) must match or the policy
//! scores zero. Soft dimensions add bounded bonuses on top of a base
//! score. Ties break on the highest action priority in the policy's
//! list. The winning policy's first action becomes the recommendation,
//! with materialized alternatives (e.g. +/-30 and +/-60 minute offsets)
//! attached where that makes sense.

use super::{
    Alternative, FailoverAction, FailoverContext, FailoverPolicy, PolicyCondition, Recommendation,
};
use crate::messages::FailureReason;

/// Base score for a policy whose hard gates match.
const BASE_SCORE: f64 = 1.0;
/// Bonus per non-wildcard hard gate that matched. Specific policies must
/// outrank the catch-all.
const GATE_BONUS: f64 = 0.25;
/// Bonus per matched soft dimension; bonuses are individually bounded so
/// no single dimension dominates.
const TAG_BONUS: f64 = 0.2;
const PARTY_BONUS: f64 = 0.15;
const TIME_BONUS: f64 = 0.15;
const DAY_BONUS: f64 = 0.1;
const CONFIDENCE_BONUS: f64 = 0.2;
const ATTEMPT_BONUS: f64 = 0.1;

/// Pure recommendation engine over a policy set.
#[derive(Debug, Clone)]
pub struct FailoverEngine {
    policies: Vec<FailoverPolicy>,
}

impl FailoverEngine {
    pub fn new(policies: Vec<FailoverPolicy>) -> Self {
        Self { policies }
    }

    /// Engine with the built-in policy set.
    pub fn with_defaults() -> Self {
        Self::new(default_policies())
    }

    /// Score every policy against the context and return the best match,
    /// or `None` when no policy survives its hard gates.
    pub fn evaluate(&self, ctx: &FailoverContext) -> Option<Recommendation> {
        let mut best: Option<(&FailoverPolicy, f64)> = None;

        for policy in &self.policies {
            let score = score_policy(&policy.condition, ctx);
            if score <= 0.0 {
                continue;
            }
            best = match best {
                None => Some((policy, score)),
                Some((current, current_score)) => {
                    if score > current_score
                        || (score == current_score
                            && max_priority(policy) > max_priority(current))
                    {
                        Some((policy, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        best.and_then(|(policy, score)| {
            let action = *policy.actions.first()?;
            Some(Recommendation {
                policy: policy.name.clone(),
                action,
                score,
                alternatives: materialize_alternatives(policy, ctx),
            })
        })
    }
}

fn max_priority(policy: &FailoverPolicy) -> u8 {
    policy
        .actions
        .iter()
        .map(|a| a.priority())
        .max()
        .unwrap_or(0)
}

/// Score one condition: 0 disqualifies, otherwise base plus bounded soft
/// bonuses.
fn score_policy(condition: &PolicyCondition, ctx: &FailoverContext) -> f64 {
    let mut score = BASE_SCORE;

    // Hard gates. An empty list is a wildcard; a non-empty list must
    // match and earns the specificity bonus.
    if !condition.intent_types.is_empty() {
        if !condition.intent_types.contains(&ctx.intent_type) {
            return 0.0;
        }
        score += GATE_BONUS;
    }
    if !condition.failure_reasons.is_empty() {
        if !condition.failure_reasons.contains(&ctx.failure_reason) {
            return 0.0;
        }
        score += GATE_BONUS;
    }
    if let Some(max) = condition.max_attempts {
        if ctx.attempt_count > max {
            return 0.0;
        }
    }

    if !condition.required_tags.is_empty() {
        let matched = condition
            .required_tags
            .iter()
            .any(|tag| ctx.restaurant_tags.contains(tag));
        if !matched {
            return 0.0;
        }
        score += TAG_BONUS;
    }
    if let (Some((lo, hi)), Some(size)) = (condition.party_size_range, ctx.party_size) {
        if size < lo || size > hi {
            return 0.0;
        }
        score += PARTY_BONUS;
    }
    if let (Some((start, end)), Some(time)) = (condition.time_range, ctx.time_of_day) {
        if time < start || time > end {
            return 0.0;
        }
        score += TIME_BONUS;
    }
    if !condition.days.is_empty() {
        match ctx.day_of_week {
            Some(day) if condition.days.contains(&day) => score += DAY_BONUS,
            Some(_) => return 0.0,
            None => {}
        }
    }
    if let Some(min) = condition.min_confidence {
        if ctx.confidence < min {
            return 0.0;
        }
        score += CONFIDENCE_BONUS / 2.0;
    }
    if let Some(max) = condition.max_confidence {
        if ctx.confidence > max {
            return 0.0;
        }
        score += CONFIDENCE_BONUS / 2.0;
    }
    if condition.max_attempts.is_some() {
        score += ATTEMPT_BONUS;
    }

    score
}

/// Turn the winning policy's action list into concrete suggestions.
fn materialize_alternatives(policy: &FailoverPolicy, ctx: &FailoverContext) -> Vec<Alternative> {
    let mut out = Vec::new();
    for action in &policy.actions {
        match action {
            FailoverAction::SuggestAlternativeTime => {
                for offset in [-60i32, -30, 30, 60] {
                    out.push(Alternative {
                        action: *action,
                        description: format!(
                            "try {} minutes {}",
                            offset.abs(),
                            if offset < 0 { "earlier" } else { "later" }
                        ),
                        time_offset_minutes: Some(offset),
                    });
                }
            }
            FailoverAction::DowngradePartySize => {
                if let Some(size) = ctx.party_size.filter(|s| *s > 1) {
                    out.push(Alternative {
                        action: *action,
                        description: format!("retry with a party of {}", size - 1),
                        time_offset_minutes: None,
                    });
                }
            }
            FailoverAction::SuggestAlternativeRestaurant
            | FailoverAction::TriggerDelivery
            | FailoverAction::TriggerWaitlist => {
                out.push(Alternative {
                    action: *action,
                    description: action.to_string().to_lowercase().replace('_', " "),
                    time_offset_minutes: None,
                });
            }
            FailoverAction::RetryWithBackoff
            | FailoverAction::EscalateToHuman
            | FailoverAction::AbortAndRefund => {}
        }
    }
    out
}

/// The built-in policy set.
pub fn default_policies() -> Vec<FailoverPolicy> {
    vec![
        FailoverPolicy {
            name: "transient-retry".to_string(),
            condition: PolicyCondition {
                failure_reasons: vec![
                    FailureReason::Timeout,
                    FailureReason::NetworkError,
                    FailureReason::RateLimited,
                ],
                max_attempts: Some(2),
                ..PolicyCondition::default()
            },
            actions: vec![FailoverAction::RetryWithBackoff],
        },
        FailoverPolicy {
            name: "reservation-no-availability".to_string(),
            condition: PolicyCondition {
                intent_types: vec!["reservation".to_string()],
                failure_reasons: vec![FailureReason::NoAvailability],
                ..PolicyCondition::default()
            },
            actions: vec![
                FailoverAction::SuggestAlternativeTime,
                FailoverAction::SuggestAlternativeRestaurant,
                FailoverAction::TriggerWaitlist,
            ],
        },
        FailoverPolicy {
            name: "large-party-downgrade".to_string(),
            condition: PolicyCondition {
                intent_types: vec!["reservation".to_string()],
                failure_reasons: vec![FailureReason::NoAvailability],
                party_size_range: Some((6, 50)),
                ..PolicyCondition::default()
            },
            actions: vec![
                FailoverAction::DowngradePartySize,
                FailoverAction::SuggestAlternativeTime,
            ],
        },
        FailoverPolicy {
            name: "order-fallback-delivery".to_string(),
            condition: PolicyCondition {
                intent_types: vec!["order".to_string()],
                failure_reasons: vec![FailureReason::NoAvailability],
                ..PolicyCondition::default()
            },
            actions: vec![FailoverAction::TriggerDelivery],
        },
        FailoverPolicy {
            name: "payment-abort".to_string(),
            condition: PolicyCondition {
                failure_reasons: vec![FailureReason::PaymentFailed],
                ..PolicyCondition::default()
            },
            actions: vec![FailoverAction::AbortAndRefund],
        },
        FailoverPolicy {
            name: "low-confidence-escalate".to_string(),
            condition: PolicyCondition {
                max_confidence: Some(0.5),
                failure_reasons: vec![FailureReason::Unknown, FailureReason::ValidationFailed],
                ..PolicyCondition::default()
            },
            actions: vec![FailoverAction::EscalateToHuman],
        },
        FailoverPolicy {
            name: "catch-all-escalate".to_string(),
            condition: PolicyCondition::default(),
            actions: vec![FailoverAction::EscalateToHuman],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_failure_recommends_abort_and_refund() {
        let engine = FailoverEngine::with_defaults();
        let ctx = FailoverContext::new("reservation", FailureReason::PaymentFailed);
        let rec = engine.evaluate(&ctx).unwrap();
        assert_eq!(rec.action, FailoverAction::AbortAndRefund);
        assert_eq!(rec.policy, "payment-abort");
    }

    #[test]
    fn transient_failure_recommends_retry_until_attempts_exhausted() {
        let engine = FailoverEngine::with_defaults();
        let mut ctx = FailoverContext::new("reservation", FailureReason::Timeout);
        ctx.attempt_count = 1;
        assert_eq!(
            engine.evaluate(&ctx).unwrap().action,
            FailoverAction::RetryWithBackoff
        );

        // Past the attempt gate the retry policy is disqualified.
        ctx.attempt_count = 3;
        let rec = engine.evaluate(&ctx).unwrap();
        assert_ne!(rec.action, FailoverAction::RetryWithBackoff);
    }

    #[test]
    fn no_availability_materializes_time_offsets() {
        let engine = FailoverEngine::with_defaults();
        let ctx = FailoverContext::new("reservation", FailureReason::NoAvailability);
        let rec = engine.evaluate(&ctx).unwrap();
        assert_eq!(rec.action, FailoverAction::SuggestAlternativeTime);

        let offsets: Vec<i32> = rec
            .alternatives
            .iter()
            .filter_map(|a| a.time_offset_minutes)
            .collect();
        assert!(offsets.contains(&-30));
        assert!(offsets.contains(&30));
        assert!(offsets.contains(&-60));
        assert!(offsets.contains(&60));
    }

    #[test]
    fn large_party_beats_generic_availability_policy() {
        let engine = FailoverEngine::with_defaults();
        let mut ctx = FailoverContext::new("reservation", FailureReason::NoAvailability);
        ctx.party_size = Some(8);

        // The party-size bonus outranks the generic policy's base score.
        let rec = engine.evaluate(&ctx).unwrap();
        assert_eq!(rec.policy, "large-party-downgrade");
        assert_eq!(rec.action, FailoverAction::DowngradePartySize);
        assert!(
            rec.alternatives
                .iter()
                .any(|a| a.description.contains("party of 7"))
        );
    }

    #[test]
    fn hard_gate_mismatch_disqualifies() {
        let engine = FailoverEngine::new(vec![FailoverPolicy {
            name: "orders-only".to_string(),
            condition: PolicyCondition {
                intent_types: vec!["order".to_string()],
                ..PolicyCondition::default()
            },
            actions: vec![FailoverAction::TriggerDelivery],
        }]);
        let ctx = FailoverContext::new("reservation", FailureReason::Unknown);
        assert!(engine.evaluate(&ctx).is_none());
    }

    #[test]
    fn catch_all_escalates_unknown_failures() {
        let engine = FailoverEngine::with_defaults();
        let ctx = FailoverContext::new("anything", FailureReason::Unknown);
        let rec = engine.evaluate(&ctx).unwrap();
        assert_eq!(rec.action, FailoverAction::EscalateToHuman);
    }

    #[test]
    fn tie_breaks_on_max_action_priority() {
        let engine = FailoverEngine::new(vec![
            FailoverPolicy {
                name: "mild".to_string(),
                condition: PolicyCondition::default(),
                actions: vec![FailoverAction::RetryWithBackoff],
            },
            FailoverPolicy {
                name: "decisive".to_string(),
                condition: PolicyCondition::default(),
                actions: vec![
                    FailoverAction::SuggestAlternativeTime,
                    FailoverAction::EscalateToHuman,
                ],
            },
        ]);
        let ctx = FailoverContext::new("x", FailureReason::Unknown);
        let rec = engine.evaluate(&ctx).unwrap();
        // Equal scores; "decisive" carries the higher max priority.
        assert_eq!(rec.policy, "decisive");
        assert_eq!(rec.action, FailoverAction::SuggestAlternativeTime);
    }

    #[test]
    fn engine_is_pure() {
        let engine = FailoverEngine::with_defaults();
        let ctx = FailoverContext::new("reservation", FailureReason::NoAvailability);
        let a = engine.evaluate(&ctx).unwrap();
        let b = engine.evaluate(&ctx).unwrap();
        assert_eq!(a.policy, b.policy);
        assert_eq!(a.score, b.score);
    }
}
