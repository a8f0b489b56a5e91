//! Failure-reason classification and user-facing messages.
//!
//! Tool errors arrive as free text; the machine classifies them by keyword
//! into a [`FailureReason`] that feeds the failover policy engine, and
//! surfaces a friendly message on terminal failure.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified cause of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    PaymentFailed,
    NoAvailability,
    Timeout,
    ToolNotFound,
    RateLimited,
    ValidationFailed,
    NetworkError,
    Cancelled,
    Unknown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::NoAvailability => "NO_AVAILABILITY",
            Self::Timeout => "TIMEOUT",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl FailureReason {
    /// Whether a plain retry has a realistic chance of succeeding.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::NetworkError
        )
    }
}

/// Keyword-classify a raw tool error into a [`FailureReason`].
pub fn classify_failure(error: &str) -> FailureReason {
    let lower = error.to_lowercase();

    if lower.contains("payment") || lower.contains("card declined") || lower.contains("insufficient funds") {
        FailureReason::PaymentFailed
    } else if lower.contains("no availability")
        || lower.contains("no_availability")
        || lower.contains("fully booked")
        || lower.contains("sold out")
    {
        FailureReason::NoAvailability
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline")
    {
        FailureReason::Timeout
    } else if lower.contains("not registered") || lower.contains("tool not found") {
        FailureReason::ToolNotFound
    } else if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        FailureReason::RateLimited
    } else if lower.contains("validation") || lower.contains("invalid parameter") || lower.contains("missing required")
    {
        FailureReason::ValidationFailed
    } else if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("dns")
        || lower.contains("unreachable")
    {
        FailureReason::NetworkError
    } else if lower.contains("cancelled") || lower.contains("canceled") {
        FailureReason::Cancelled
    } else {
        FailureReason::Unknown
    }
}

/// Message surfaced to the end user when a saga fails for this reason.
pub fn user_friendly_message(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::PaymentFailed => {
            "Your payment could not be processed. No charges were made; any holds have been released."
        }
        FailureReason::NoAvailability => {
            "Nothing was available for your request. Try a different time or place."
        }
        FailureReason::Timeout => {
            "The request took too long and was safely rolled back. Please try again."
        }
        FailureReason::ToolNotFound => {
            "Part of this request is temporarily unsupported. Our team has been notified."
        }
        FailureReason::RateLimited => {
            "We're handling a lot of requests right now. Please try again in a moment."
        }
        FailureReason::ValidationFailed => {
            "Some details of your request didn't check out. Please review and try again."
        }
        FailureReason::NetworkError => {
            "A connection problem interrupted your request. It was safely rolled back."
        }
        FailureReason::Cancelled => "Your request was cancelled.",
        FailureReason::Unknown => {
            "Something went wrong and your request was safely rolled back."
        }
    }
}
