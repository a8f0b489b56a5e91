//! Engine error taxonomy.
//!
//! Tool failures never surface here: the machine recovers them through the
//! failover policy. Everything else maps onto a transport status at the
//! HTTP layer; infrastructure errors bubble so the queue can retry.

use ratchet_store::StoreError;
use ratchet_store::models::ExecutionStatus;

/// Errors surfaced by engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input at an entry point. Not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid signature/key, or actor mismatch. Not retried.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Unknown execution or token.
    #[error("not found: {0}")]
    NotFound(String),

    /// Execution lock held, or a conflicting concurrent attempt.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Confirmation token past its TTL.
    #[error("expired: {0}")]
    Expired(String),

    /// State store unreachable. Bubbles as 5xx so the queue retries.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue publish failed.
    #[error("queue unavailable: {0}")]
    Queue(String),

    /// Event bus publish failed.
    #[error("event bus unavailable: {0}")]
    Bus(String),

    /// A state change forbidden by the transition table. Programming
    /// error: fail fast, never mask.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Steps remain but none is runnable (dependency deadlock).
    #[error("saga stalled: {0}")]
    Stalled(String),
}

impl EngineError {
    /// Whether a retry by the at-least-once queue could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Queue(_) | Self::Bus(_) | Self::Conflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_retryable() {
        assert!(EngineError::Queue("down".into()).is_retryable());
        assert!(EngineError::Conflict("lock held".into()).is_retryable());
        assert!(!EngineError::Auth("bad key".into()).is_retryable());
        assert!(!EngineError::Expired("token".into()).is_retryable());
        assert!(
            !EngineError::IllegalTransition {
                from: ExecutionStatus::Completed,
                to: ExecutionStatus::Executing,
            }
            .is_retryable()
        );
    }
}
