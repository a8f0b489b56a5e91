//! Typed builders for every state-store key.
//!
//! The key layout is a contract shared with operators and external tooling;
//! no call site outside this module builds a key string by hand.

use uuid::Uuid;

/// Prefix under which every execution document lives. Used by the
/// reconciler's cursored scan.
pub const EXECUTION_PREFIX: &str = "task:";

/// Sorted index of dead-letter entries, scored by detection time.
pub const DLQ_INDEX: &str = "dlq:index";

/// Execution document: `task:{execution_id}`.
pub fn execution(execution_id: Uuid) -> String {
    format!("{EXECUTION_PREFIX}{execution_id}")
}

/// Execution mutual-exclusion lock: `exec:{execution_id}:lock`.
pub fn execution_lock(execution_id: Uuid) -> String {
    format!("exec:{execution_id}:lock")
}

/// Write-once step idempotency marker: `exec:{execution_id}:step:{index}:done`.
pub fn step_done(execution_id: Uuid, step_index: usize) -> String {
    format!("exec:{execution_id}:step:{step_index}:done")
}

/// Confirmation record by token: `confirmation:{token}`.
pub fn confirmation(token: Uuid) -> String {
    format!("confirmation:{token}")
}

/// Reverse confirmation lookup: `confirmation:exec:{execution_id}`.
pub fn confirmation_by_execution(execution_id: Uuid) -> String {
    format!("confirmation:exec:{execution_id}")
}

/// Replan marker consumed by the next planning pass: `exec:{execution_id}:replan`.
pub fn replan_marker(execution_id: Uuid) -> String {
    format!("exec:{execution_id}:replan")
}

/// Snapshot of the last failover recommendation: `exec:{execution_id}:failover`.
pub fn failover_snapshot(execution_id: Uuid) -> String {
    format!("exec:{execution_id}:failover")
}

/// Dead-letter record: `dlq:saga:{execution_id}`.
pub fn dlq_entry(execution_id: Uuid) -> String {
    format!("dlq:saga:{execution_id}")
}

/// Heartbeat record: `heartbeat:{execution_id}`.
pub fn heartbeat(execution_id: Uuid) -> String {
    format!("heartbeat:{execution_id}")
}

/// Monotonic sequence counter per ordering scope: `seq:{scope}`.
pub fn sequence(scope: &str) -> String {
    format!("seq:{scope}")
}

/// Version fingerprint captured at yield:
/// `schema_versioning:checkpoint:{execution_id}`.
pub fn version_checkpoint(execution_id: Uuid) -> String {
    format!("schema_versioning:checkpoint:{execution_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn key_layout_is_stable() {
        let e = id();
        assert_eq!(
            execution(e),
            "task:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            execution_lock(e),
            "exec:550e8400-e29b-41d4-a716-446655440000:lock"
        );
        assert_eq!(
            step_done(e, 2),
            "exec:550e8400-e29b-41d4-a716-446655440000:step:2:done"
        );
        assert_eq!(
            confirmation(e),
            "confirmation:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            confirmation_by_execution(e),
            "confirmation:exec:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            replan_marker(e),
            "exec:550e8400-e29b-41d4-a716-446655440000:replan"
        );
        assert_eq!(
            failover_snapshot(e),
            "exec:550e8400-e29b-41d4-a716-446655440000:failover"
        );
        assert_eq!(
            dlq_entry(e),
            "dlq:saga:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            heartbeat(e),
            "heartbeat:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(sequence("exec:abc"), "seq:exec:abc");
        assert_eq!(
            version_checkpoint(e),
            "schema_versioning:checkpoint:550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn execution_keys_share_the_scan_prefix() {
        assert!(execution(id()).starts_with(EXECUTION_PREFIX));
        assert!(!execution_lock(id()).starts_with(EXECUTION_PREFIX));
    }
}
