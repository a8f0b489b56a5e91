//! Typed repository over the raw [`StateStore`] for every engine record.
//!
//! One place owns the JSON codecs, key choices, and TTL policy: execution
//! documents live for 24 h after a terminal transition, dead-letter and
//! fingerprint records for 7 days.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::keys;
use crate::models::{
    ConfirmationRecord, DlqEntry, Execution, HeartbeatRecord, VersionFingerprint,
};
use crate::store::{StateStore, StoreError, get_json, put_json};

/// How long a terminal execution document is retained.
pub const TERMINAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long dead-letter and fingerprint records are retained.
pub const RETENTION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// TTL of a replan marker; the next planning pass must pick it up quickly.
pub const REPLAN_MARKER_TTL: Duration = Duration::from_secs(15 * 60);

/// Typed access to engine state.
#[derive(Clone)]
pub struct ExecutionRepository {
    store: Arc<dyn StateStore>,
}

impl ExecutionRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The raw store, for callers that need primitive operations
    /// (lock service, sequence counters).
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // -- executions ---------------------------------------------------------

    pub async fn load(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        get_json(self.store.as_ref(), &keys::execution(execution_id)).await
    }

    /// Persist an execution document. Terminal executions get the 24 h TTL;
    /// active ones persist without expiry.
    pub async fn save(&self, execution: &Execution) -> Result<(), StoreError> {
        let ttl = execution.status.is_terminal().then_some(TERMINAL_TTL);
        put_json(
            self.store.as_ref(),
            &keys::execution(execution.execution_id),
            execution,
            ttl,
        )
        .await
    }

    pub async fn delete(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.store.del(&keys::execution(execution_id)).await
    }

    /// One page of the execution scan used by the reconciler. Keys that
    /// vanish between scan and read are skipped.
    pub async fn scan_executions(
        &self,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Execution>), StoreError> {
        let (next, page) = self
            .store
            .scan(keys::EXECUTION_PREFIX, cursor, count)
            .await?;
        let mut executions = Vec::with_capacity(page.len());
        for key in page {
            if let Some(execution) = get_json::<Execution>(self.store.as_ref(), &key).await? {
                executions.push(execution);
            }
        }
        Ok((next, executions))
    }

    // -- confirmations ------------------------------------------------------

    /// Store a confirmation under both its token key and the reverse
    /// execution key, with the record's TTL.
    pub async fn save_confirmation(
        &self,
        record: &ConfirmationRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::confirmation(record.token),
            record,
            Some(ttl),
        )
        .await?;
        self.store
            .put(
                &keys::confirmation_by_execution(record.execution_id),
                &record.token.to_string(),
                Some(ttl),
            )
            .await
    }

    pub async fn load_confirmation(
        &self,
        token: Uuid,
    ) -> Result<Option<ConfirmationRecord>, StoreError> {
        get_json(self.store.as_ref(), &keys::confirmation(token)).await
    }

    /// The pending confirmation token for an execution, if any.
    pub async fn confirmation_token_for(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let raw = self
            .store
            .get(&keys::confirmation_by_execution(execution_id))
            .await?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// Delete both confirmation keys. Tokens are single-use; the engine
    /// holds the execution lock here, so the two deletes are not racing
    /// another resume.
    pub async fn delete_confirmation(
        &self,
        token: Uuid,
        execution_id: Uuid,
    ) -> Result<bool, StoreError> {
        let existed = self.store.del(&keys::confirmation(token)).await?;
        self.store
            .del(&keys::confirmation_by_execution(execution_id))
            .await?;
        Ok(existed)
    }

    // -- heartbeats ---------------------------------------------------------

    pub async fn save_heartbeat(&self, record: &HeartbeatRecord) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::heartbeat(record.execution_id),
            record,
            Some(TERMINAL_TTL),
        )
        .await
    }

    pub async fn load_heartbeat(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<HeartbeatRecord>, StoreError> {
        get_json(self.store.as_ref(), &keys::heartbeat(execution_id)).await
    }

    pub async fn clear_heartbeat(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.store.del(&keys::heartbeat(execution_id)).await
    }

    // -- replan marker & failover snapshot ----------------------------------

    pub async fn save_replan_marker(
        &self,
        execution_id: Uuid,
        marker: &Value,
    ) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::replan_marker(execution_id),
            marker,
            Some(REPLAN_MARKER_TTL),
        )
        .await
    }

    pub async fn load_replan_marker(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Value>, StoreError> {
        get_json(self.store.as_ref(), &keys::replan_marker(execution_id)).await
    }

    pub async fn clear_replan_marker(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.store.del(&keys::replan_marker(execution_id)).await
    }

    pub async fn save_failover_snapshot(
        &self,
        execution_id: Uuid,
        snapshot: &Value,
    ) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::failover_snapshot(execution_id),
            snapshot,
            Some(RETENTION_TTL),
        )
        .await
    }

    pub async fn load_failover_snapshot(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Value>, StoreError> {
        get_json(self.store.as_ref(), &keys::failover_snapshot(execution_id)).await
    }

    // -- dead-letter queue --------------------------------------------------

    /// Upsert a dead-letter record and (re-)index it by detection time.
    pub async fn upsert_dlq(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::dlq_entry(entry.execution_id),
            entry,
            Some(RETENTION_TTL),
        )
        .await?;
        self.store
            .zadd(
                keys::DLQ_INDEX,
                &entry.execution_id.to_string(),
                entry.detected_at.timestamp_millis() as f64,
            )
            .await
    }

    pub async fn load_dlq(&self, execution_id: Uuid) -> Result<Option<DlqEntry>, StoreError> {
        get_json(self.store.as_ref(), &keys::dlq_entry(execution_id)).await
    }

    /// Dead-letter entries oldest-first, up to `limit`. Index members whose
    /// record has expired are dropped from the index as they are seen.
    pub async fn list_dlq(&self, limit: usize) -> Result<Vec<DlqEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .store
            .zrange(keys::DLQ_INDEX, 0, limit as isize - 1)
            .await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let Ok(execution_id) = Uuid::parse_str(&member) else {
                continue;
            };
            match self.load_dlq(execution_id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    self.store.zrem(keys::DLQ_INDEX, &member).await?;
                }
            }
        }
        Ok(entries)
    }

    pub async fn remove_dlq(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let existed = self.store.del(&keys::dlq_entry(execution_id)).await?;
        self.store
            .zrem(keys::DLQ_INDEX, &execution_id.to_string())
            .await?;
        Ok(existed)
    }

    // -- version fingerprints -----------------------------------------------

    pub async fn save_fingerprint(
        &self,
        execution_id: Uuid,
        fingerprint: &VersionFingerprint,
    ) -> Result<(), StoreError> {
        put_json(
            self.store.as_ref(),
            &keys::version_checkpoint(execution_id),
            fingerprint,
            Some(RETENTION_TTL),
        )
        .await
    }

    pub async fn load_fingerprint(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<VersionFingerprint>, StoreError> {
        get_json(self.store.as_ref(), &keys::version_checkpoint(execution_id)).await
    }

    pub async fn clear_fingerprint(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        self.store.del(&keys::version_checkpoint(execution_id)).await
    }

    // -- sequences ----------------------------------------------------------

    /// Next value of the per-scope monotonic sequence counter.
    pub async fn next_sequence(&self, scope: &str) -> Result<i64, StoreError> {
        self.store.incr(&keys::sequence(scope)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Map;

    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::models::{
        ExecutionStatus, Intent, Plan, PlanStep, RiskAssessment, RiskLevel,
    };

    fn repo() -> ExecutionRepository {
        ExecutionRepository::new(Arc::new(MemoryStore::new()))
    }

    fn sample_execution() -> Execution {
        let plan = Plan {
            steps: vec![PlanStep {
                id: "s0".to_string(),
                index: 0,
                tool_name: "search".to_string(),
                parameters: Map::new(),
                dependencies: vec![],
                requires_confirmation: false,
                timeout_ms: 8_500,
                estimated_tokens: 0,
            }],
        };
        let intent = Intent {
            raw_text: "find a table".to_string(),
            intent_type: "reservation".to_string(),
            confidence: 0.9,
            parameters: Map::new(),
        };
        Execution::new(Uuid::new_v4(), intent, plan)
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let repo = repo();
        let execution = sample_execution();
        repo.save(&execution).await.unwrap();

        let loaded = repo.load(execution.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, execution.execution_id);
        assert_eq!(loaded.status, ExecutionStatus::Planned);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let repo = repo();
        assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirmation_two_key_scheme() {
        let repo = repo();
        let record = ConfirmationRecord {
            token: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_id: "s1".to_string(),
            parameters: Map::new(),
            risk: RiskAssessment {
                level: RiskLevel::High,
                reason: "payment over threshold".to_string(),
                amount: Some(250.0),
                score: 0.6,
            },
            actor_id: Some("user-1".to_string()),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(900),
        };
        repo.save_confirmation(&record, Duration::from_secs(900))
            .await
            .unwrap();

        let by_token = repo.load_confirmation(record.token).await.unwrap().unwrap();
        assert_eq!(by_token.step_id, "s1");
        let reverse = repo
            .confirmation_token_for(record.execution_id)
            .await
            .unwrap();
        assert_eq!(reverse, Some(record.token));

        assert!(
            repo.delete_confirmation(record.token, record.execution_id)
                .await
                .unwrap()
        );
        assert!(repo.load_confirmation(record.token).await.unwrap().is_none());
        assert!(
            repo.confirmation_token_for(record.execution_id)
                .await
                .unwrap()
                .is_none()
        );
        // Second delete reports the token already gone.
        assert!(
            !repo
                .delete_confirmation(record.token, record.execution_id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn dlq_index_is_oldest_first() {
        let repo = repo();
        let old = DlqEntry {
            execution_id: Uuid::new_v4(),
            detected_at: Utc::now() - chrono::Duration::minutes(10),
            attempts: 1,
            last_status: ExecutionStatus::Executing,
        };
        let newer = DlqEntry {
            execution_id: Uuid::new_v4(),
            detected_at: Utc::now(),
            attempts: 0,
            last_status: ExecutionStatus::Compensating,
        };
        repo.upsert_dlq(&newer).await.unwrap();
        repo.upsert_dlq(&old).await.unwrap();

        let listed = repo.list_dlq(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, old.execution_id);
        assert_eq!(listed[1].execution_id, newer.execution_id);

        assert!(repo.remove_dlq(old.execution_id).await.unwrap());
        let listed = repo.list_dlq(10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_scope() {
        let repo = repo();
        assert_eq!(repo.next_sequence("exec:a").await.unwrap(), 1);
        assert_eq!(repo.next_sequence("exec:a").await.unwrap(), 2);
        assert_eq!(repo.next_sequence("exec:b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_executions_skips_foreign_keys() {
        let repo = repo();
        let a = sample_execution();
        let b = sample_execution();
        repo.save(&a).await.unwrap();
        repo.save(&b).await.unwrap();
        // A heartbeat record must not show up in the execution scan.
        repo.save_heartbeat(&HeartbeatRecord {
            execution_id: a.execution_id,
            expected_next_step_index: 1,
            scheduled_at: Utc::now(),
            check_at: Utc::now(),
            status: crate::models::HeartbeatStatus::Pending,
            attempts: 0,
        })
        .await
        .unwrap();

        let (cursor, executions) = repo.scan_executions(0, 100).await.unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(executions.len(), 2);
    }
}
