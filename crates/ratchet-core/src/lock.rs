//! Ownership-tracked distributed locks over the state store.
//!
//! The execution lock is the engine's only mutual-exclusion primitive: a
//! step handler must hold it for the entire duration of its tool call and
//! release it before yielding to a transport. Staleness is detected from
//! the stored record (`acquired_at + ttl + grace`), recovered once, and
//! logged.
//!
//! The step idempotency marker is deliberately not a lock: it is a
//! write-once SET-NX with a long TTL that is never released. Its presence
//! is the truth of "this step index was attempted".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use ratchet_store::keys;
use ratchet_store::models::LockRecord;
use ratchet_store::store::{StateStore, StoreError, get_json};

use crate::config::LockConfig;

/// TTL of the write-once step idempotency marker.
const STEP_DONE_TTL: Duration = Duration::from_secs(60 * 60);

/// Distributed lock service.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn StateStore>,
    config: LockConfig,
}

impl LockService {
    pub fn new(store: Arc<dyn StateStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Try to acquire `key` for `operation`.
    ///
    /// Returns the owned [`LockRecord`] on success, `None` when another
    /// owner holds a live lock. A stale holder (TTL + grace elapsed) is
    /// force-released once and the acquisition retried.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        operation: &str,
    ) -> Result<Option<LockRecord>, StoreError> {
        if let Some(record) = self.try_set(key, ttl, operation).await? {
            return Ok(Some(record));
        }

        // Occupied. Check for staleness before giving up.
        match get_json::<LockRecord>(self.store.as_ref(), key).await {
            Ok(Some(existing)) if existing.is_stale(self.config.grace_sec, Utc::now()) => {
                tracing::warn!(
                    key = %key,
                    stale_owner = %existing.owner,
                    operation = %existing.operation,
                    "stale lock recovered"
                );
                self.store.del(key).await?;
                self.try_set(key, ttl, operation).await
            }
            Ok(Some(_)) => Ok(None),
            // The holder released between our set and read; one retry.
            Ok(None) => self.try_set(key, ttl, operation).await,
            // An unreadable record still represents a holder.
            Err(StoreError::Corrupt { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn try_set(
        &self,
        key: &str,
        ttl: Duration,
        operation: &str,
    ) -> Result<Option<LockRecord>, StoreError> {
        let record = LockRecord {
            key: key.to_owned(),
            owner: Uuid::new_v4(),
            acquired_at: Utc::now(),
            ttl_sec: ttl.as_secs(),
            operation: operation.to_owned(),
        };
        let encoded = serde_json::to_string(&record)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode lock: {e}")))?;
        // The store-level TTL covers the grace window so staleness can be
        // observed before the backend evicts the record.
        let store_ttl = ttl + Duration::from_secs(self.config.grace_sec);
        let acquired = self.store.set_if_absent(key, &encoded, store_ttl).await?;
        Ok(acquired.then_some(record))
    }

    /// Release a held lock. Compare-and-delete on the owner: releasing a
    /// lock someone else re-acquired is a warned no-op.
    pub async fn release(&self, record: &LockRecord) -> Result<bool, StoreError> {
        match get_json::<LockRecord>(self.store.as_ref(), &record.key).await? {
            Some(current) if current.owner == record.owner => {
                self.store.del(&record.key).await?;
                Ok(true)
            }
            Some(current) => {
                tracing::warn!(
                    key = %record.key,
                    held_by = %current.owner,
                    releasing = %record.owner,
                    "lock owner mismatch on release"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Record that a step index was attempted. Returns `true` when this
    /// call set the marker, `false` when it already existed.
    pub async fn mark_step_done(
        &self,
        execution_id: Uuid,
        step_index: usize,
    ) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(
                &keys::step_done(execution_id, step_index),
                &Utc::now().to_rfc3339(),
                STEP_DONE_TTL,
            )
            .await
    }

    /// Clear a step marker ahead of a deliberate retry. A retry is a new
    /// real execution attempt, so the redelivery must be allowed to
    /// invoke the tool again; only the retry and repair paths call this.
    pub async fn reset_step_marker(
        &self,
        execution_id: Uuid,
        step_index: usize,
    ) -> Result<bool, StoreError> {
        self.store
            .del(&keys::step_done(execution_id, step_index))
            .await
    }

    pub async fn is_step_done(
        &self,
        execution_id: Uuid,
        step_index: usize,
    ) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&keys::step_done(execution_id, step_index))
            .await?
            .is_some())
    }
}
