//! The state-store abstraction: a small KV contract with TTLs, atomic
//! set-if-absent, counters, sorted collections, and a cursored prefix scan.
//!
//! Backends implement [`StateStore`]; everything above it (locks, the
//! workflow machine, the reconciler) is backend-agnostic. Store failures
//! surface as [`StoreError::Unavailable`] and are never masked here --
//! higher layers decide whether to retry or escalate.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors surfaced by a state-store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the operation.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// A stored document failed to decode.
    #[error("stored value at {key} is not valid JSON: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Backend-agnostic state-store operations.
///
/// Keys are flat strings built by the [`crate::keys`] module. Values are
/// opaque strings; JSON codecs live in [`get_json`]/[`put_json`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a key, optionally with a TTL. Overwrites any existing value.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomic SET-NX-EX: set the key only if absent. Returns `true` when
    /// this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Increment an integer counter, creating it at 0 first. Returns the
    /// new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Reset a key's TTL. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add (or re-score) a member of a sorted collection.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Members by ascending score, rank range `[start, stop]` inclusive;
    /// negative ranks count from the end (`-1` = last).
    async fn zrange(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, StoreError>;

    /// Remove a member. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove every member with score in `[min, max]`. Returns the count
    /// removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Cursored key scan for `prefix*`. A returned cursor of 0 means the
    /// scan is complete. Backends may return fewer (or more) than `count`
    /// keys per page.
    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;
}

/// Fetch and JSON-decode a document.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_owned(),
                source,
            }),
    }
}

/// JSON-encode and store a document.
pub async fn put_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| StoreError::Unavailable(format!("failed to encode {key}: {e}")))?;
    store.put(key, &raw, ttl).await
}
