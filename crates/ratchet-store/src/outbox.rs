//! Transactional outbox table.
//!
//! Business code inserts a row in the same transaction as its own writes;
//! the relay (trigger-driven endpoint or fallback poller) later carries the
//! row onto the queue and marks it delivered. Delivery is at-least-once:
//! consumers dedupe on `(execution_id, event_type, outbox_id)`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(OutboxStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OutboxStatus`] string.
#[derive(Debug, Clone)]
pub struct OutboxStatusParseError(pub String);

impl fmt::Display for OutboxStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid outbox status: {:?}", self.0)
    }
}

impl std::error::Error for OutboxStatusParseError {}

/// One committed business event awaiting relay.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Insert a new pending row. Callers run this inside their own transaction
/// via the pool, or pass a transaction-scoped executor.
pub async fn insert_outbox_row(
    pool: &PgPool,
    execution_id: Uuid,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<OutboxRow> {
    let row = sqlx::query_as::<_, OutboxRow>(
        "INSERT INTO outbox (execution_id, event_type, payload) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(event_type)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to insert outbox row")?;

    Ok(row)
}

/// Fetch a single row by id.
pub async fn get_outbox_row(pool: &PgPool, id: Uuid) -> Result<Option<OutboxRow>> {
    let row = sqlx::query_as::<_, OutboxRow>("SELECT * FROM outbox WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch outbox row")?;

    Ok(row)
}

/// Pending rows oldest-first, up to `limit`. The fallback poller feeds on
/// this.
pub async fn fetch_pending(pool: &PgPool, limit: i64) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        "SELECT * FROM outbox WHERE status = 'pending' \
         ORDER BY created_at ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch pending outbox rows")?;

    Ok(rows)
}

/// Mark a row delivered. Returns the number of rows updated (0 when the
/// row was already delivered -- redeliveries are expected).
pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox SET status = 'delivered', delivered_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark outbox row delivered")?;

    Ok(result.rows_affected())
}

/// Count a failed relay attempt; rows past `max_attempts` flip to `failed`.
pub async fn record_attempt(pool: &PgPool, id: Uuid, max_attempts: i32) -> Result<()> {
    sqlx::query(
        "UPDATE outbox SET attempts = attempts + 1, \
         status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE status END \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(max_attempts)
    .execute(pool)
    .await
    .context("failed to record outbox attempt")?;

    Ok(())
}
