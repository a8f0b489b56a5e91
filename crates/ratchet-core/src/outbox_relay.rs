//! Transactional outbox relay.
//!
//! Business transactions commit rows into the `outbox` table; a database
//! trigger (or any sidecar) fires an HTTP call through the queue carrying
//! `{outbox_id, execution_id, event_type}` to `/engine/outbox-relay`,
//! whose handler acknowledges by marking the row delivered. The fallback
//! poller here re-enqueues rows that stayed `pending` -- at-least-once
//! end to end; consumers dedupe on the outbox id.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use ratchet_store::StoreError;
use ratchet_store::outbox;

use crate::error::EngineError;
use crate::queue::{QueueDriver, QueueMessage};
use crate::trace::TraceContext;

/// Body of a relay delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub outbox_id: Uuid,
    pub execution_id: Uuid,
    pub event_type: String,
}

/// Relay endpoint logic plus the fallback poller.
pub struct OutboxRelay {
    pool: PgPool,
    queue: Arc<dyn QueueDriver>,
    /// Where the poller re-enqueues pending rows (the relay endpoint).
    relay_url: String,
    /// Relay attempts before a row flips to `failed`.
    max_attempts: i32,
}

impl OutboxRelay {
    pub fn new(pool: PgPool, queue: Arc<dyn QueueDriver>, relay_url: impl Into<String>) -> Self {
        Self {
            pool,
            queue,
            relay_url: relay_url.into(),
            max_attempts: 10,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Handle one delivery at the relay endpoint: acknowledge the row.
    ///
    /// Returns `true` when this call transitioned the row to `delivered`,
    /// `false` for redeliveries of an already-acknowledged row.
    pub async fn process_delivery(&self, request: &RelayRequest) -> Result<bool, EngineError> {
        let row = outbox::get_outbox_row(&self.pool, request.outbox_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("outbox row {}", request.outbox_id))
            })?;

        if row.execution_id != request.execution_id {
            return Err(EngineError::Validation(format!(
                "outbox row {} belongs to a different execution",
                request.outbox_id
            )));
        }

        let updated = outbox::mark_delivered(&self.pool, request.outbox_id)
            .await
            .map_err(db_err)?;
        if updated > 0 {
            tracing::info!(
                outbox_id = %request.outbox_id,
                execution_id = %request.execution_id,
                event_type = %request.event_type,
                "outbox row delivered"
            );
            Ok(true)
        } else {
            tracing::debug!(
                outbox_id = %request.outbox_id,
                "outbox row already delivered, acknowledging duplicate"
            );
            Ok(false)
        }
    }

    /// One poller pass: re-enqueue pending rows oldest-first. Returns the
    /// number of rows published.
    pub async fn poll_once(&self, trace: TraceContext) -> Result<usize, EngineError> {
        let rows = outbox::fetch_pending(&self.pool, 100).await.map_err(db_err)?;
        let mut published = 0usize;

        for row in rows {
            let request = RelayRequest {
                outbox_id: row.id,
                execution_id: row.execution_id,
                event_type: row.event_type.clone(),
            };
            let body = serde_json::to_value(&request)
                .map_err(|e| EngineError::Queue(format!("failed to encode relay body: {e}")))?;

            match self
                .queue
                .publish(
                    QueueMessage::new(self.relay_url.clone(), body)
                        .with_headers(trace.headers()),
                )
                .await
            {
                Ok(_) => {
                    published += 1;
                    outbox::record_attempt(&self.pool, row.id, self.max_attempts)
                        .await
                        .map_err(db_err)?;
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %row.id,
                        error = %e,
                        "failed to re-enqueue outbox row"
                    );
                }
            }
        }

        if published > 0 {
            tracing::info!(published, "outbox poller re-enqueued pending rows");
        }
        Ok(published)
    }

    /// Run the fallback poller until cancelled.
    pub async fn run_poller(
        &self,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            if let Err(e) = self.poll_once(TraceContext::new()).await {
                tracing::error!(error = %e, "outbox poll errored");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

fn db_err(e: anyhow::Error) -> EngineError {
    EngineError::Store(StoreError::Unavailable(format!("outbox database: {e:#}")))
}
