//! Signed pub/sub with optional causal ordering.
//!
//! Publishers wrap payloads in a short-lived signed envelope
//! `{event, data, ts}`. With `ordered` set, the envelope additionally
//! carries a per-scope monotonically increasing sequence id (from the
//! state store's `seq:{scope}` counter) and a Lamport timestamp.
//! Subscribers that care about order feed envelopes through
//! [`ordering::OrderedBuffer`]. Delivery is at-least-once everywhere;
//! consumers dedupe on `(execution_id, event, sequence_id)`.

pub mod ordering;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use ratchet_store::store::StateStore;

use crate::error::EngineError;
use crate::signing::{SIGNATURE_HEADER, SigningKeys, TIMESTAMP_HEADER, signature_headers};
use crate::trace::TraceContext;

/// Engine event vocabulary, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    ConfirmationRequested,
    ConfirmationAccepted,
    CompensationStarted,
    CompensationCompleted,
    CompensationRetry,
    WorkflowResume,
    ReplanRequested,
    DriftDetected,
    HeartbeatRecovered,
    ExecutionCompleted,
    ExecutionFailed,
    SagaManualInterventionRequired,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::ConfirmationRequested => "CONFIRMATION_REQUESTED",
            Self::ConfirmationAccepted => "CONFIRMATION_ACCEPTED",
            Self::CompensationStarted => "COMPENSATION_STARTED",
            Self::CompensationCompleted => "COMPENSATION_COMPLETED",
            Self::CompensationRetry => "COMPENSATION_RETRY",
            Self::WorkflowResume => "WORKFLOW_RESUME",
            Self::ReplanRequested => "REPLAN_REQUESTED",
            Self::DriftDetected => "DRIFT_DETECTED",
            Self::HeartbeatRecovered => "HEARTBEAT_RECOVERED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::SagaManualInterventionRequired => "SAGA_MANUAL_INTERVENTION_REQUIRED",
        };
        f.write_str(s)
    }
}

/// The signed wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: EventName,
    pub data: Value,
    pub ts: DateTime<Utc>,
    /// Per-scope sequence id; present only for ordered publishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<i64>,
    /// Lamport timestamp; present only for ordered publishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lamport: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

/// Publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Attach a per-scope sequence id and Lamport timestamp.
    pub ordered: bool,
    pub trace: Option<TraceContext>,
}

impl PublishOptions {
    pub fn ordered(trace: TraceContext) -> Self {
        Self {
            ordered: true,
            trace: Some(trace),
        }
    }

    pub fn unordered(trace: TraceContext) -> Self {
        Self {
            ordered: false,
            trace: Some(trace),
        }
    }
}

/// Abstract event publisher.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        event: EventName,
        data: Value,
        opts: PublishOptions,
    ) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Broadcast-channel bus for development and tests. Subscribers receive
/// `(channel, envelope)` pairs.
pub struct InProcessEventBus {
    store: Arc<dyn StateStore>,
    tx: broadcast::Sender<(String, EventEnvelope)>,
    lamport: AtomicI64,
}

impl InProcessEventBus {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            store,
            tx,
            lamport: AtomicI64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, EventEnvelope)> {
        self.tx.subscribe()
    }

    /// Subscriber as a stream. A lagging subscriber silently loses the
    /// oldest events, consistent with at-least-once consumers that must
    /// tolerate gaps anyway.
    pub fn subscribe_stream(
        &self,
    ) -> impl futures::Stream<Item = (String, EventEnvelope)> + Send {
        use tokio_stream::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| item.ok())
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(
        &self,
        channel: &str,
        event: EventName,
        data: Value,
        opts: PublishOptions,
    ) -> Result<(), EngineError> {
        let (sequence_id, lamport) = if opts.ordered {
            let seq = self
                .store
                .incr(&ratchet_store::keys::sequence(channel))
                .await?;
            let previous = self.lamport.fetch_max(seq, Ordering::SeqCst);
            let lamport = previous.max(seq) + 1;
            self.lamport.fetch_max(lamport, Ordering::SeqCst);
            (Some(seq), Some(lamport))
        } else {
            (None, None)
        };

        let envelope = EventEnvelope {
            event,
            data,
            ts: Utc::now(),
            sequence_id,
            lamport,
            trace: opts.trace,
        };
        // No subscribers is fine; events are observability, not control
        // flow.
        let _ = self.tx.send((channel.to_owned(), envelope));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP bus
// ---------------------------------------------------------------------------

/// Remote bus: POSTs signed envelopes to the configured publish endpoint.
pub struct HttpEventBus {
    client: reqwest::Client,
    store: Arc<dyn StateStore>,
    url: String,
    api_key: String,
    keys: SigningKeys,
    lamport: AtomicI64,
}

impl HttpEventBus {
    pub fn new(
        store: Arc<dyn StateStore>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        keys: SigningKeys,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            url: url.into(),
            api_key: api_key.into(),
            keys,
            lamport: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn publish(
        &self,
        channel: &str,
        event: EventName,
        data: Value,
        opts: PublishOptions,
    ) -> Result<(), EngineError> {
        let (sequence_id, lamport) = if opts.ordered {
            let seq = self
                .store
                .incr(&ratchet_store::keys::sequence(channel))
                .await?;
            let previous = self.lamport.fetch_max(seq, Ordering::SeqCst);
            let lamport = previous.max(seq) + 1;
            self.lamport.fetch_max(lamport, Ordering::SeqCst);
            (Some(seq), Some(lamport))
        } else {
            (None, None)
        };

        let envelope = EventEnvelope {
            event,
            data,
            ts: Utc::now(),
            sequence_id,
            lamport,
            trace: opts.trace,
        };
        let body = serde_json::to_vec(&serde_json::json!({
            "channel": channel,
            "envelope": envelope,
        }))
        .map_err(|e| EngineError::Bus(format!("failed to encode envelope: {e}")))?;

        let (timestamp, signature) = signature_headers(&self.keys, &body);
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature);
        if let Some(trace) = &opts.trace {
            for (name, value) in trace.headers() {
                request = request.header(name, value);
            }
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::Bus(format!("publish failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Bus(format!(
                "bus rejected publish: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
