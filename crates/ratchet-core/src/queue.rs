//! Delayed at-least-once HTTP delivery.
//!
//! The engine never loops in-process: progress is made by the queue
//! re-entering it over HTTP. Every published body is signed
//! ([`crate::signing`]); the receiving side verifies signature age and key.
//! Drivers never retry synchronously -- a failed publish surfaces
//! [`EngineError::Queue`] and the caller decides.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::signing::{SIGNATURE_HEADER, SigningKeys, TIMESTAMP_HEADER, signature_headers};

/// One message bound for a webhook target.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Destination URL the queue will POST to.
    pub url: String,
    pub body: Value,
    /// Extra headers to deliver with the body (trace ids, internal key).
    pub headers: Vec<(String, String)>,
    /// Delivery delay; `None` means as soon as possible.
    pub delay: Option<Duration>,
}

impl QueueMessage {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
            headers: Vec::new(),
            delay: None,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Abstract queue producer. Returns the queue-assigned message id.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> Result<String, EngineError>;
}

// ---------------------------------------------------------------------------
// HTTP driver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PublishResponse {
    message_id: String,
}

/// Production driver: hands messages to an external delayed-delivery queue
/// service which performs the actual webhook POST with backoff retries.
pub struct HttpQueueDriver {
    client: reqwest::Client,
    base_url: String,
    token: String,
    keys: SigningKeys,
}

impl HttpQueueDriver {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, keys: SigningKeys) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            keys,
        }
    }
}

#[async_trait]
impl QueueDriver for HttpQueueDriver {
    async fn publish(&self, message: QueueMessage) -> Result<String, EngineError> {
        let QueueMessage {
            url,
            body,
            mut headers,
            delay,
        } = message;

        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| EngineError::Queue(format!("failed to encode body: {e}")))?;
        let (timestamp, signature) = signature_headers(&self.keys, &body_bytes);
        headers.push((TIMESTAMP_HEADER.to_string(), timestamp));
        headers.push((SIGNATURE_HEADER.to_string(), signature));

        let delay_seconds = delay.map(|d| d.as_secs()).unwrap_or(0);
        let header_map: serde_json::Map<String, Value> = headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let payload = serde_json::json!({
            "url": &url,
            "body": body,
            "headers": header_map,
            "delay_seconds": delay_seconds,
        });

        let response = self
            .client
            .post(format!("{}/v1/publish", self.base_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Queue(format!("publish request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Queue(format!(
                "queue rejected publish: {}",
                response.status()
            )));
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Queue(format!("invalid publish response: {e}")))?;

        tracing::debug!(
            message_id = %parsed.message_id,
            url = %url,
            delay_seconds,
            "published queue message"
        );
        Ok(parsed.message_id)
    }
}

// ---------------------------------------------------------------------------
// Loopback driver
// ---------------------------------------------------------------------------

/// Development driver: delivers directly from a spawned task after the
/// requested delay. Permitted only outside production -- there, missing
/// queue credentials for the execute-step path is a fatal
/// misconfiguration (enforced by config validation).
pub struct LoopbackQueueDriver {
    client: reqwest::Client,
    keys: SigningKeys,
}

impl LoopbackQueueDriver {
    pub fn new(keys: SigningKeys) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys,
        }
    }
}

#[async_trait]
impl QueueDriver for LoopbackQueueDriver {
    async fn publish(&self, message: QueueMessage) -> Result<String, EngineError> {
        let message_id = Uuid::new_v4().to_string();
        let client = self.client.clone();
        let body_bytes = serde_json::to_vec(&message.body)
            .map_err(|e| EngineError::Queue(format!("failed to encode body: {e}")))?;
        let keys = self.keys.clone();
        let id = message_id.clone();

        tokio::spawn(async move {
            if let Some(delay) = message.delay {
                tokio::time::sleep(delay).await;
            }
            // Sign at send time so the timestamp window starts at delivery.
            let (timestamp, signature) = signature_headers(&keys, &body_bytes);
            let mut request = client
                .post(&message.url)
                .header("content-type", "application/json")
                .header(TIMESTAMP_HEADER, timestamp)
                .header(SIGNATURE_HEADER, signature)
                .body(body_bytes);
            for (name, value) in &message.headers {
                request = request.header(name, value);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(
                        message_id = %id,
                        url = %message.url,
                        status = %response.status(),
                        "loopback delivery rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %id,
                        url = %message.url,
                        error = %e,
                        "loopback delivery failed"
                    );
                }
            }
        });

        Ok(message_id)
    }
}

// ---------------------------------------------------------------------------
// Recording driver
// ---------------------------------------------------------------------------

/// Capture-only driver for tests and dry runs: publishes are recorded,
/// never delivered.
#[derive(Default)]
pub struct RecordingQueueDriver {
    messages: Mutex<Vec<QueueMessage>>,
}

impl RecordingQueueDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<QueueMessage> {
        self.messages.lock().expect("recorder poisoned").clone()
    }

    /// Remove and return everything published so far.
    pub fn drain(&self) -> Vec<QueueMessage> {
        std::mem::take(&mut *self.messages.lock().expect("recorder poisoned"))
    }
}

#[async_trait]
impl QueueDriver for RecordingQueueDriver {
    async fn publish(&self, message: QueueMessage) -> Result<String, EngineError> {
        self.messages
            .lock()
            .expect("recorder poisoned")
            .push(message);
        Ok(Uuid::new_v4().to_string())
    }
}
