//! Timed, cancellable tool execution.
//!
//! Tools register in a [`ToolRegistry`] as trait objects (local in-process
//! implementations or [`remote::RemoteTool`] HTTP dispatchers). The
//! [`ToolInvoker`] applies each tool's parameter-alias map, enforces the
//! step deadline independently of the transport, honors the cancel token,
//! and normalizes every outcome -- error, panic-adjacent failure, or
//! timeout -- into a [`ToolResult`]. Tools must be idempotent under the
//! `(execution_id, step_id)` pair, which rides on every dispatch.

pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use ratchet_store::models::{FieldSpec, ToolFingerprint};

use crate::trace::TraceContext;

/// Declared shape of a tool's parameters, hashed into version
/// fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, fields: Vec<(&str, bool)>) -> Self {
        Self {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, required)| FieldSpec {
                    name: name.to_owned(),
                    required,
                })
                .collect(),
        }
    }

    /// Stable content hash over the canonical field list.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        let mut fields = self.fields.clone();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        for field in &fields {
            hasher.update(b"|");
            hasher.update(field.name.as_bytes());
            hasher.update(if field.required { b":r" } else { b":o" });
        }
        hex::encode(hasher.finalize())
    }

    pub fn fingerprint(&self) -> ToolFingerprint {
        ToolFingerprint {
            hash: self.hash(),
            fields: self.fields.clone(),
        }
    }
}

/// A compensation the tool wants registered for this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationRequest {
    pub tool: String,
    pub parameters: Map<String, Value>,
}

/// Successful tool output plus an optional dynamic compensation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: Value,
    pub compensation: Option<CompensationRequest>,
}

impl ToolOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            compensation: None,
        }
    }

    pub fn with_compensation(mut self, tool: &str, parameters: Map<String, Value>) -> Self {
        self.compensation = Some(CompensationRequest {
            tool: tool.to_owned(),
            parameters,
        });
        self
    }
}

/// Failure reported by a tool. The invoker flattens this to a message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ToolError(pub String);

/// Identity and cancellation context for one dispatch.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub execution_id: Uuid,
    pub step_id: String,
    pub cancel: CancellationToken,
    pub trace: TraceContext,
}

/// An invocable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    /// Alias-to-canonical parameter renames applied before dispatch
    /// (e.g. `reservation_time` -> `time`).
    fn aliases(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Statically registered compensation tool, if any. Dynamic
    /// compensations returned from [`Tool::call`] take precedence.
    fn compensation_tool(&self) -> Option<String> {
        None
    }

    async fn call(
        &self,
        params: Map<String, Value>,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Named lookup table of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Current fingerprint of every registered tool, keyed by name.
    pub fn fingerprints(&self) -> std::collections::BTreeMap<String, ToolFingerprint> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.schema().fingerprint()))
            .collect()
    }
}

/// Normalized result of one dispatch.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub compensation: Option<CompensationRequest>,
}

impl ToolResult {
    fn failure(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            latency_ms: started.elapsed().as_millis() as u64,
            compensation: None,
        }
    }
}

/// The invoker. Cheap to clone; holds the registry and the cancel grace.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    /// How long a cancelled or timed-out tool gets to observe the cancel
    /// token before its future is dropped.
    cancel_grace: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            cancel_grace: Duration::from_millis(250),
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Dispatch `tool_name`, enforcing `timeout` regardless of transport.
    ///
    /// Never returns an `Err`: unknown tools, tool errors, cancellations,
    /// and timeouts all normalize into a failed [`ToolResult`].
    pub async fn invoke(
        &self,
        tool_name: &str,
        params: Map<String, Value>,
        timeout: Duration,
        ctx: InvocationContext,
    ) -> ToolResult {
        let span = tracing::info_span!(
            "tool_invoke",
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            tool_name = %tool_name,
        );
        self.invoke_inner(tool_name, params, timeout, ctx)
            .instrument(span)
            .await
    }

    async fn invoke_inner(
        &self,
        tool_name: &str,
        params: Map<String, Value>,
        timeout: Duration,
        ctx: InvocationContext,
    ) -> ToolResult {
        let started = Instant::now();

        let Some(tool) = self.registry.get(tool_name) else {
            return ToolResult::failure(format!("tool not registered: {tool_name}"), started);
        };

        let params = apply_aliases(params, &tool.aliases());
        let cancel = ctx.cancel.clone();

        let call = tool.call(params, &ctx);
        tokio::pin!(call);

        let first = tokio::select! {
            result = &mut call => Some(result),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => None,
        };

        let result = match first {
            Some(result) => result,
            None => {
                // Deadline or external cancel: signal, then give the tool a
                // bounded grace to observe it.
                cancel.cancel();
                match tokio::time::timeout(self.cancel_grace, &mut call).await {
                    Ok(result) => result,
                    Err(_) => {
                        let reason = if started.elapsed() >= timeout {
                            format!("TIMEOUT: {tool_name} exceeded {}ms", timeout.as_millis())
                        } else {
                            format!("CANCELLED: {tool_name} was cancelled")
                        };
                        tracing::warn!(latency_ms = started.elapsed().as_millis() as u64, "{reason}");
                        return ToolResult::failure(reason, started);
                    }
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                tracing::debug!(latency_ms, "tool call succeeded");
                ToolResult {
                    success: true,
                    output: Some(output.output),
                    error: None,
                    latency_ms,
                    compensation: output.compensation,
                }
            }
            Err(e) => {
                tracing::warn!(latency_ms, error = %e, "tool call failed");
                ToolResult {
                    success: false,
                    output: None,
                    error: Some(e.to_string()),
                    latency_ms,
                    compensation: None,
                }
            }
        }
    }
}

/// Rename aliased parameters to their canonical names. A canonical key
/// already present wins over its alias.
fn apply_aliases(
    mut params: Map<String, Value>,
    aliases: &[(String, String)],
) -> Map<String, Value> {
    for (alias, canonical) in aliases {
        if params.contains_key(canonical) {
            params.remove(alias);
            continue;
        }
        if let Some(value) = params.remove(alias) {
            params.insert(canonical.clone(), value);
        }
    }
    params
}
