//! Trace and correlation propagation.
//!
//! Every entry point opens a `tracing` span carrying `execution_id`,
//! `step_id`, and `tool_name` attributes; the trace and correlation ids
//! ride the `x-trace-id` / `x-correlation-id` headers on every queue
//! publish and event envelope. No business data goes into span attributes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const INTERNAL_KEY_HEADER: &str = "x-internal-system-key";
pub const EXECUTION_ID_HEADER: &str = "x-execution-id";
pub const STEP_ID_HEADER: &str = "x-step-id";

/// Ids tying one saga's invocations together across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub correlation_id: Uuid,
}

impl TraceContext {
    /// Fresh ids for a new entry into the system.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Continue a trace from inbound headers; missing or malformed ids
    /// start a fresh trace rather than failing the request.
    pub fn from_headers(trace_id: Option<&str>, correlation_id: Option<&str>) -> Self {
        let parse = |v: Option<&str>| v.and_then(|s| Uuid::parse_str(s).ok());
        match (parse(trace_id), parse(correlation_id)) {
            (Some(trace_id), Some(correlation_id)) => Self {
                trace_id,
                correlation_id,
            },
            (Some(trace_id), None) => Self {
                trace_id,
                correlation_id: Uuid::new_v4(),
            },
            _ => Self::new(),
        }
    }

    /// Header pairs to attach to outbound publishes.
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            (TRACE_ID_HEADER.to_string(), self.trace_id.to_string()),
            (
                CORRELATION_ID_HEADER.to_string(),
                self.correlation_id.to_string(),
            ),
        ]
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_headers_continues_existing_trace() {
        let trace_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let ctx = TraceContext::from_headers(
            Some(&trace_id.to_string()),
            Some(&correlation_id.to_string()),
        );
        assert_eq!(ctx.trace_id, trace_id);
        assert_eq!(ctx.correlation_id, correlation_id);
    }

    #[test]
    fn from_headers_tolerates_garbage() {
        let ctx = TraceContext::from_headers(Some("not-a-uuid"), None);
        // A fresh trace is started instead of erroring.
        assert_ne!(ctx.trace_id, Uuid::nil());
    }

    #[test]
    fn headers_roundtrip() {
        let ctx = TraceContext::new();
        let headers = ctx.headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };
        let back = TraceContext::from_headers(get(TRACE_ID_HEADER), get(CORRELATION_ID_HEADER));
        assert_eq!(back, ctx);
    }
}
