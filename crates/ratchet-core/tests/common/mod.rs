#![allow(dead_code)]
//! Shared harness for engine integration tests.
//!
//! Wires the machine against the in-memory store, the recording queue
//! driver, and the in-process bus, with scriptable tools. Tests play the
//! role of the external queue: they drain recorded publishes and feed
//! execute-step deliveries back into the machine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use uuid::Uuid;

use ratchet_core::config::EngineConfig;
use ratchet_core::events::{EventEnvelope, EventName, InProcessEventBus};
use ratchet_core::invoker::{
    InvocationContext, Tool, ToolError, ToolOutput, ToolRegistry, ToolSchema,
};
use ratchet_core::machine::{StepOutcome, WorkflowMachine};
use ratchet_core::queue::{QueueMessage, RecordingQueueDriver};
use ratchet_core::services::Services;
use ratchet_core::trace::TraceContext;
use ratchet_store::MemoryStore;
use ratchet_store::models::{Intent, Plan, PlanStep};

// ---------------------------------------------------------------------------
// Scriptable tools
// ---------------------------------------------------------------------------

pub enum Behavior {
    /// Always succeed with this output.
    Succeed(Value),
    /// Succeed and return a dynamic compensation request.
    SucceedWithCompensation { tool: String, output: Value },
    /// Always fail with this error message.
    Fail(String),
    /// Fail with the message for the first `n` calls, then succeed.
    FailTimes { n: u32, error: String, then: Value },
}

/// A scripted tool that counts its invocations and records call order in
/// a shared journal.
pub struct ScriptedTool {
    name: String,
    behavior: Behavior,
    fields: Vec<(String, bool)>,
    calls: AtomicU32,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTool {
    pub fn new(
        name: &str,
        behavior: Behavior,
        journal: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            behavior,
            fields: Vec::new(),
            calls: AtomicU32::new(0),
            journal,
        })
    }

    /// Same, with a declared parameter schema (drift tests).
    pub fn with_fields(
        name: &str,
        behavior: Behavior,
        fields: &[(&str, bool)],
        journal: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            behavior,
            fields: fields
                .iter()
                .map(|(n, r)| (n.to_string(), *r))
                .collect(),
            calls: AtomicU32::new(0),
            journal,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name.clone(),
            self.fields
                .iter()
                .map(|(n, r)| (n.as_str(), *r))
                .collect(),
        )
    }

    async fn call(
        &self,
        _params: Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal
            .lock()
            .expect("journal poisoned")
            .push(self.name.clone());

        match &self.behavior {
            Behavior::Succeed(output) => Ok(ToolOutput::new(output.clone())),
            Behavior::SucceedWithCompensation { tool, output } => {
                Ok(ToolOutput::new(output.clone()).with_compensation(tool, Map::new()))
            }
            Behavior::Fail(error) => Err(ToolError(error.clone())),
            Behavior::FailTimes { n, error, then } => {
                if call <= *n {
                    Err(ToolError(error.clone()))
                } else {
                    Ok(ToolOutput::new(then.clone()))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<RecordingQueueDriver>,
    pub machine: WorkflowMachine,
    events: Mutex<tokio::sync::broadcast::Receiver<(String, EventEnvelope)>>,
}

impl Harness {
    pub fn new(tools: Vec<Arc<ScriptedTool>>) -> Self {
        Self::with_config(tools, EngineConfig::default())
    }

    pub fn with_config(tools: Vec<Arc<ScriptedTool>>, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::on_store(tools, config, store)
    }

    /// Build a harness over an existing store (drift tests re-wire the
    /// registry while keeping persisted state).
    pub fn on_store(
        tools: Vec<Arc<ScriptedTool>>,
        config: EngineConfig,
        store: Arc<MemoryStore>,
    ) -> Self {
        let queue = RecordingQueueDriver::new();
        let bus = Arc::new(InProcessEventBus::new(store.clone()));
        let events = Mutex::new(bus.subscribe());

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }

        let services = Services::new(
            config,
            store.clone(),
            queue.clone(),
            bus,
            Arc::new(registry),
        );
        Self {
            store,
            queue,
            machine: WorkflowMachine::new(Arc::new(services)),
            events,
        }
    }

    /// Everything published on the bus so far, in order.
    pub fn collected_events(&self) -> Vec<EventEnvelope> {
        let mut rx = self.events.lock().expect("events poisoned");
        let mut out = Vec::new();
        while let Ok((_, envelope)) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Names of collected events, for order assertions.
    pub fn event_names(&self) -> Vec<EventName> {
        self.collected_events().iter().map(|e| e.event).collect()
    }

    /// Play the external queue: repeatedly drain recorded execute-step
    /// publishes and feed them back into the machine, until the queue
    /// goes quiet. Heartbeat-check messages are dropped (tests trigger
    /// heartbeats explicitly). Returns the outcomes in delivery order.
    pub async fn drive(&self, limit: usize) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..limit {
            let deliveries: Vec<QueueMessage> = self
                .queue
                .drain()
                .into_iter()
                .filter(|m| m.url.ends_with("/engine/execute-step"))
                .collect();
            if deliveries.is_empty() {
                break;
            }
            for message in deliveries {
                let execution_id: Uuid =
                    serde_json::from_value(message.body["execution_id"].clone())
                        .expect("execute-step body carries execution_id");
                let start_index = message.body["start_step_index"].as_u64().map(|i| i as usize);
                let outcome = self
                    .machine
                    .execute_step(execution_id, start_index, TraceContext::new())
                    .await
                    .expect("execute_step should not error in drive()");
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn step(id: &str, index: usize, tool: &str, deps: &[&str]) -> PlanStep {
    PlanStep {
        id: id.to_string(),
        index,
        tool_name: tool.to_string(),
        parameters: Map::new(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        requires_confirmation: false,
        timeout_ms: 2_000,
        estimated_tokens: 0,
    }
}

/// A linear plan: each step depends on the previous one.
pub fn linear_plan(tools: &[&str]) -> Plan {
    Plan {
        steps: tools
            .iter()
            .enumerate()
            .map(|(i, tool)| {
                let id = format!("s{i}");
                let deps: Vec<String> = if i == 0 {
                    vec![]
                } else {
                    vec![format!("s{}", i - 1)]
                };
                PlanStep {
                    id,
                    index: i,
                    tool_name: tool.to_string(),
                    parameters: Map::new(),
                    dependencies: deps,
                    requires_confirmation: false,
                    timeout_ms: 2_000,
                    estimated_tokens: 0,
                }
            })
            .collect(),
    }
}

pub fn intent(intent_type: &str, confidence: f64) -> Intent {
    Intent {
        raw_text: format!("please handle my {intent_type}"),
        intent_type: intent_type.to_string(),
        confidence,
        parameters: Map::new(),
    }
}

pub fn journal() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn ok(value: Value) -> Behavior {
    Behavior::Succeed(value)
}

pub fn ok_simple() -> Behavior {
    Behavior::Succeed(json!({ "ok": true }))
}
