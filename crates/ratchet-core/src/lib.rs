//! ratchet engine: a durable, serverless-friendly saga orchestrator.
//!
//! One invocation advances one step. The pieces: distributed locks and
//! write-once idempotency markers ([`lock`]), signed delayed webhooks
//! ([`queue`], [`signing`]), signed pub/sub with optional causal ordering
//! ([`events`]), the transactional outbox relay ([`outbox_relay`]), timed
//! cancellable tool dispatch ([`invoker`]), the single-step workflow
//! machine with LIFO compensation ([`machine`]), confirmation gating
//! ([`confirm`], [`risk`]), failover policies ([`failover`]), heartbeat
//! recovery ([`heartbeat`]), dead-letter reconciliation ([`reconcile`]),
//! and schema-drift detection across yields ([`versioning`]).

pub mod config;
pub mod confirm;
pub mod error;
pub mod events;
pub mod failover;
pub mod heartbeat;
pub mod invoker;
pub mod lock;
pub mod machine;
pub mod messages;
pub mod outbox_relay;
pub mod queue;
pub mod reconcile;
pub mod risk;
pub mod services;
pub mod signing;
pub mod trace;
pub mod versioning;

pub use config::{EngineConfig, Environment};
pub use error::EngineError;
pub use machine::{StepOutcome, WorkflowMachine};
pub use services::Services;
pub use trace::TraceContext;
