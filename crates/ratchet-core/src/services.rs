//! The engine's dependency bundle.
//!
//! No static singletons: everything the workflow machine touches is an
//! explicit field here, built once at boot and shared behind an `Arc`.
//! Tests substitute fakes through the `QueueDriver`/`EventBus`/`Tool`
//! trait objects.

use std::sync::Arc;

use ratchet_store::ExecutionRepository;
use ratchet_store::store::StateStore;

use crate::config::EngineConfig;
use crate::confirm::ConfirmationService;
use crate::events::EventBus;
use crate::failover::FailoverEngine;
use crate::heartbeat::HeartbeatService;
use crate::invoker::{ToolInvoker, ToolRegistry};
use crate::lock::LockService;
use crate::queue::QueueDriver;
use crate::risk::RiskPolicy;
use crate::versioning::SchemaVersionGuard;

/// Everything the machine and HTTP layer need, wired together.
pub struct Services {
    pub config: EngineConfig,
    pub repo: ExecutionRepository,
    pub locks: LockService,
    pub queue: Arc<dyn QueueDriver>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub invoker: ToolInvoker,
    pub confirmations: ConfirmationService,
    pub heartbeats: HeartbeatService,
    pub failover: FailoverEngine,
    pub versions: SchemaVersionGuard,
    pub risk: RiskPolicy,
}

impl Services {
    /// Wire the bundle from its leaves. The failover engine defaults to
    /// the built-in policy set; use [`Services::with_failover`] to swap it.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueDriver>,
        bus: Arc<dyn EventBus>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let repo = ExecutionRepository::new(Arc::clone(&store));
        let locks = LockService::new(Arc::clone(&store), config.lock.clone());
        let invoker = ToolInvoker::new(Arc::clone(&registry));
        let confirmations = ConfirmationService::new(repo.clone(), config.confirmation_ttl());
        let heartbeats = HeartbeatService::new(
            repo.clone(),
            Arc::clone(&queue),
            Arc::clone(&bus),
            config.engine_base_url.clone(),
            config.heartbeat_delay(),
            config.reconcile.max_recovery_attempts,
        );
        let versions =
            SchemaVersionGuard::new(repo.clone(), env!("CARGO_PKG_VERSION").to_string());
        let risk = RiskPolicy::new(config.high_risk_tools.clone());

        Self {
            config,
            repo,
            locks,
            queue,
            bus,
            registry,
            invoker,
            confirmations,
            heartbeats,
            failover: FailoverEngine::with_defaults(),
            versions,
            risk,
        }
    }

    pub fn with_failover(mut self, failover: FailoverEngine) -> Self {
        self.failover = failover;
        self
    }
}
