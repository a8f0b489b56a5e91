mod config;
mod serve;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ratchet_core::events::{EventBus, HttpEventBus, InProcessEventBus};
use ratchet_core::invoker::remote::RemoteTool;
use ratchet_core::invoker::{ToolRegistry, ToolSchema};
use ratchet_core::machine::WorkflowMachine;
use ratchet_core::outbox_relay::OutboxRelay;
use ratchet_core::queue::{HttpQueueDriver, LoopbackQueueDriver, QueueDriver};
use ratchet_core::reconcile::Reconciler;
use ratchet_core::services::Services;
use ratchet_core::signing::SigningKeys;
use ratchet_core::trace::TraceContext;
use ratchet_store::{ExecutionRepository, RedisStore};

use config::{ConfigFile, RatchetConfig, generate_secret};

#[derive(Parser)]
#[command(name = "ratchet", about = "Durable saga orchestrator for tool-calling plans")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a ratchet config file with generated secrets
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the outbox database (creates it and runs migrations)
    DbInit,
    /// Run the HTTP engine
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Scan for stalled sagas and drive recovery
    Reconcile {
        /// Keep running on an interval instead of a single pass
        #[arg(long = "loop")]
        run_loop: bool,
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
    /// Run the outbox fallback poller
    Outbox {
        /// Keep running on an interval instead of a single pass
        #[arg(long = "loop")]
        run_loop: bool,
        /// Seconds between passes
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
    /// Show an execution document
    Status {
        /// Execution ID
        execution_id: String,
    },
    /// List dead-letter entries, oldest first
    Dlq {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cancel a non-terminal execution
    Cancel {
        /// Execution ID
        execution_id: String,
        /// Reason recorded on the execution
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => run_init(force),
        Commands::DbInit => run_db_init().await,
        Commands::Serve { bind, port } => run_serve(&bind, port).await,
        Commands::Reconcile {
            run_loop,
            interval_secs,
        } => run_reconcile(run_loop, interval_secs).await,
        Commands::Outbox {
            run_loop,
            interval_secs,
        } => run_outbox(run_loop, interval_secs).await,
        Commands::Status { execution_id } => run_status(&execution_id).await,
        Commands::Dlq { limit } => run_dlq(limit).await,
        Commands::Cancel {
            execution_id,
            reason,
        } => run_cancel(&execution_id, &reason).await,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn signing_keys(config: &RatchetConfig) -> SigningKeys {
    SigningKeys::from_hex(
        &config.engine.queue.signing_key_current,
        config.engine.queue.signing_key_next.as_deref(),
    )
}

fn build_registry(config: &RatchetConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for entry in &config.tools {
        let schema = ToolSchema::new(
            entry.name.clone(),
            entry
                .fields
                .iter()
                .map(|f| (f.name.as_str(), f.required))
                .collect(),
        );
        let mut tool = RemoteTool::new(&entry.name, &entry.endpoint, schema).with_aliases(
            entry
                .aliases
                .iter()
                .map(|(a, c)| (a.as_str(), c.as_str()))
                .collect(),
        );
        if let Some(compensation) = &entry.compensation {
            tool = tool.with_compensation_tool(compensation);
        }
        registry.register(Arc::new(tool));
    }
    tracing::info!(tools = registry.list().len(), "tool registry built");
    registry
}

async fn build_machine(config: &RatchetConfig) -> Result<WorkflowMachine> {
    let store = Arc::new(
        RedisStore::connect(&config.store)
            .await
            .context("failed to connect to the state store")?,
    );

    let keys = signing_keys(config);
    let queue: Arc<dyn QueueDriver> =
        match (&config.engine.queue.url, &config.engine.queue.token) {
            (Some(url), Some(token)) => {
                Arc::new(HttpQueueDriver::new(url, token, keys.clone()))
            }
            _ => {
                tracing::warn!("queue credentials absent, using loopback delivery");
                Arc::new(LoopbackQueueDriver::new(keys.clone()))
            }
        };

    let bus: Arc<dyn EventBus> =
        match (&config.engine.event_bus.url, &config.engine.event_bus.api_key) {
            (Some(url), Some(api_key)) => Arc::new(HttpEventBus::new(
                store.clone(),
                url,
                api_key,
                keys.clone(),
            )),
            _ => {
                tracing::warn!("event bus credentials absent, using in-process bus");
                Arc::new(InProcessEventBus::new(store.clone()))
            }
        };

    let registry = Arc::new(build_registry(config));
    let services = Services::new(config.engine.clone(), store, queue, bus, registry);
    Ok(WorkflowMachine::new(Arc::new(services)))
}

async fn build_relay(
    config: &RatchetConfig,
    machine: &WorkflowMachine,
) -> Option<Arc<OutboxRelay>> {
    match ratchet_store::pool::create_pool(&config.outbox_db).await {
        Ok(pool) => Some(Arc::new(OutboxRelay::new(
            pool,
            Arc::clone(&machine.services().queue),
            format!(
                "{}/engine/outbox-relay",
                machine.services().config.engine_base_url
            ),
        ))),
        Err(e) => {
            tracing::warn!(error = %e, "outbox database unavailable, relay endpoints degraded");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run_init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut file = ConfigFile::default();
    file.engine.internal_system_key = generate_secret();
    file.queue.signing_key_current = generate_secret();
    config::save_config(&file)?;

    println!("wrote {}", path.display());
    println!("  internal_system_key and queue signing key were generated");
    println!("  edit the file to point at your state store, queue, and tools");
    Ok(())
}

async fn run_db_init() -> Result<()> {
    let config = RatchetConfig::resolve()?;
    ratchet_store::pool::ensure_database_exists(&config.outbox_db).await?;
    let pool = ratchet_store::pool::create_pool(&config.outbox_db).await?;
    ratchet_store::pool::run_migrations(&pool).await?;
    println!("outbox database ready at {}", config.outbox_db.database_url);
    Ok(())
}

async fn run_serve(bind: &str, port: u16) -> Result<()> {
    let config = RatchetConfig::resolve()?;
    let machine = build_machine(&config).await?;
    let relay = build_relay(&config, &machine).await;

    let state = serve::AppState {
        internal_key: machine.services().config.internal_system_key.clone(),
        keys: signing_keys(&config),
        machine,
        relay,
    };
    serve::run_serve(state, bind, port).await
}

async fn run_reconcile(run_loop: bool, interval_secs: u64) -> Result<()> {
    let config = RatchetConfig::resolve()?;
    let machine = build_machine(&config).await?;
    let reconciler = Reconciler::new(machine);

    if run_loop {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal_cancel.cancel();
        });
        reconciler
            .run_loop(Duration::from_secs(interval_secs), cancel)
            .await?;
    } else {
        let result = reconciler.run_once(TraceContext::new()).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

async fn run_outbox(run_loop: bool, interval_secs: u64) -> Result<()> {
    let config = RatchetConfig::resolve()?;
    let machine = build_machine(&config).await?;
    let relay = build_relay(&config, &machine)
        .await
        .context("outbox database is required for the poller")?;

    if run_loop {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal_cancel.cancel();
        });
        relay
            .run_poller(Duration::from_secs(interval_secs), cancel)
            .await?;
    } else {
        let published = relay.poll_once(TraceContext::new()).await?;
        println!("re-enqueued {published} pending outbox rows");
    }
    Ok(())
}

async fn run_status(execution_id: &str) -> Result<()> {
    let id: Uuid = execution_id.parse().context("invalid execution id")?;
    let config = RatchetConfig::resolve()?;
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let repo = ExecutionRepository::new(store);

    match repo.load(id).await? {
        Some(execution) => println!("{}", serde_json::to_string_pretty(&execution)?),
        None => anyhow::bail!("execution {id} not found"),
    }
    Ok(())
}

async fn run_dlq(limit: usize) -> Result<()> {
    let config = RatchetConfig::resolve()?;
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let repo = ExecutionRepository::new(store);

    let entries = repo.list_dlq(limit).await?;
    if entries.is_empty() {
        println!("dead-letter queue is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  detected={}  attempts={}  last_status={}",
            entry.execution_id, entry.detected_at, entry.attempts, entry.last_status
        );
    }
    Ok(())
}

async fn run_cancel(execution_id: &str, reason: &str) -> Result<()> {
    let id: Uuid = execution_id.parse().context("invalid execution id")?;
    let config = RatchetConfig::resolve()?;
    let machine = build_machine(&config).await?;

    machine.cancel(id, reason, TraceContext::new()).await?;
    println!("execution {id} cancelled");
    Ok(())
}
