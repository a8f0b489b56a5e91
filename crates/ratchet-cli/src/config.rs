//! Configuration file management for ratchet.
//!
//! Provides a TOML-based config file at `~/.config/ratchet/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ratchet_core::config::{
    EngineConfig, Environment, EventBusConfig, LockConfig, QueueConfig, ReconcileConfig,
};
use ratchet_store::config::{DbConfig, StoreConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub state_store: StateStoreSection,
    #[serde(default)]
    pub outbox: OutboxSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub event_bus: EventBusSection,
    /// HTTP-dispatched tools registered at boot.
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineSection {
    pub environment: String,
    /// Shared secret for internal endpoints (>= 32 chars in production).
    pub internal_system_key: String,
    /// Externally reachable base URL of this engine.
    pub base_url: String,
    pub heartbeat_delay_sec: u64,
    pub step_timeout_ms: u64,
    pub confirmation_ttl_sec: u64,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub high_risk_tools: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            environment: defaults.environment.to_string(),
            internal_system_key: String::new(),
            base_url: defaults.engine_base_url,
            heartbeat_delay_sec: defaults.heartbeat_delay_sec,
            step_timeout_ms: defaults.step_timeout_ms,
            confirmation_ttl_sec: defaults.confirmation_ttl_sec,
            lock: LockSection::default(),
            reconcile: ReconcileSection::default(),
            high_risk_tools: defaults.high_risk_tools.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockSection {
    pub ttl_sec: u64,
    pub grace_sec: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            ttl_sec: defaults.ttl_sec,
            grace_sec: defaults.grace_sec,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileSection {
    pub min_inactive_ms: u64,
    pub max_recovery_attempts: u32,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let defaults = ReconcileConfig::default();
        Self {
            min_inactive_ms: defaults.min_inactive_ms,
            max_recovery_attempts: defaults.max_recovery_attempts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateStoreSection {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for StateStoreSection {
    fn default() -> Self {
        Self {
            url: StoreConfig::DEFAULT_URL.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboxSection {
    pub database_url: String,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            database_url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Hex-encoded signing key (64 hex chars = 32 bytes).
    #[serde(default)]
    pub signing_key_current: String,
    #[serde(default)]
    pub signing_key_next: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventBusSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// One HTTP-dispatched tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub compensation: Option<String>,
    /// `[["alias", "canonical"], ...]`
    #[serde(default)]
    pub aliases: Vec<(String, String)>,
    #[serde(default)]
    pub fields: Vec<ToolFieldEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFieldEntry {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the ratchet config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/ratchet` or
/// `~/.config/ratchet`, ignoring the platform-specific config dir.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ratchet");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ratchet")
}

/// Return the path to the ratchet config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct RatchetConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub outbox_db: DbConfig,
    pub tools: Vec<ToolEntry>,
}

impl RatchetConfig {
    /// Resolve configuration using the chain: env var > config file >
    /// default. Environment variables use the `RATCHET_` prefix.
    pub fn resolve() -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let env_or = |name: &str, fallback: String| -> String {
            std::env::var(name).unwrap_or(fallback)
        };
        let env_opt = |name: &str, fallback: Option<String>| -> Option<String> {
            std::env::var(name).ok().or(fallback)
        };

        let environment: Environment =
            env_or("RATCHET_ENVIRONMENT", file.engine.environment.clone())
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;

        let engine = EngineConfig {
            environment,
            internal_system_key: env_or(
                "RATCHET_INTERNAL_SYSTEM_KEY",
                file.engine.internal_system_key.clone(),
            ),
            engine_base_url: env_or("RATCHET_ENGINE_BASE_URL", file.engine.base_url.clone()),
            queue: QueueConfig {
                url: env_opt("RATCHET_QUEUE_URL", file.queue.url.clone()),
                token: env_opt("RATCHET_QUEUE_TOKEN", file.queue.token.clone()),
                signing_key_current: env_or(
                    "RATCHET_QUEUE_SIGNING_KEY",
                    file.queue.signing_key_current.clone(),
                ),
                signing_key_next: env_opt(
                    "RATCHET_QUEUE_SIGNING_KEY_NEXT",
                    file.queue.signing_key_next.clone(),
                ),
            },
            event_bus: EventBusConfig {
                url: env_opt("RATCHET_EVENT_BUS_URL", file.event_bus.url.clone()),
                api_key: env_opt("RATCHET_EVENT_BUS_API_KEY", file.event_bus.api_key.clone()),
            },
            reconcile: ReconcileConfig {
                min_inactive_ms: file.engine.reconcile.min_inactive_ms,
                max_recovery_attempts: file.engine.reconcile.max_recovery_attempts,
            },
            lock: LockConfig {
                ttl_sec: file.engine.lock.ttl_sec,
                grace_sec: file.engine.lock.grace_sec,
            },
            heartbeat_delay_sec: file.engine.heartbeat_delay_sec,
            step_timeout_ms: file.engine.step_timeout_ms,
            confirmation_ttl_sec: file.engine.confirmation_ttl_sec,
            high_risk_tools: file.engine.high_risk_tools.iter().cloned().collect(),
        };

        engine
            .validate()
            .map_err(|problems| anyhow::anyhow!("invalid configuration: {}", problems.join("; ")))?;

        let store = StoreConfig::new(
            env_or("RATCHET_STATE_STORE_URL", file.state_store.url.clone()),
            env_opt("RATCHET_STATE_STORE_TOKEN", file.state_store.token.clone()),
        );
        let outbox_db = DbConfig::new(env_or(
            "RATCHET_OUTBOX_DATABASE_URL",
            file.outbox.database_url.clone(),
        ));

        Ok(Self {
            engine,
            store,
            outbox_db,
            tools: file.tools,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
