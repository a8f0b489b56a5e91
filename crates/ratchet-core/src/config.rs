//! Engine configuration.
//!
//! Every tunable named by the operations contract lives here with its
//! default. The CLI layers its resolution chain (flag > env > config file >
//! default) on top; this module only validates the resolved result.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment environment. Governs loopback queue delivery and how strict
/// validation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Development => "development",
            Self::Production => "production",
        };
        f.write_str(s)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("invalid environment: {other:?}")),
        }
    }
}

/// Delayed-delivery queue credentials and signing keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Base URL of the queue service. Absent in development means
    /// loopback delivery.
    pub url: Option<String>,
    pub token: Option<String>,
    /// Active webhook signing key (hex).
    pub signing_key_current: String,
    /// Next key during rotation; consumers verify against both.
    #[serde(default)]
    pub signing_key_next: Option<String>,
}

/// Event bus credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Publish endpoint. Absent means in-process delivery.
    pub url: Option<String>,
    pub api_key: Option<String>,
}

/// Reconciler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Inactivity threshold before a non-terminal saga counts as stalled.
    pub min_inactive_ms: u64,
    /// Recovery attempts before escalation.
    pub max_recovery_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            min_inactive_ms: 300_000,
            max_recovery_attempts: 3,
        }
    }
}

/// Execution-lock tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub ttl_sec: u64,
    pub grace_sec: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 30,
            grace_sec: 5,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_sec)
    }
}

/// The fully resolved engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Shared secret accepted on internal endpoints. Required (>= 32
    /// chars) in production.
    pub internal_system_key: String,
    /// The engine's own externally reachable base URL; queue webhooks for
    /// step execution and heartbeat checks point back at it.
    pub engine_base_url: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Delay before a heartbeat check fires.
    pub heartbeat_delay_sec: u64,
    /// Default per-step tool deadline when the plan omits one.
    pub step_timeout_ms: u64,
    pub confirmation_ttl_sec: u64,
    /// Tools that always require human confirmation.
    #[serde(default)]
    pub high_risk_tools: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            internal_system_key: String::new(),
            engine_base_url: "http://localhost:8080".to_string(),
            queue: QueueConfig::default(),
            event_bus: EventBusConfig::default(),
            reconcile: ReconcileConfig::default(),
            lock: LockConfig::default(),
            heartbeat_delay_sec: 30,
            step_timeout_ms: 8_500,
            confirmation_ttl_sec: 900,
            high_risk_tools: default_high_risk_tools(),
        }
    }
}

fn default_high_risk_tools() -> BTreeSet<String> {
    [
        "process_payment",
        "charge_card",
        "transfer_funds",
        "issue_refund",
        "delete_account",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl EngineConfig {
    pub fn heartbeat_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_delay_sec)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_sec)
    }

    /// Validate the resolved configuration.
    ///
    /// In production the internal key must be present (>= 32 chars) and
    /// the queue must be fully configured: loopback delivery for the
    /// execute-step path is a fatal misconfiguration there.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.environment == Environment::Production {
            if self.internal_system_key.len() < 32 {
                problems.push(
                    "internal_system_key must be at least 32 characters in production"
                        .to_string(),
                );
            }
            if self.queue.url.is_none() || self.queue.token.is_none() {
                problems.push(
                    "queue.url and queue.token are required in production".to_string(),
                );
            }
        }
        if self.queue.signing_key_current.is_empty() {
            problems.push("queue.signing_key_current must be set".to_string());
        }
        if self.engine_base_url.is_empty() {
            problems.push("engine_base_url must be set".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            internal_system_key: "k".repeat(32),
            queue: QueueConfig {
                url: Some("https://queue.example.com".to_string()),
                token: Some("qt".to_string()),
                signing_key_current: "aa".repeat(16),
                signing_key_next: None,
            },
            ..EngineConfig::default()
        }
    }

    #[test]
    fn development_accepts_loopback_queue() {
        let mut config = base();
        config.queue.url = None;
        config.queue.token = None;
        config.validate().unwrap();
    }

    #[test]
    fn production_requires_queue_credentials() {
        let mut config = base();
        config.environment = Environment::Production;
        config.queue.url = None;
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("queue.url")));
    }

    #[test]
    fn production_requires_long_internal_key() {
        let mut config = base();
        config.environment = Environment::Production;
        config.internal_system_key = "short".to_string();
        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("internal_system_key")));
    }

    #[test]
    fn signing_key_always_required() {
        let mut config = base();
        config.queue.signing_key_current = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(
            "development".parse::<Environment>().unwrap(),
            Environment::Development
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn duration_accessors() {
        let config = base();
        assert_eq!(config.heartbeat_delay(), Duration::from_secs(30));
        assert_eq!(config.step_timeout(), Duration::from_millis(8_500));
        assert_eq!(config.confirmation_ttl(), Duration::from_secs(900));
        assert_eq!(config.lock.ttl(), Duration::from_secs(30));
    }
}
