//! Notary Configuration
//!
//! This module provides configuration structures for a notary node and
//! the standalone coordination service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::coordination::ClientConfig;
use crate::ledger::MAX_DIFFICULTY;
use crate::reconcile::ReconcileConfig;
use crate::replication::ReplicationConfig;

/// Main notary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination service connection
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Block replication
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Startup and periodic reconciliation
    #[serde(default)]
    pub reconciliation: ReconciliationSettings,

    /// Standalone coordination service (`notary coordinator`)
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the HTTP API listens on
    pub bind_address: String,

    /// Address other nodes reach this one at, and the name it registers under
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Coordination service connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordination server address (host:port)
    #[serde(default = "default_coordination_address")]
    pub address: String,

    /// Root path shared by the cluster
    #[serde(default = "default_root")]
    pub root: String,

    /// Session expiry without keep-alives in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Keep-alive interval in milliseconds
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// First reconnection delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Largest reconnection delay in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Timeout for one coordination request in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Poll interval for leadership vacancy in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after a vacancy before contending, so a stale holder steps down first
    #[serde(default = "default_takeover_delay_ms")]
    pub takeover_delay_ms: u64,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerConfig {
    /// Leading zero hex digits required on minted blocks (0 disables mining)
    #[serde(default)]
    pub difficulty: u32,

    /// Store the chain in the coordination service after every mint
    #[serde(default)]
    pub persist_snapshot: bool,
}

/// Block replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Pause before pushing a new block in milliseconds
    #[serde(default = "default_replicate_delay_ms")]
    pub settle_delay_ms: u64,

    /// Per-follower push timeout in milliseconds
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

/// Startup and periodic reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSettings {
    /// Pause after connecting so peers can register, in milliseconds
    #[serde(default = "default_startup_delay_ms")]
    pub settle_delay_ms: u64,

    /// Seconds between periodic runs (0 disables them)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Timeout for fetching one peer's chain in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Checks for a coordination session before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between those checks in milliseconds
    #[serde(default = "default_connect_interval_ms")]
    pub connect_interval_ms: u64,

    /// Also consider the stored chain snapshot as a candidate
    #[serde(default)]
    pub include_snapshot: bool,
}

/// Standalone coordination service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address to listen on
    #[serde(default = "default_coordinator_address")]
    pub bind_address: String,

    /// How often expired sessions are reaped, in milliseconds
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_coordination_address() -> String {
    "127.0.0.1:2181".to_string()
}

fn default_root() -> String {
    "/notary".to_string()
}

fn default_session_timeout_ms() -> u64 {
    6000
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

fn default_reconnect_initial_ms() -> u64 {
    200
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_takeover_delay_ms() -> u64 {
    500
}

fn default_replicate_delay_ms() -> u64 {
    500
}

fn default_push_timeout_ms() -> u64 {
    3000
}

fn default_startup_delay_ms() -> u64 {
    3000
}

fn default_interval_secs() -> u64 {
    5
}

fn default_fetch_timeout_ms() -> u64 {
    3000
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_interval_ms() -> u64 {
    1000
}

fn default_coordinator_address() -> String {
    "0.0.0.0:2181".to_string()
}

fn default_reap_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            address: default_coordination_address(),
            root: default_root(),
            session_timeout_ms: default_session_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            takeover_delay_ms: default_takeover_delay_ms(),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_replicate_delay_ms(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_startup_delay_ms(),
            interval_secs: default_interval_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            connect_interval_ms: default_connect_interval_ms(),
            include_snapshot: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: default_coordinator_address(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl NotaryConfig {
    /// Configuration for a node at `address` with every other setting defaulted
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                bind_address: address.into(),
                advertise_address: None,
            },
            coordination: CoordinationConfig::default(),
            ledger: LedgerConfig::default(),
            replication: ReplicationSettings::default(),
            reconciliation: ReconciliationSettings::default(),
            coordinator: CoordinatorConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NotaryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NotaryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.address().is_empty() {
            return Err(crate::Error::Config("node.advertise_address cannot be empty".into()));
        }

        if !self.coordination.root.starts_with('/') {
            return Err(crate::Error::Config("coordination.root must start with '/'".into()));
        }

        if self.coordination.keepalive_interval_ms >= self.coordination.session_timeout_ms {
            return Err(crate::Error::Config(
                "coordination.keepalive_interval_ms must be below session_timeout_ms".into(),
            ));
        }

        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(crate::Error::Config(format!(
                "ledger.difficulty cannot exceed {}",
                MAX_DIFFICULTY
            )));
        }

        if self.coordination.takeover_delay_ms < self.coordination.poll_interval_ms {
            return Err(crate::Error::Config(
                "coordination.takeover_delay_ms must be at least poll_interval_ms".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Coordination client settings
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            root: self.coordination.root.clone(),
            session_timeout: Duration::from_millis(self.coordination.session_timeout_ms),
            keepalive_interval: Duration::from_millis(self.coordination.keepalive_interval_ms),
            reconnect_initial: Duration::from_millis(self.coordination.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.coordination.reconnect_max_ms),
        }
    }

    /// Get coordination request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.request_timeout_ms)
    }

    /// Get the post-vacancy takeover pause as Duration
    pub fn takeover_delay(&self) -> Duration {
        Duration::from_millis(self.coordination.takeover_delay_ms)
    }

    /// Get vacancy poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordination.poll_interval_ms)
    }

    /// Replication settings
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            settle_delay_ms: self.replication.settle_delay_ms,
            push_timeout_ms: self.replication.push_timeout_ms,
        }
    }

    /// Reconciliation settings
    pub fn reconcile_config(&self) -> ReconcileConfig {
        let r = &self.reconciliation;
        ReconcileConfig {
            settle_delay: Duration::from_millis(r.settle_delay_ms),
            interval: (r.interval_secs > 0).then(|| Duration::from_secs(r.interval_secs)),
            fetch_timeout: Duration::from_millis(r.fetch_timeout_ms),
            connect_attempts: r.connect_attempts,
            connect_interval: Duration::from_millis(r.connect_interval_ms),
            include_snapshot: r.include_snapshot,
        }
    }

    /// Get reap interval as Duration
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.reap_interval_ms)
    }
}
