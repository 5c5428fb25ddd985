//! Application configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file,
//! then environment variables (`<PREFIX>__SECTION__KEY`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::SubprocessConfig;
use crate::connection::{BackoffPolicy, ConnectTarget, ConnectionConfig};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "AGP_BRIDGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to expand path '{path}': {reason}")]
    Path { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub connection: ConnectionSettings,
    pub dedup: DedupSettings,
    pub agent: AgentSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            connection: ConnectionSettings::default(),
            dedup: DedupSettings::default(),
            agent: AgentSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Peer endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Sent as `guid`.
    pub device_id: String,
    /// Sent as `user_id`.
    pub account_id: Option<String>,
    pub token: Option<String>,
    /// Keep well below the peer's idle timeout.
    pub heartbeat_interval_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// 0 means unlimited.
    pub max_reconnect_attempts: u32,
    pub send_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            device_id: String::new(),
            account_id: None,
            token: None,
            heartbeat_interval_secs: 5,
            reconnect_base_ms: 3000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 0,
            send_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub capacity: usize,
    pub sweep_interval_secs: u64,
    /// 0 disables age-based expiry.
    pub max_age_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            sweep_interval_secs: 300,
            max_age_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent executable, spawned once per prompt.
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Used when a prompt does not name an agent app.
    pub agent_app: String,
    pub working_dir: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            agent_app: "main".to_string(),
            working_dir: None,
        }
    }
}

impl AppConfig {
    /// Load from `path` (optional) and the environment.
    pub fn load(path: &Path, env_prefix: &str) -> Result<Self, ConfigError> {
        let built = ::config::Config::builder()
            .set_default("profile", "default")?
            .set_default("logging.level", "info")?
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.url.is_empty() {
            return Err(ConfigError::Invalid("connection.url is not set".into()));
        }
        if !(conn.url.starts_with("ws://") || conn.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "connection.url must use ws:// or wss://, got '{}'",
                conn.url
            )));
        }
        if conn.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.device_id is not set".into()));
        }
        if conn.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection.heartbeat_interval_secs must be greater than 0".into(),
            ));
        }
        if conn.reconnect_base_ms > conn.reconnect_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "connection.reconnect_base_ms ({}) exceeds reconnect_cap_ms ({})",
                conn.reconnect_base_ms, conn.reconnect_cap_ms
            )));
        }
        if self.dedup.capacity < 2 {
            return Err(ConfigError::Invalid("dedup.capacity must be at least 2".into()));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.command is not set".into()));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let conn = &self.connection;
        let dedup = &self.dedup;
        ConnectionConfig {
            target: ConnectTarget {
                url: conn.url.clone(),
                device_id: conn.device_id.clone(),
                account_id: conn.account_id.clone().filter(|s| !s.is_empty()),
                token: conn.token.clone().filter(|s| !s.is_empty()),
            },
            heartbeat_interval: Duration::from_secs(conn.heartbeat_interval_secs),
            backoff: BackoffPolicy {
                base: Duration::from_millis(conn.reconnect_base_ms),
                cap: Duration::from_millis(conn.reconnect_cap_ms),
                max_attempts: conn.max_reconnect_attempts,
            },
            dedup_capacity: dedup.capacity,
            dedup_max_age: (dedup.max_age_secs > 0).then(|| Duration::from_secs(dedup.max_age_secs)),
            dedup_sweep_interval: Duration::from_secs(dedup.sweep_interval_secs.max(1)),
        }
    }

    pub fn subprocess_config(&self) -> Result<SubprocessConfig, ConfigError> {
        let working_dir = self
            .agent
            .working_dir
            .as_deref()
            .map(expand_path)
            .transpose()?;
        Ok(SubprocessConfig {
            command: self.agent.command.clone(),
            args: self.agent.args.clone(),
            env: self.agent.env.clone(),
            working_dir,
        })
    }
}

/// Expand `~` and environment variables.
pub fn expand_path(text: &str) -> Result<PathBuf, ConfigError> {
    let expanded = shellexpand::full(text).map_err(|e| ConfigError::Path {
        path: text.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.to_string()))
}
