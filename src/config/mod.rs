// Config module - Supervisor settings and server definitions

use crate::error::{Result, SupervisorError};
use crate::types::{LaunchConfig, Transport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Submitted definition of a gateway server, validated on `create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique server name
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Port to listen on; a free one is allocated when omitted
    #[serde(default)]
    pub port: Option<u16>,

    pub transport: Transport,

    /// Launch settings (command, args, env, cwd, ...)
    #[serde(flatten)]
    pub launch: LaunchConfig,

    /// Start automatically when the supervisor boots
    #[serde(default)]
    pub auto_start: bool,

    /// Opaque configuration blob stored with the record
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>, transport: Transport, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            port: None,
            transport,
            launch: LaunchConfig::new(command),
            auto_start: false,
            config: serde_json::Value::Null,
        }
    }

    /// Expand environment variables in launch fields
    fn expand_env_vars(&mut self) {
        self.launch.command = expand_env_in_path(&self.launch.command);

        if let Some(ref cwd) = self.launch.cwd {
            self.launch.cwd = Some(expand_env_in_path(cwd));
        }

        if let Some(ref log_file) = self.launch.log_file {
            self.launch.log_file = Some(expand_env_in_path(log_file));
        }

        self.launch.args = self
            .launch
            .args
            .iter()
            .map(|arg| expand_env_in_string(arg))
            .collect();

        // Values only; keys are taken literally
        self.launch.env = self
            .launch
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// General supervisor behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Host used for endpoints and probes
    pub host: String,
    /// JSON state file; the store stays in memory when unset
    pub state_path: Option<PathBuf>,
    /// Default grace period before a stop escalates to a kill
    pub stop_timeout_ms: u64,
    /// Inclusive range scanned when a port must be allocated
    pub port_range: (u16, u16),
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            state_path: None,
            stop_timeout_ms: 10_000,
            port_range: (8000, 9000),
        }
    }
}

/// Automatic restart behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Restart ceiling: attempts allowed before giving up
    pub max_attempts: u32,
    /// A restarted process must stay up this long before its attempt history is forgotten
    pub min_uptime_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            min_uptime_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub history_size: usize,
    /// Consecutive failures that trigger escalation
    pub failure_threshold: u32,
    /// Restart a server once the failure threshold is reached
    pub auto_restart_unhealthy: bool,
    /// Default path for HTTP probes
    pub path: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            history_size: 100,
            failure_threshold: 3,
            auto_restart_unhealthy: false,
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub interval_ms: u64,
    pub history_size: usize,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            history_size: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Lines kept in memory per server
    pub buffer_size: usize,
    /// Also write captured lines to the store
    pub persist: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            buffer_size: 1_000,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub days: u32,
    pub prune_interval_ms: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days: 7,
            prune_interval_ms: 3_600_000,
        }
    }
}

/// Complete supervisor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub supervisor: CoreSettings,
    pub restart: RestartSettings,
    pub health: HealthSettings,
    pub resources: ResourceSettings,
    pub logs: LogSettings,
    pub retention: RetentionSettings,
    /// Servers registered at boot when no record with the same name exists
    pub servers: Vec<ServerSpec>,
}

impl SupervisorSettings {
    /// Load settings from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SupervisorError::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut settings = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(SupervisorError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        for spec in &mut settings.servers {
            spec.expand_env_vars();
        }

        settings.validate()?;

        Ok(settings)
    }

    pub fn parse_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| SupervisorError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    pub fn parse_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| SupervisorError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.supervisor.port_range;
        if low == 0 || low > high {
            return Err(SupervisorError::Config(format!(
                "Invalid port_range: {}-{}",
                low, high
            )));
        }

        if self.restart.max_attempts == 0 {
            return Err(SupervisorError::Config(
                "restart.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.restart.base_delay_ms > self.restart.max_delay_ms {
            return Err(SupervisorError::Config(format!(
                "restart.base_delay_ms ({}) exceeds restart.max_delay_ms ({})",
                self.restart.base_delay_ms, self.restart.max_delay_ms
            )));
        }

        if self.health.interval_ms == 0 || self.health.timeout_ms == 0 {
            return Err(SupervisorError::Config(
                "health.interval_ms and health.timeout_ms must be positive".to_string(),
            ));
        }

        if self.health.failure_threshold == 0 {
            return Err(SupervisorError::Config(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.resources.interval_ms == 0 {
            return Err(SupervisorError::Config(
                "resources.interval_ms must be positive".to_string(),
            ));
        }

        if self.health.history_size == 0
            || self.resources.history_size == 0
            || self.logs.buffer_size == 0
        {
            return Err(SupervisorError::Config(
                "history sizes must be at least 1".to_string(),
            ));
        }

        if !self.health.path.starts_with('/') {
            return Err(SupervisorError::Config(format!(
                "health.path must start with '/': {}",
                self.health.path
            )));
        }

        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.stop_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention.days))
    }
}

/// Expand `$VAR` and `${VAR}` in a string
pub(crate) fn expand_env_in_string(s: &str) -> String {
    let mut result = s.to_string();

    // Longest names first so $PATH does not clobber $PATHEXT
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (key, value) in vars {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }

    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_env_in_string(&path_str))
}
