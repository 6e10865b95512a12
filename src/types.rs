// Domain records shared by the supervisor, its monitors and the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a managed gateway server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Wire protocol a gateway server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stream,
    EventStream,
    Stdio,
    Socket,
}

impl Transport {
    /// Request-style transports are probed with an HTTP GET
    pub fn is_request_style(&self) -> bool {
        matches!(self, Transport::Stream | Transport::EventStream)
    }

    /// Public endpoint for a server listening on `host:port`
    pub fn endpoint(&self, host: &str, port: u16, pid: u32) -> String {
        match self {
            Transport::Stream => format!("http://{}:{}/mcp", host, port),
            Transport::EventStream => format!("http://{}:{}/sse", host, port),
            Transport::Socket => format!("ws://{}:{}", host, port),
            Transport::Stdio => format!("stdio://{}", pid),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stream => write!(f, "stream"),
            Transport::EventStream => write!(f, "event-stream"),
            Transport::Stdio => write!(f, "stdio"),
            Transport::Socket => write!(f, "socket"),
        }
    }
}

/// Lifecycle status of a server, persisted and mirrored in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Error is reachable from every in-flight state and left only through an
    /// explicit start (or a stop that cleans up what is left).
    pub fn can_transition_to(&self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Error)
                | (Running, Error)
                | (Stopping, Error)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }

    /// Statuses that imply a live OS process
    pub fn is_active(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Stopping => write!(f, "stopping"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// Traffic metrics reported by the gateway layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    pub started_at: Option<DateTime<Utc>>,
}

impl ServerMetrics {
    pub fn record_request(&mut self, response_time_ms: f64, ok: bool) {
        self.request_count += 1;
        if !ok {
            self.error_count += 1;
        }
        // Incremental mean, no history needed
        let n = self.request_count as f64;
        self.avg_response_time_ms += (response_time_ms - self.avg_response_time_ms) / n;
    }
}

/// How to launch the OS process behind a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Executable to run
    pub command: PathBuf,

    /// Command-line arguments; `{port}` is replaced with the allocated port
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay applied on top of the supervisor's environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// External log file written by the server, tailed from its current end
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Path probed by HTTP health checks (overrides the global default)
    #[serde(default)]
    pub health_path: Option<String>,

    /// Grace period before a stop escalates to a forced kill
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

impl LaunchConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            log_file: None,
            health_path: None,
            stop_timeout_ms: None,
        }
    }
}

/// Durable record for one managed server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub version: String,
    pub port: u16,
    pub transport: Transport,
    pub status: ServerStatus,
    pub endpoint: Option<String>,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub metrics: ServerMetrics,
    pub auto_start: bool,
    pub launch: LaunchConfig,
    /// Opaque configuration blob, passed through untouched
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Policy kind stored in the opaque config. Recorded for display only; the
    /// restart engine does not consult it.
    pub fn restart_policy_hint(&self) -> Option<&str> {
        self.config.get("restart_policy").and_then(|v| v.as_str())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Status of the OS process behind a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// One OS process per server, upserted by server id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub server_id: ServerId,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub server_id: ServerId,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// CPU and memory usage of a process at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub server_id: ServerId,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub parent_pid: Option<u32>,
    /// Seconds since the process started
    pub elapsed_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// A captured log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub server_id: ServerId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
