use thiserror::Error;

/// Main error type for the gateway supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    // Caller-facing lifecycle errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Server not found: {0}")]
    NotFound(String),

    // Process-related errors
    #[error("Startup failed for {0}: {1}")]
    StartupFailed(String, String),

    #[error("Failed to terminate process {0}: {1}")]
    TerminationFailed(String, String),

    // Monitoring errors
    #[error("Resource sample failed for pid {0}: {1}")]
    ResourceSampleFailed(u32, String),

    #[error("Log error: {0}")]
    Log(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a failure, used when deciding whether a restart applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    StartupFailed,
    ProcessCrashed,
    UnexpectedExit,
    HealthCheckFailed,
    ResourceSampleFailed,
    TerminationFailed,
    Config,
    Other,
}

impl ErrorKind {
    /// Only crashes, unexpected exits and escalated health failures are worth a restart.
    /// A startup failure counts too, but callers only report it for automatic restarts,
    /// i.e. after the server has run successfully at least once.
    pub fn qualifies_for_restart(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProcessCrashed
                | ErrorKind::UnexpectedExit
                | ErrorKind::HealthCheckFailed
                | ErrorKind::StartupFailed
        )
    }
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Validation(_) => ErrorKind::Validation,
            SupervisorError::Conflict(_) => ErrorKind::Conflict,
            SupervisorError::NotFound(_) => ErrorKind::NotFound,
            SupervisorError::StartupFailed(..) => ErrorKind::StartupFailed,
            SupervisorError::TerminationFailed(..) => ErrorKind::TerminationFailed,
            SupervisorError::ResourceSampleFailed(..) => ErrorKind::ResourceSampleFailed,
            SupervisorError::Config(_) | SupervisorError::InvalidConfig(_) => ErrorKind::Config,
            _ => ErrorKind::Other,
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(e: serde_json::Error) -> Self {
        SupervisorError::Serialization(e.to_string())
    }
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
