use crate::error::{Result, SupervisorError};
use crate::types::{LaunchConfig, ServerId, ServerRecord, Transport};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Everything needed to launch the process behind one server
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub server_id: ServerId,
    pub name: String,
    pub transport: Transport,
    pub port: u16,
    pub launch: LaunchConfig,
    /// Spawned by the restart engine rather than an explicit start
    pub is_restart: bool,
}

impl SpawnConfig {
    pub fn from_record(record: &ServerRecord, is_restart: bool) -> Self {
        Self {
            server_id: record.id,
            name: record.name.clone(),
            transport: record.transport,
            port: record.port,
            launch: record.launch.clone(),
            is_restart,
        }
    }

    /// Arguments with `{port}` substituted
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.launch
            .args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect()
    }
}

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn the process described by `config`.
///
/// Stdout and stderr are always piped for log capture. Stdin is piped for the
/// stdio transport (the gateway speaks over it) and closed otherwise. On Unix
/// the child leads its own process group so termination reaches its children too.
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Child handle with an assigned pid
/// * `Err(SupervisorError::StartupFailed)` - The OS refused or no pid was assigned
pub async fn spawn_process(config: &SpawnConfig) -> Result<SpawnedProcess> {
    let command_path = &config.launch.command;

    // Bare names are resolved through PATH by the OS; explicit paths must exist
    if command_path.components().count() > 1 && !command_path.exists() {
        return Err(SupervisorError::StartupFailed(
            config.name.clone(),
            format!("Command does not exist: {}", command_path.display()),
        ));
    }

    let mut command = Command::new(command_path);
    command.args(config.resolved_args());

    if let Some(ref cwd) = config.launch.cwd {
        command.current_dir(cwd);
    }

    command.env("PORT", config.port.to_string());
    for (key, value) in &config.launch.env {
        command.env(key, value);
    }

    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if config.transport == Transport::Stdio {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| {
        SupervisorError::StartupFailed(
            config.name.clone(),
            format!("Failed to spawn '{}': {}", command_path.display(), e),
        )
    })?;

    let pid = child.id().ok_or_else(|| {
        SupervisorError::StartupFailed(config.name.clone(), "no pid assigned".to_string())
    })?;

    Ok(SpawnedProcess { child, pid })
}
