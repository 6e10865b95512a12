use crate::error::{Result, SupervisorError};
use crate::events::ProcessEvent;
use crate::logs::LogMonitor;
use crate::process::spawner::{spawn_process, SpawnConfig};
use crate::process::terminate::{ExitInfo, ExitWatch, Terminator};
use crate::types::{LogLevel, ProcessRecord, ProcessStatus, ServerId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Live bookkeeping for one spawned process
struct ProcessHandle {
    record: ProcessRecord,
    exit: ExitWatch,
    /// Set before a requested stop so the exit is reported as expected
    stopping: bool,
    /// Kept open for stdio servers; dropping it would close the child's stdin
    stdin: Option<ChildStdin>,
}

/// Owns every spawned child process.
///
/// Each child is moved into a waiter task that reaps it, publishes its exit on
/// a watch channel and reports a [`ProcessEvent`] to the orchestrator. All other
/// operations work on pids and the exit watch, so nothing here blocks on a child.
pub struct ProcessSupervisor {
    processes: Arc<RwLock<HashMap<ServerId, ProcessHandle>>>,
    terminator: Arc<dyn Terminator>,
    logs: LogMonitor,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        terminator: Arc<dyn Terminator>,
        logs: LogMonitor,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            terminator,
            logs,
            events,
        }
    }

    /// Spawn the process for `config.server_id`.
    ///
    /// Returns as soon as a pid is assigned; readiness is the health checker's concern.
    ///
    /// # Returns
    /// * `Ok(ProcessRecord)` - The process is running
    /// * `Err(SupervisorError::Conflict)` - A process for this server is already alive
    /// * `Err(SupervisorError::StartupFailed)` - The OS refused to start it
    pub async fn spawn(&self, config: &SpawnConfig) -> Result<ProcessRecord> {
        let id = config.server_id;

        let previous_restarts = {
            let processes = self.processes.read().await;
            match processes.get(&id) {
                Some(handle) if Self::is_live(handle) => {
                    return Err(SupervisorError::Conflict(format!(
                        "process for {} is already running (PID {})",
                        config.name, handle.record.pid
                    )));
                }
                Some(handle) => handle.record.restart_count,
                None => 0,
            }
        };

        let mut spawned = spawn_process(config).await?;
        let pid = spawned.pid;

        self.logs.attach_streams(
            id,
            spawned.child.stdout.take(),
            spawned.child.stderr.take(),
        );

        let record = ProcessRecord {
            server_id: id,
            pid,
            start_time: Utc::now(),
            status: ProcessStatus::Running,
            restart_count: if config.is_restart {
                previous_restarts + 1
            } else {
                previous_restarts
            },
            last_error: None,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let stdin = spawned.child.stdin.take();

        {
            let mut processes = self.processes.write().await;
            if processes.get(&id).is_some_and(Self::is_live) {
                // Lost a race with another spawn for the same server
                let _ = spawned.child.start_kill();
                return Err(SupervisorError::Conflict(format!(
                    "process for {} is already running",
                    config.name
                )));
            }
            processes.insert(
                id,
                ProcessHandle {
                    record: record.clone(),
                    exit: exit_rx,
                    stopping: false,
                    stdin,
                },
            );
        }

        self.spawn_waiter(id, pid, config.is_restart, spawned.child, exit_tx);

        info!("Spawned {} (PID: {})", config.name, pid);
        Ok(record)
    }

    fn spawn_waiter(
        &self,
        id: ServerId,
        pid: u32,
        restarted: bool,
        mut child: Child,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let processes = Arc::clone(&self.processes);
        let events = self.events.clone();
        let logs = self.logs.clone();
        let spawned_at = Instant::now();

        tokio::spawn(async move {
            let waited = child.wait().await;
            let uptime = spawned_at.elapsed();

            let info = match waited {
                Ok(status) => ExitInfo::from_status(status),
                Err(ref e) => {
                    warn!("Waiting on PID {} failed: {}", pid, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };

            let expected = {
                let mut processes = processes.write().await;
                match processes.get_mut(&id) {
                    Some(handle) if handle.record.pid == pid => {
                        handle.stdin = None;
                        if handle.stopping {
                            handle.record.status = ProcessStatus::Stopped;
                            true
                        } else {
                            handle.record.status = ProcessStatus::Error;
                            handle.record.last_error = Some(info.describe());
                            false
                        }
                    }
                    // Superseded by a newer process for the same server
                    _ => true,
                }
            };

            let _ = exit_tx.send(Some(info));

            if expected {
                debug!("PID {} for {} {}", pid, id, info.describe());
            } else {
                logs.push(
                    id,
                    LogLevel::Error,
                    format!("Process {} {}", pid, info.describe()),
                    None,
                )
                .await;
            }

            let event = match waited {
                Ok(_) => ProcessEvent::Exited {
                    server_id: id,
                    pid,
                    code: info.code,
                    signal: info.signal,
                    expected,
                    restarted,
                    uptime,
                },
                Err(e) => ProcessEvent::Failed {
                    server_id: id,
                    pid,
                    error: e.to_string(),
                },
            };
            // The orchestrator may already be gone during shutdown
            let _ = events.send(event);
        });
    }

    /// Stop the process behind `id`.
    ///
    /// A graceful stop asks first and forces after `timeout`; `force` kills at once.
    /// Stopping a server whose process has already exited returns its final record.
    pub async fn stop(&self, id: ServerId, force: bool, timeout: Duration) -> Result<ProcessRecord> {
        let (pid, exit) = {
            let mut processes = self.processes.write().await;
            let handle = processes
                .get_mut(&id)
                .ok_or_else(|| SupervisorError::NotFound(format!("no process for {}", id)))?;

            if !Self::is_live(handle) {
                return Ok(handle.record.clone());
            }

            handle.stopping = true;
            handle.record.status = ProcessStatus::Stopping;
            (handle.record.pid, handle.exit.clone())
        };

        let result = self.terminator.terminate(pid, exit, !force, timeout).await;

        let mut processes = self.processes.write().await;
        let handle = processes
            .get_mut(&id)
            .ok_or_else(|| SupervisorError::NotFound(format!("no process for {}", id)))?;

        match result {
            Ok(()) => {
                handle.record.status = ProcessStatus::Stopped;
                handle.stdin = None;
                info!("Process for {} stopped (PID: {})", id, pid);
                Ok(handle.record.clone())
            }
            Err(e) => {
                handle.record.status = ProcessStatus::Error;
                handle.record.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: ServerId) -> Option<ProcessRecord> {
        self.processes
            .read()
            .await
            .get(&id)
            .map(|h| h.record.clone())
    }

    pub async fn pid(&self, id: ServerId) -> Option<u32> {
        self.processes
            .read()
            .await
            .get(&id)
            .filter(|h| Self::is_live(h))
            .map(|h| h.record.pid)
    }

    pub async fn is_running(&self, id: ServerId) -> bool {
        self.processes
            .read()
            .await
            .get(&id)
            .is_some_and(Self::is_live)
    }

    pub async fn running_ids(&self) -> Vec<ServerId> {
        self.processes
            .read()
            .await
            .iter()
            .filter(|(_, h)| Self::is_live(h))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Exit notification for the current process of `id`
    pub async fn exit_watch(&self, id: ServerId) -> Option<ExitWatch> {
        self.processes
            .read()
            .await
            .get(&id)
            .map(|h| h.exit.clone())
    }

    /// Hand the stdin of a stdio server to whoever speaks its protocol
    pub async fn take_stdin(&self, id: ServerId) -> Option<ChildStdin> {
        self.processes
            .write()
            .await
            .get_mut(&id)
            .and_then(|h| h.stdin.take())
    }

    /// Forget a server whose process is no longer alive
    pub async fn remove(&self, id: ServerId) -> Result<bool> {
        let mut processes = self.processes.write().await;
        match processes.get(&id) {
            Some(handle) if Self::is_live(handle) => Err(SupervisorError::Conflict(format!(
                "process for {} is still running",
                id
            ))),
            Some(_) => {
                processes.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Alive and not yet reaped. A process being stopped still counts.
    fn is_live(handle: &ProcessHandle) -> bool {
        handle.exit.borrow().is_none()
            && matches!(
                handle.record.status,
                ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
            )
    }
}
