//! Server lifecycle orchestration.
//!
//! [`ServerOrchestrator`] is the only component that mutates server records.
//! It serializes lifecycle operations per server with one async mutex per id:
//! caller-facing operations (`start`, `stop`, `restart`, `delete`) try the lock
//! and fail with `Conflict` when it is held, while internal handlers (process
//! exits, health escalation, restart timers) wait for it. Operations on
//! different servers never contend.
//!
//! `force_stop` is the one exception: it may escalate a graceful stop that
//! holds the lock, then waits for that stop to finish.
//!
//! Components report back over typed channels that a single event loop drains;
//! each event is handled in its own task so a slow stop never stalls the loop.

mod batch;
mod ports;
mod reconcile;

pub use batch::{BatchAction, BatchMode, BatchOutcome, BatchResult};
pub use ports::{find_free_port, is_port_available};
pub use reconcile::{AutoStartReport, BootReport, ReconcileReport};

use crate::config::{ServerSpec, SupervisorSettings};
use crate::error::{ErrorKind, Result, SupervisorError};
use crate::events::{DomainEvent, EventBus, HealthSignal, ProcessEvent, RestartDue};
use crate::health::{HealthChecker, HealthStats, Probe};
use crate::logs::{LogMonitor, LogQuery};
use crate::process::{
    platform_terminator, ExitInfo, ProcessSupervisor, ResourceMonitor, RestartPolicy,
    RestartPolicyEngine, RestartStatus, SpawnConfig, SystemSnapshot,
};
use crate::store::{SampleQuery, ServerFilter, Store};
use crate::types::{
    HealthSample, LogRecord, ProcessRecord, ResourceSample, ServerId, ServerMetrics, ServerRecord,
    ServerStatus, Transport,
};
use crate::validate::SpecValidator;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type OperationLock = Arc<tokio::sync::Mutex<()>>;

/// Cheaply cloneable handle to the supervisor core
#[derive(Clone)]
pub struct ServerOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SupervisorSettings,
    store: Arc<dyn Store>,
    validator: Arc<dyn SpecValidator>,
    supervisor: ProcessSupervisor,
    restarts: RestartPolicyEngine,
    health: HealthChecker,
    resources: ResourceMonitor,
    logs: LogMonitor,
    events: EventBus,
    /// One lock per server; held for the whole of a lifecycle operation
    operations: Mutex<HashMap<ServerId, OperationLock>>,
    /// Serializes `create` so name and port checks see each other
    registration: tokio::sync::Mutex<()>,
    /// Live request counters, overlaid on every record read or written
    traffic: Mutex<HashMap<ServerId, ServerMetrics>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerOrchestrator {
    /// Wire up all components and start the event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: SupervisorSettings,
        store: Arc<dyn Store>,
        validator: Arc<dyn SpecValidator>,
    ) -> Self {
        let events = EventBus::default();
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let logs = LogMonitor::new(&settings.logs, Some(Arc::clone(&store)), events.clone());
        let supervisor = ProcessSupervisor::new(platform_terminator(), logs.clone(), process_tx);
        let restarts = RestartPolicyEngine::new(
            RestartPolicy::from_settings(&settings.restart),
            restart_tx,
            events.clone(),
        );
        let health = HealthChecker::new(
            &settings.health,
            Some(Arc::clone(&store)),
            health_tx,
            events.clone(),
        );
        let resources =
            ResourceMonitor::new(&settings.resources, Some(Arc::clone(&store)), events.clone());

        let orchestrator = Self {
            inner: Arc::new(Inner {
                settings,
                store,
                validator,
                supervisor,
                restarts,
                health,
                resources,
                logs,
                events,
                operations: Mutex::new(HashMap::new()),
                registration: tokio::sync::Mutex::new(()),
                traffic: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
            }),
        };

        let event_loop = tokio::spawn(run_event_loop(
            Arc::downgrade(&orchestrator.inner),
            process_rx,
            health_rx,
            restart_rx,
        ));
        orchestrator.background().push(event_loop);

        orchestrator
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn traffic(&self) -> MutexGuard<'_, HashMap<ServerId, ServerMetrics>> {
        self.inner
            .traffic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy live request counters into `record`, keeping its lifecycle fields
    fn overlay_traffic(&self, record: &mut ServerRecord) {
        if let Some(live) = self.traffic().get(&record.id) {
            record.metrics.request_count = live.request_count;
            record.metrics.error_count = live.error_count;
            record.metrics.avg_response_time_ms = live.avg_response_time_ms;
        }
    }

    async fn save(&self, record: &mut ServerRecord) -> Result<()> {
        self.overlay_traffic(record);
        record.touch();
        self.inner.store.update_server(record).await
    }

    fn operation_lock(&self, id: ServerId) -> OperationLock {
        let mut operations = self
            .inner
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(operations.entry(id).or_default())
    }

    /// Join the lock set or fail with `Conflict`
    fn try_acquire(&self, record: &ServerRecord) -> Result<OwnedMutexGuard<()>> {
        self.operation_lock(record.id)
            .try_lock_owned()
            .map_err(|_| {
                SupervisorError::Conflict(format!(
                    "an operation on '{}' is already in progress",
                    record.name
                ))
            })
    }

    /// Wait for the lock; used by internal handlers
    async fn acquire(&self, id: ServerId) -> OwnedMutexGuard<()> {
        self.operation_lock(id).lock_owned().await
    }

    /// Whether a lifecycle operation on `id` is in progress
    pub fn is_busy(&self, id: ServerId) -> bool {
        self.operation_lock(id).try_lock().is_err()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.inner.events.subscribe()
    }

    // ---- Registration ----

    /// Validate and register a new server in the Stopped state
    pub async fn create(&self, spec: ServerSpec) -> Result<ServerRecord> {
        let outcome = self.inner.validator.validate(&spec).await;
        if !outcome.valid {
            return Err(SupervisorError::Validation(outcome.message()));
        }

        let _registration = self.inner.registration.lock().await;
        let existing = self.inner.store.find_servers(&ServerFilter::all()).await?;

        if let Some(other) = existing.iter().find(|r| r.name == spec.name) {
            return Err(SupervisorError::Conflict(format!(
                "a server named '{}' already exists ({}, {})",
                spec.name, other.id, other.status
            )));
        }

        let port = match spec.port {
            Some(port) => {
                if let Some(other) = existing
                    .iter()
                    .find(|r| r.port == port && r.status == ServerStatus::Running)
                {
                    return Err(SupervisorError::Conflict(format!(
                        "port {} is in use by running server '{}'",
                        port, other.name
                    )));
                }
                port
            }
            None => {
                let claimed: HashSet<u16> = existing.iter().map(|r| r.port).collect();
                find_free_port(
                    &self.inner.settings.supervisor.host,
                    self.inner.settings.supervisor.port_range,
                    &claimed,
                )?
            }
        };

        let now = Utc::now();
        let record = ServerRecord {
            id: ServerId::new(),
            name: spec.name,
            version: spec.version,
            port,
            transport: spec.transport,
            status: ServerStatus::Stopped,
            endpoint: None,
            healthy: false,
            last_error: None,
            metrics: ServerMetrics::default(),
            auto_start: spec.auto_start,
            launch: spec.launch,
            config: spec.config,
            created_at: now,
            updated_at: now,
        };

        if let Some(kind) = record.restart_policy_hint() {
            debug!(
                "Server '{}' declares restart policy '{}'; the global policy applies",
                record.name, kind
            );
        }

        self.inner.store.insert_server(&record).await?;
        info!(
            "Registered server '{}' ({}) on port {} over {}",
            record.name, record.id, record.port, record.transport
        );
        Ok(record)
    }

    // ---- Lifecycle ----

    /// Start a stopped or failed server
    ///
    /// # Returns
    /// * `Ok(ServerRecord)` - The server is Running (health is reported separately)
    /// * `Err(SupervisorError::Conflict)` - Already starting/running/stopping, busy, or port taken
    /// * `Err(SupervisorError::StartupFailed)` - The process could not be spawned; status is Error
    pub async fn start(&self, id: ServerId) -> Result<ServerRecord> {
        let record = self.get(id).await?;
        ensure_startable(&record)?;
        let _guard = self.try_acquire(&record)?;

        self.inner.restarts.cancel_pending(id);
        self.start_locked(id, false).await.map(|(record, _)| record)
    }

    /// Stop a server, gracefully first, forcing after its stop timeout
    pub async fn stop(&self, id: ServerId) -> Result<ServerRecord> {
        let record = self.get(id).await?;
        match record.status {
            ServerStatus::Stopped => {
                return Err(SupervisorError::Conflict(format!(
                    "server '{}' is already stopped",
                    record.name
                )))
            }
            ServerStatus::Stopping => {
                return Err(SupervisorError::Conflict(format!(
                    "server '{}' is already stopping",
                    record.name
                )))
            }
            _ => {}
        }
        let _guard = self.try_acquire(&record)?;

        self.inner.restarts.cancel_restart(id);
        self.stop_locked(id, false).await
    }

    /// Stop a server without a grace period.
    ///
    /// While a graceful stop is in flight this kills the same process at once
    /// and returns after that stop has finished.
    pub async fn force_stop(&self, id: ServerId) -> Result<ServerRecord> {
        let record = self.get(id).await?;
        if record.status == ServerStatus::Stopped {
            return Err(SupervisorError::Conflict(format!(
                "server '{}' is already stopped",
                record.name
            )));
        }

        match self.try_acquire(&record) {
            Ok(_guard) => {
                self.inner.restarts.cancel_restart(id);
                self.stop_locked(id, true).await
            }
            Err(_) if record.status == ServerStatus::Stopping => {
                warn!("Escalating stop of '{}' to a forced kill", record.name);
                match self
                    .inner
                    .supervisor
                    .stop(id, true, self.stop_timeout(&record))
                    .await
                {
                    // No process left to kill
                    Ok(_) | Err(SupervisorError::NotFound(_)) => {}
                    Err(e) => {
                        error!("Failed to force stop '{}': {}", record.name, e);
                        return Err(e);
                    }
                }
                // The graceful stop sees the exit and finishes the transition
                let _guard = self.acquire(id).await;
                self.get(id).await
            }
            Err(busy) => Err(busy),
        }
    }

    /// Stop (when needed) and start again under one lock
    pub async fn restart(&self, id: ServerId) -> Result<ServerRecord> {
        let record = self.get(id).await?;
        if matches!(
            record.status,
            ServerStatus::Starting | ServerStatus::Stopping
        ) {
            return Err(SupervisorError::Conflict(format!(
                "server '{}' is {}",
                record.name, record.status
            )));
        }
        let _guard = self.try_acquire(&record)?;

        self.inner.restarts.cancel_pending(id);
        if record.status != ServerStatus::Stopped {
            self.stop_locked(id, false).await?;
        }
        self.start_locked(id, false).await.map(|(record, _)| record)
    }

    /// Remove a stopped or failed server and everything kept about it
    pub async fn delete(&self, id: ServerId) -> Result<()> {
        let record = self.get(id).await?;
        let _guard = self.try_acquire(&record)?;

        let record = self.get(id).await?;
        if !matches!(record.status, ServerStatus::Stopped | ServerStatus::Error)
            || self.inner.supervisor.is_running(id).await
        {
            return Err(SupervisorError::Conflict(format!(
                "server '{}' must be stopped before it is deleted",
                record.name
            )));
        }

        self.inner.restarts.forget(id);
        self.inner.health.forget(id).await;
        self.inner.resources.clear(id).await;
        self.inner.logs.clear(id).await;
        self.inner.supervisor.remove(id).await?;

        self.inner.store.delete_process(id).await?;
        self.inner.store.delete_server(id).await?;
        self.traffic().remove(&id);

        self.inner
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        info!("Deleted server '{}' ({})", record.name, id);
        Ok(())
    }

    /// Spawn the server's process. The caller holds the operation lock.
    async fn start_locked(
        &self,
        id: ServerId,
        is_restart: bool,
    ) -> Result<(ServerRecord, ProcessRecord)> {
        let mut record = self.get(id).await?;
        ensure_startable(&record)?;
        self.check_port(&record).await?;

        self.transition(&mut record, ServerStatus::Starting).await?;

        let config = SpawnConfig::from_record(&record, is_restart);
        let process = match self.inner.supervisor.spawn(&config).await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start '{}': {}", record.name, e);
                self.fail(&mut record, &e.to_string()).await;
                return Err(e);
            }
        };

        if let Err(e) = self.mark_running(&mut record, &process).await {
            error!("Failed to record start of '{}': {}", record.name, e);
            let _ = self
                .inner
                .supervisor
                .stop(id, true, self.stop_timeout(&record))
                .await;
            self.fail(&mut record, &e.to_string()).await;
            return Err(e);
        }

        self.start_monitors(&record, &process).await;
        Ok((record, process))
    }

    async fn mark_running(&self, record: &mut ServerRecord, process: &ProcessRecord) -> Result<()> {
        record.endpoint = Some(record.transport.endpoint(
            &self.inner.settings.supervisor.host,
            record.port,
            process.pid,
        ));
        record.metrics.started_at = Some(process.start_time);
        record.last_error = None;
        record.healthy = false;

        self.inner.store.upsert_process(process).await?;
        self.transition(record, ServerStatus::Running).await?;

        self.inner.events.publish(DomainEvent::ProcessStarted {
            server_id: record.id,
            pid: process.pid,
        });
        info!(
            "Server '{}' running (PID: {}) at {}",
            record.name,
            process.pid,
            record.endpoint.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Terminate the server's process. The caller holds the operation lock.
    async fn stop_locked(&self, id: ServerId, force: bool) -> Result<ServerRecord> {
        let mut record = self.get(id).await?;
        if record.status == ServerStatus::Stopped {
            return Ok(record);
        }

        self.transition(&mut record, ServerStatus::Stopping).await?;
        self.stop_monitors(id).await;

        let timeout = self.stop_timeout(&record);
        let result = if self.inner.supervisor.is_running(id).await {
            self.inner
                .supervisor
                .stop(id, force, timeout)
                .await
                .map(Some)
        } else {
            Ok(None)
        };

        match result {
            Ok(process) => {
                record.endpoint = None;
                record.healthy = false;
                if let Err(e) = self.finish_stop(&mut record, process.as_ref()).await {
                    // The process is gone; Error keeps the server startable
                    error!("Failed to record stop of '{}': {}", record.name, e);
                    self.fail(&mut record, &e.to_string()).await;
                    return Err(e);
                }

                self.inner.events.publish(DomainEvent::ProcessStopped {
                    server_id: id,
                    pid: process.as_ref().map(|p| p.pid),
                });
                info!("Server '{}' stopped", record.name);
                Ok(record)
            }
            Err(e) => {
                error!("Failed to stop '{}': {}", record.name, e);
                if let Some(process) = self.inner.supervisor.get(id).await {
                    if let Err(store_err) = self.inner.store.upsert_process(&process).await {
                        warn!("Failed to record process of '{}': {}", record.name, store_err);
                    }
                }
                self.fail(&mut record, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn finish_stop(
        &self,
        record: &mut ServerRecord,
        process: Option<&ProcessRecord>,
    ) -> Result<()> {
        if let Some(process) = process {
            self.inner.store.upsert_process(process).await?;
        }
        self.transition(record, ServerStatus::Stopped).await
    }

    /// Verify no other running server holds the port and that the OS would let us bind it
    async fn check_port(&self, record: &ServerRecord) -> Result<()> {
        let filter = ServerFilter {
            port: Some(record.port),
            status: Some(ServerStatus::Running),
            ..ServerFilter::default()
        };
        let holders = self.inner.store.find_servers(&filter).await?;
        if let Some(other) = holders.iter().find(|r| r.id != record.id) {
            return Err(SupervisorError::Conflict(format!(
                "port {} is in use by running server '{}'",
                record.port, other.name
            )));
        }

        if !is_port_available(&self.inner.settings.supervisor.host, record.port) {
            return Err(SupervisorError::Conflict(format!(
                "port {} is already in use",
                record.port
            )));
        }
        Ok(())
    }

    /// Move `record` to `next`, persist it and announce the change
    async fn transition(&self, record: &mut ServerRecord, next: ServerStatus) -> Result<()> {
        let from = record.status;
        if !from.can_transition_to(next) {
            return Err(SupervisorError::Conflict(format!(
                "server '{}' cannot go from {} to {}",
                record.name, from, next
            )));
        }

        record.status = next;
        if let Err(e) = self.save(record).await {
            record.status = from;
            return Err(e);
        }

        debug!("Server '{}': {} -> {}", record.name, from, next);
        self.inner.events.publish(DomainEvent::StatusChanged {
            server_id: record.id,
            from,
            to: next,
        });
        Ok(())
    }

    /// Put the server into Error with `message` as its last error
    async fn fail(&self, record: &mut ServerRecord, message: &str) {
        record.last_error = Some(message.to_string());
        record.healthy = false;
        record.endpoint = None;

        let persisted = if record.status == ServerStatus::Error {
            self.save(record).await
        } else {
            self.transition(record, ServerStatus::Error).await
        };
        if let Err(e) = persisted {
            error!("Failed to record error state of '{}': {}", record.name, e);
        }

        self.inner.events.publish(DomainEvent::ProcessError {
            server_id: record.id,
            error: message.to_string(),
        });
    }

    async fn start_monitors(&self, record: &ServerRecord, process: &ProcessRecord) {
        if let Some(exit) = self.inner.supervisor.exit_watch(record.id).await {
            let probe = Probe::for_server(
                record,
                &self.inner.settings.supervisor.host,
                &self.inner.settings.health.path,
                process.pid,
                exit,
            );
            self.inner.health.start(record.id, probe);
        }

        self.inner.resources.start(record.id, process.pid);

        if let Some(ref path) = record.launch.log_file {
            if let Err(e) = self.inner.logs.tail_file(record.id, path).await {
                warn!("Cannot tail {} for '{}': {}", path.display(), record.name, e);
            }
        }
    }

    async fn stop_monitors(&self, id: ServerId) {
        self.inner.health.stop(id).await;
        self.inner.resources.stop(id);
        self.inner.logs.stop_tail(id).await;
    }

    fn stop_timeout(&self, record: &ServerRecord) -> Duration {
        record
            .launch
            .stop_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.settings.stop_timeout())
    }

    // ---- Event handling ----

    async fn handle_process_event(&self, event: ProcessEvent) {
        let (id, pid, message, kind) = match event {
            ProcessEvent::Exited { expected: true, .. } => return,
            ProcessEvent::Exited {
                server_id,
                pid,
                code,
                signal,
                restarted,
                uptime,
                ..
            } => {
                let info = ExitInfo { code, signal };
                let kind = if !restarted && uptime < self.inner.restarts.policy().min_uptime {
                    // Died right after a requested start: it never ran successfully
                    ErrorKind::StartupFailed
                } else if signal.is_some() {
                    ErrorKind::ProcessCrashed
                } else {
                    ErrorKind::UnexpectedExit
                };
                (server_id, pid, info.describe(), kind)
            }
            ProcessEvent::Failed {
                server_id,
                pid,
                error,
            } => (server_id, pid, error, ErrorKind::ProcessCrashed),
        };

        let _guard = self.acquire(id).await;

        let Ok(mut record) = self.get(id).await else {
            return;
        };

        // A newer process has replaced the one that exited
        let current = self.inner.supervisor.get(id).await;
        if current.as_ref().map(|p| p.pid) != Some(pid) || !record.status.is_active() {
            debug!("Ignoring stale exit of PID {} for '{}'", pid, record.name);
            return;
        }

        warn!("Server '{}' (PID {}) {}", record.name, pid, message);
        self.stop_monitors(id).await;

        if let Some(ref process) = current {
            if let Err(e) = self.inner.store.upsert_process(process).await {
                warn!("Failed to record process of '{}': {}", record.name, e);
            }
        }

        self.fail(&mut record, &format!("process {}", message)).await;

        if kind == ErrorKind::StartupFailed {
            warn!(
                "Server '{}' exited during startup; not restarting automatically",
                record.name
            );
            return;
        }
        let decision = self.inner.restarts.on_failure(id, kind);
        debug!("Restart decision for '{}': {:?}", record.name, decision);
    }

    async fn handle_health_signal(&self, signal: HealthSignal) {
        match signal {
            HealthSignal::Changed { server_id, healthy } => {
                let _guard = self.acquire(server_id).await;
                let Ok(mut record) = self.get(server_id).await else {
                    return;
                };
                if record.status != ServerStatus::Running || record.healthy == healthy {
                    return;
                }

                record.healthy = healthy;
                if let Err(e) = self.save(&mut record).await {
                    warn!("Failed to record health of '{}': {}", record.name, e);
                }
            }
            HealthSignal::Unhealthy {
                server_id,
                consecutive_failures,
            } => {
                if !self.inner.settings.health.auto_restart_unhealthy {
                    warn!(
                        "Server {} failed {} consecutive health checks; automatic restart is disabled",
                        server_id, consecutive_failures
                    );
                    return;
                }

                let _guard = self.acquire(server_id).await;
                let Ok(mut record) = self.get(server_id).await else {
                    return;
                };
                if record.status != ServerStatus::Running {
                    return;
                }

                warn!(
                    "Server '{}' failed {} consecutive health checks, restarting",
                    record.name, consecutive_failures
                );
                self.stop_monitors(server_id).await;

                let timeout = self.stop_timeout(&record);
                match self.inner.supervisor.stop(server_id, false, timeout).await {
                    Ok(process) => {
                        if let Err(e) = self.inner.store.upsert_process(&process).await {
                            warn!("Failed to record process of '{}': {}", record.name, e);
                        }
                    }
                    Err(e) => error!("Failed to stop unhealthy '{}': {}", record.name, e),
                }

                let message = format!(
                    "health check failed {} consecutive times",
                    consecutive_failures
                );
                self.fail(&mut record, &message).await;
                self.inner
                    .restarts
                    .on_failure(server_id, ErrorKind::HealthCheckFailed);
            }
        }
    }

    async fn handle_restart_due(&self, due: RestartDue) {
        let id = due.server_id;
        let _guard = self.acquire(id).await;

        if !self.inner.restarts.take_due(id) {
            debug!("Restart of {} was cancelled", id);
            return;
        }

        let record = match self.get(id).await {
            Ok(record) => record,
            Err(_) => {
                self.inner.restarts.forget(id);
                return;
            }
        };
        if record.status != ServerStatus::Error {
            // Someone started or stopped it by hand in the meantime
            self.inner.restarts.cancel_restart(id);
            return;
        }

        info!(
            "Restarting '{}' (attempt {}/{})",
            record.name,
            due.attempt,
            self.inner.restarts.policy().max_attempts
        );

        match self.start_locked(id, true).await {
            Ok((record, process)) => {
                self.inner.restarts.on_restart_succeeded(id);
                self.inner.events.publish(DomainEvent::ProcessRestarted {
                    server_id: id,
                    pid: process.pid,
                    attempt: due.attempt,
                });
                info!("Server '{}' restarted (PID: {})", record.name, process.pid);
            }
            Err(e) => {
                warn!("Restart attempt {} of '{}' failed: {}", due.attempt, record.name, e);
                self.inner.restarts.on_restart_failed(id, e.kind());
            }
        }
    }

    // ---- Queries ----

    pub async fn get(&self, id: ServerId) -> Result<ServerRecord> {
        let mut record = self
            .inner
            .store
            .get_server(id)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        self.overlay_traffic(&mut record);
        Ok(record)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .inner
            .store
            .find_servers(&ServerFilter::by_name(name))
            .await?
            .into_iter()
            .next())
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>> {
        self.inner.store.find_servers(&ServerFilter::all()).await
    }

    pub async fn list_filtered(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>> {
        self.inner.store.find_servers(filter).await
    }

    /// Live process record, falling back to the last persisted one
    pub async fn process_info(&self, id: ServerId) -> Result<Option<ProcessRecord>> {
        self.get(id).await?;
        match self.inner.supervisor.get(id).await {
            Some(process) => Ok(Some(process)),
            None => self.inner.store.get_process(id).await,
        }
    }

    /// Log lines, newest first, from the store when persisted, else the in-memory buffer
    pub async fn logs(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<LogRecord>> {
        self.get(id).await?;
        if self.inner.settings.logs.persist {
            self.inner.store.log_records(id, query).await
        } else {
            let log_query = LogQuery {
                since: query.since,
                until: query.until,
                limit: query.limit,
                ..LogQuery::default()
            };
            Ok(self.inner.logs.search(id, &log_query).await)
        }
    }

    /// Search the in-memory log buffer
    pub async fn search_logs(&self, id: ServerId, query: &LogQuery) -> Result<Vec<LogRecord>> {
        self.get(id).await?;
        Ok(self.inner.logs.search(id, query).await)
    }

    pub async fn resource_history(
        &self,
        id: ServerId,
        query: &SampleQuery,
    ) -> Result<Vec<ResourceSample>> {
        self.get(id).await?;
        self.inner.store.resource_samples(id, query).await
    }

    pub async fn health_history(
        &self,
        id: ServerId,
        query: &SampleQuery,
    ) -> Result<Vec<HealthSample>> {
        self.get(id).await?;
        self.inner.store.health_samples(id, query).await
    }

    pub async fn health_stats(&self, id: ServerId, window: Option<Duration>) -> Result<HealthStats> {
        self.get(id).await?;
        Ok(self.inner.health.stats(id, window).await)
    }

    pub fn system_snapshot(&self) -> SystemSnapshot {
        self.inner.resources.system_snapshot()
    }

    pub async fn reset_restart_counter(&self, id: ServerId) -> Result<()> {
        self.get(id).await?;
        self.inner.restarts.reset_restart_counter(id);
        Ok(())
    }

    /// Abort a pending automatic restart. Returns `false` if none was pending.
    pub async fn cancel_restart(&self, id: ServerId) -> Result<bool> {
        self.get(id).await?;
        Ok(self.inner.restarts.cancel_restart(id))
    }

    pub async fn restart_status(&self, id: ServerId) -> Result<RestartStatus> {
        self.get(id).await?;
        Ok(self.inner.restarts.status(id))
    }

    /// Fold one proxied request into the server's traffic metrics.
    ///
    /// Never waits on a lifecycle operation. When one is in progress the
    /// counters reach the store with that operation's next write.
    pub async fn record_request(
        &self,
        id: ServerId,
        response_time_ms: f64,
        ok: bool,
    ) -> Result<ServerMetrics> {
        let record = self.get(id).await?;
        let mut metrics = {
            let mut traffic = self.traffic();
            let live = traffic
                .entry(id)
                .or_insert_with(|| record.metrics.clone());
            live.record_request(response_time_ms, ok);
            live.clone()
        };
        metrics.started_at = record.metrics.started_at;

        if let Ok(_guard) = self.operation_lock(id).try_lock_owned() {
            let mut record = self.get(id).await?;
            self.save(&mut record).await?;
        }
        Ok(metrics)
    }

    /// Take the stdin of a running stdio server, for the layer speaking its protocol
    pub async fn take_stdin(&self, id: ServerId) -> Result<Option<ChildStdin>> {
        let record = self.get(id).await?;
        if record.transport != Transport::Stdio {
            return Ok(None);
        }
        Ok(self.inner.supervisor.take_stdin(id).await)
    }
}

fn ensure_startable(record: &ServerRecord) -> Result<()> {
    match record.status {
        ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping => {
            Err(SupervisorError::Conflict(format!(
                "server '{}' is already {}",
                record.name, record.status
            )))
        }
        ServerStatus::Stopped | ServerStatus::Error => Ok(()),
    }
}

/// Drain component channels until every sender is gone or the orchestrator is dropped
async fn run_event_loop(
    inner: Weak<Inner>,
    mut process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    mut health_rx: mpsc::UnboundedReceiver<HealthSignal>,
    mut restart_rx: mpsc::UnboundedReceiver<RestartDue>,
) {
    loop {
        tokio::select! {
            Some(event) = process_rx.recv() => {
                let Some(orchestrator) = ServerOrchestrator::from_weak(&inner) else { break };
                tokio::spawn(async move { orchestrator.handle_process_event(event).await });
            }
            Some(signal) = health_rx.recv() => {
                let Some(orchestrator) = ServerOrchestrator::from_weak(&inner) else { break };
                tokio::spawn(async move { orchestrator.handle_health_signal(signal).await });
            }
            Some(due) = restart_rx.recv() => {
                let Some(orchestrator) = ServerOrchestrator::from_weak(&inner) else { break };
                tokio::spawn(async move { orchestrator.handle_restart_due(due).await });
            }
            else => break,
        }
    }
    debug!("Orchestrator event loop finished");
}
