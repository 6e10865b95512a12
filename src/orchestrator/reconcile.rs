use super::{is_port_available, find_free_port, ServerOrchestrator};
use crate::error::Result;
use crate::events::DomainEvent;
use crate::store::{PruneReport, ServerFilter};
use crate::types::{ProcessStatus, ServerId, ServerRecord, ServerStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What boot reconciliation changed in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Records left in an in-flight status by the previous run, now Stopped
    pub reset: Vec<ServerId>,
    /// Older duplicates of a name, deleted
    pub removed: Vec<ServerId>,
    /// `(id, old port, new port)` for records that lost a port collision
    pub relocated: Vec<(ServerId, u16, u16)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoStartReport {
    pub started: Vec<ServerId>,
    pub skipped: Vec<(ServerId, String)>,
    pub failed: Vec<(ServerId, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootReport {
    pub reconcile: ReconcileReport,
    /// Servers declared in the settings file and registered on this boot
    pub registered: Vec<ServerId>,
    pub auto_start: AutoStartReport,
}

impl ServerOrchestrator {
    /// Bring persisted state in line with reality, then start what should run.
    ///
    /// Order matters: duplicates are resolved before stale statuses are reset,
    /// and both happen before any process is spawned.
    pub async fn boot(&self) -> Result<BootReport> {
        info!("Booting supervisor");

        let reconcile = self.reconcile().await?;
        let registered = self.register_declared().await;
        let auto_start = self.auto_start().await?;
        self.spawn_retention_task();

        info!(
            "Boot complete: {} reset, {} duplicates removed, {} relocated, {} registered, {} started",
            reconcile.reset.len(),
            reconcile.removed.len(),
            reconcile.relocated.len(),
            registered.len(),
            auto_start.started.len()
        );

        Ok(BootReport {
            reconcile,
            registered,
            auto_start,
        })
    }

    /// Resolve name and port duplicates and reset stale in-flight statuses
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let records = self.inner.store.find_servers(&ServerFilter::all()).await?;

        // Names: the most recently updated record wins
        let mut by_name: HashMap<String, Vec<ServerRecord>> = HashMap::new();
        for record in records {
            by_name.entry(record.name.clone()).or_default().push(record);
        }

        let mut survivors = Vec::with_capacity(by_name.len());
        for (name, mut group) in by_name {
            group.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let mut group = group.into_iter();
            if let Some(keep) = group.next() {
                for duplicate in group {
                    warn!(
                        "Removing duplicate server '{}' ({}), keeping {}",
                        name, duplicate.id, keep.id
                    );
                    self.inner.store.delete_process(duplicate.id).await?;
                    self.inner.store.delete_server(duplicate.id).await?;
                    report.removed.push(duplicate.id);
                }
                survivors.push(keep);
            }
        }
        survivors.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        // Ports: the first (newest) holder keeps it, the rest are moved
        let mut claimed: HashSet<u16> = HashSet::new();
        let mut taken: HashSet<u16> = survivors.iter().map(|r| r.port).collect();
        for record in survivors.iter_mut() {
            if claimed.insert(record.port) {
                continue;
            }
            let old = record.port;
            let new = find_free_port(
                &self.inner.settings.supervisor.host,
                self.inner.settings.supervisor.port_range,
                &taken,
            )?;
            taken.insert(new);
            claimed.insert(new);

            warn!(
                "Server '{}' shares port {} with another record, moving it to {}",
                record.name, old, new
            );
            record.port = new;
            record.touch();
            self.inner.store.update_server(record).await?;
            report.relocated.push((record.id, old, new));
        }

        // Nothing is supervised yet, so no record can really be in flight
        for record in survivors.iter_mut() {
            if !matches!(
                record.status,
                ServerStatus::Running | ServerStatus::Starting | ServerStatus::Stopping
            ) {
                continue;
            }

            let from = record.status;
            warn!(
                "Server '{}' was {} when the supervisor last stopped, marking it stopped",
                record.name, from
            );

            if let Some(mut process) = self.inner.store.get_process(record.id).await? {
                if process.status.is_alive() && self.inner.resources.is_alive(process.pid) {
                    warn!(
                        "PID {} from a previous run of '{}' is still alive and is no longer supervised",
                        process.pid, record.name
                    );
                }
                process.status = ProcessStatus::Stopped;
                self.inner.store.upsert_process(&process).await?;
            }

            record.status = ServerStatus::Stopped;
            record.endpoint = None;
            record.healthy = false;
            self.inner.store.update_server(record).await?;

            self.inner.events.publish(DomainEvent::StatusChanged {
                server_id: record.id,
                from,
                to: ServerStatus::Stopped,
            });
            report.reset.push(record.id);
        }

        Ok(report)
    }

    /// Register servers from the settings file whose name is not in the store yet
    async fn register_declared(&self) -> Vec<ServerId> {
        let mut registered = Vec::new();

        for spec in &self.inner.settings.servers {
            match self.find_by_name(&spec.name).await {
                Ok(Some(existing)) => {
                    debug!("Declared server '{}' already registered as {}", spec.name, existing.id);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to look up declared server '{}': {}", spec.name, e);
                    continue;
                }
            }

            match self.create(spec.clone()).await {
                Ok(record) => registered.push(record.id),
                Err(e) => error!("Failed to register declared server '{}': {}", spec.name, e),
            }
        }

        registered
    }

    /// Start every auto-start server in creation order, one at a time
    pub async fn auto_start(&self) -> Result<AutoStartReport> {
        let mut report = AutoStartReport::default();

        let filter = ServerFilter {
            auto_start: Some(true),
            ..ServerFilter::default()
        };
        let candidates = self.inner.store.find_servers(&filter).await?;
        if candidates.is_empty() {
            return Ok(report);
        }
        info!("Auto-starting {} server(s)", candidates.len());

        let running = ServerFilter {
            status: Some(ServerStatus::Running),
            ..ServerFilter::default()
        };
        let mut claimed: HashSet<u16> = self
            .inner
            .store
            .find_servers(&running)
            .await?
            .into_iter()
            .map(|r| r.port)
            .collect();

        for record in candidates {
            if !matches!(record.status, ServerStatus::Stopped | ServerStatus::Error) {
                let reason = format!("already {}", record.status);
                debug!("Skipping auto-start of '{}': {}", record.name, reason);
                report.skipped.push((record.id, reason));
                continue;
            }

            if claimed.contains(&record.port) {
                let reason = format!("port {} is claimed by another server", record.port);
                warn!("Skipping auto-start of '{}': {}", record.name, reason);
                report.skipped.push((record.id, reason));
                continue;
            }

            if !is_port_available(&self.inner.settings.supervisor.host, record.port) {
                let reason = format!("port {} is already in use", record.port);
                warn!("Skipping auto-start of '{}': {}", record.name, reason);
                report.skipped.push((record.id, reason));
                continue;
            }

            match self.start(record.id).await {
                Ok(started) => {
                    claimed.insert(started.port);
                    report.started.push(started.id);
                }
                Err(e) => {
                    error!("Failed to auto-start '{}': {}", record.name, e);
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Drop series entries older than the retention period
    pub async fn prune_now(&self) -> Result<PruneReport> {
        let cutoff = Utc::now() - self.inner.settings.retention();
        let report = self.inner.store.prune_before(cutoff).await?;
        if report.total() > 0 {
            info!(
                "Pruned {} health, {} resource and {} log entries older than {}",
                report.health, report.resources, report.logs, cutoff
            );
        }
        Ok(report)
    }

    fn spawn_retention_task(&self) {
        let inner = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.settings.retention.prune_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = ServerOrchestrator::from_weak(&inner) else {
                    break;
                };
                if let Err(e) = orchestrator.prune_now().await {
                    warn!("Retention pass failed: {}", e);
                }
            }
        });
        self.background().push(handle);
    }

    /// Stop every running server concurrently and halt background work.
    ///
    /// Individual failures are logged; shutdown always completes.
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor");
        self.inner.restarts.cancel_all();

        let mut ids: HashSet<ServerId> = self.inner.supervisor.running_ids().await.into_iter().collect();
        match self.inner.store.find_servers(&ServerFilter::all()).await {
            Ok(records) => ids.extend(
                records
                    .into_iter()
                    .filter(|r| r.status.is_active())
                    .map(|r| r.id),
            ),
            Err(e) => error!("Failed to list servers during shutdown: {}", e),
        }

        let mut tasks = JoinSet::new();
        for id in ids {
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let _guard = orchestrator.acquire(id).await;
                (id, orchestrator.stop_locked(id, false).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(record))) => debug!("Stopped '{}' during shutdown", record.name),
                Ok((id, Err(e))) => error!("Failed to stop {} during shutdown: {}", id, e),
                Err(e) => error!("Shutdown task panicked: {}", e),
            }
        }

        self.inner.restarts.cancel_all();

        // Request counters recorded while a server was busy
        let counted: Vec<ServerId> = self.traffic().keys().copied().collect();
        for id in counted {
            let _guard = self.acquire(id).await;
            if let Ok(mut record) = self.get(id).await {
                if let Err(e) = self.save(&mut record).await {
                    warn!("Failed to persist traffic of '{}': {}", record.name, e);
                }
            }
        }

        for handle in self.background().drain(..) {
            handle.abort();
        }
        info!("Supervisor shut down");
    }
}
