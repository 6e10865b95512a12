use crate::config::ResourceSettings;
use crate::error::{Result, SupervisorError};
use crate::events::{DomainEvent, EventBus};
use crate::ring::Ring;
use crate::store::Store;
use crate::types::{ResourceSample, ServerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Host-wide resource usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub total_memory: u64,
    pub used_memory: u64,
    pub cpu_count: usize,
    pub cpu_percent: f32,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub timestamp: DateTime<Utc>,
}

/// Samples CPU and memory of server processes on a fixed interval.
///
/// One task per monitored server. Samples go into a capped per-server ring,
/// the store and the event bus. A pid that cannot be read is logged and
/// skipped; the task keeps running until `stop` is called.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<ResourceInner>,
}

struct ResourceInner {
    /// System information collector
    system: Mutex<System>,
    interval: Duration,
    history_size: usize,
    histories: RwLock<HashMap<ServerId, Ring<ResourceSample>>>,
    tasks: Mutex<HashMap<ServerId, JoinHandle<()>>>,
    store: Option<Arc<dyn Store>>,
    events: EventBus,
}

impl ResourceMonitor {
    pub fn new(settings: &ResourceSettings, store: Option<Arc<dyn Store>>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                system: Mutex::new(System::new()),
                interval: Duration::from_millis(settings.interval_ms),
                history_size: settings.history_size,
                histories: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                store,
                events,
            }),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.inner.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<ServerId, JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin sampling `pid` for `id`. Returns `false` if already monitoring.
    pub fn start(&self, id: ServerId, pid: u32) -> bool {
        let mut tasks = self.tasks();
        if tasks.get(&id).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.collect(id, pid).await;
            }
        });

        tracing::debug!("Resource monitoring started for {} (PID: {})", id, pid);
        tasks.insert(id, handle);
        true
    }

    /// Stop sampling. Returns `false` if the server was not monitored.
    pub fn stop(&self, id: ServerId) -> bool {
        match self.tasks().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, id: ServerId) -> bool {
        self.tasks().get(&id).is_some_and(|h| !h.is_finished())
    }

    async fn collect(&self, id: ServerId, pid: u32) {
        let sample = match self.sample(id, pid) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("{} (server {})", e, id);
                return;
            }
        };

        {
            let mut histories = self.inner.histories.write().await;
            histories
                .entry(id)
                .or_insert_with(|| Ring::new(self.inner.history_size))
                .push(sample.clone());
        }

        if let Some(ref store) = self.inner.store {
            if let Err(e) = store.append_resource(&sample).await {
                tracing::warn!("Failed to persist resource sample for {}: {}", id, e);
            }
        }

        self.inner.events.publish(DomainEvent::ResourceSample(sample));
    }

    /// Take one sample of `pid`
    ///
    /// # Returns
    /// * `Ok(ResourceSample)` - Current CPU and memory usage
    /// * `Err(SupervisorError::ResourceSampleFailed)` - The pid is gone or unreadable
    pub fn sample(&self, id: ServerId, pid: u32) -> Result<ResourceSample> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system();

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let process = system
            .process(sys_pid)
            .filter(|p| p.status() != ProcessStatus::Zombie)
            .ok_or_else(|| {
                SupervisorError::ResourceSampleFailed(pid, "process not found".to_string())
            })?;

        Ok(ResourceSample {
            server_id: id,
            pid,
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            parent_pid: process.parent().map(|p| p.as_u32()),
            elapsed_secs: process.run_time(),
            timestamp: Utc::now(),
        })
    }

    /// Check if a process is still alive in the system
    ///
    /// # Returns
    /// * `true` - Process is alive
    /// * `false` - Process has exited, crashed, or is a zombie
    pub fn is_alive(&self, pid: u32) -> bool {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new(),
        );
        system
            .process(sys_pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    /// Up to `limit` samples, newest first
    pub async fn history(&self, id: ServerId, limit: usize) -> Vec<ResourceSample> {
        self.inner
            .histories
            .read()
            .await
            .get(&id)
            .map(|ring| ring.newest(limit))
            .unwrap_or_default()
    }

    /// Stop sampling and drop the history
    pub async fn clear(&self, id: ServerId) {
        self.stop(id);
        self.inner.histories.write().await.remove(&id);
    }

    pub fn system_snapshot(&self) -> SystemSnapshot {
        let mut system = self.system();
        system.refresh_memory();
        system.refresh_cpu_usage();
        let load = System::load_average();

        SystemSnapshot {
            total_memory: system.total_memory(),
            used_memory: system.used_memory(),
            cpu_count: system.cpus().len(),
            cpu_percent: system.global_cpu_usage(),
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            timestamp: Utc::now(),
        }
    }
}
