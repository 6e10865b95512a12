use crate::error::{Result, SupervisorError};
use crate::store::memory::{MemoryStore, Tables};
use crate::store::{PruneReport, SampleQuery, ServerFilter, Store};
use crate::types::{
    HealthSample, LogRecord, ProcessRecord, ResourceSample, ServerId, ServerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

/// Contents of the state file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    version: String,
    servers: Vec<ServerRecord>,
    processes: Vec<ProcessRecord>,
    last_updated: DateTime<Utc>,
}

impl StateSnapshot {
    fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(SupervisorError::Store(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        // Duplicate names and ports are tolerated here; boot reconciliation resolves them.
        // Duplicate ids mean the file was corrupted.
        let mut seen_ids = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen_ids.insert(server.id) {
                return Err(SupervisorError::Store(format!(
                    "Duplicate server id found: {}",
                    server.id
                )));
            }
        }

        Ok(())
    }
}

/// Store that keeps server and process records in a JSON state file.
///
/// Every server/process mutation rewrites the file atomically before the call
/// returns. Time series (health, resource, log) live in memory only and are
/// bounded by retention pruning.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    save_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, loading any existing state file
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = Self::load(&path).await?;

        Ok(Self {
            path,
            inner: MemoryStore::with_tables(tables),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(path: &Path) -> Result<Tables> {
        // No file yet means a fresh install
        if !tokio::fs::try_exists(path).await? {
            return Ok(Tables::default());
        }

        let contents = tokio::fs::read(path).await.map_err(|e| {
            SupervisorError::Store(format!("Failed to read state file: {}", e))
        })?;

        let snapshot: StateSnapshot = serde_json::from_slice(&contents).map_err(|e| {
            SupervisorError::Store(format!("Failed to parse state file: {}", e))
        })?;

        snapshot.validate()?;

        let mut tables = Tables::default();
        for server in snapshot.servers {
            tables.servers.insert(server.id, server);
        }
        for process in snapshot.processes {
            tables.processes.insert(process.server_id, process);
        }

        Ok(tables)
    }

    /// Write the current records with the temp-file-then-rename pattern
    async fn persist(&self) -> Result<()> {
        // Snapshot under the save lock so the last writer always sees the newest state
        let _guard = self.save_lock.lock().await;

        let snapshot = {
            let tables = self.inner.tables.read().await;
            StateSnapshot {
                version: STATE_VERSION.to_string(),
                servers: tables.servers.values().cloned().collect(),
                processes: tables.processes.values().cloned().collect(),
                last_updated: Utc::now(),
            }
        };

        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            SupervisorError::Store(format!("Failed to serialize state: {}", e))
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SupervisorError::Store(format!("Failed to create state directory: {}", e))
                })?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await.map_err(|e| {
            SupervisorError::Store(format!("Failed to write temp state file: {}", e))
        })?;

        tokio::fs::rename(&temp_path, &self.path).await.map_err(|e| {
            SupervisorError::Store(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn insert_server(&self, record: &ServerRecord) -> Result<()> {
        self.inner.insert_server(record).await?;
        self.persist().await
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>> {
        self.inner.get_server(id).await
    }

    async fn find_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>> {
        self.inner.find_servers(filter).await
    }

    async fn update_server(&self, record: &ServerRecord) -> Result<()> {
        self.inner.update_server(record).await?;
        self.persist().await
    }

    async fn delete_server(&self, id: ServerId) -> Result<bool> {
        let removed = self.inner.delete_server(id).await?;
        self.persist().await?;
        Ok(removed)
    }

    async fn upsert_process(&self, record: &ProcessRecord) -> Result<()> {
        self.inner.upsert_process(record).await?;
        self.persist().await
    }

    async fn get_process(&self, id: ServerId) -> Result<Option<ProcessRecord>> {
        self.inner.get_process(id).await
    }

    async fn delete_process(&self, id: ServerId) -> Result<()> {
        self.inner.delete_process(id).await?;
        self.persist().await
    }

    async fn append_health(&self, sample: &HealthSample) -> Result<()> {
        self.inner.append_health(sample).await
    }

    async fn health_samples(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<HealthSample>> {
        self.inner.health_samples(id, query).await
    }

    async fn append_resource(&self, sample: &ResourceSample) -> Result<()> {
        self.inner.append_resource(sample).await
    }

    async fn resource_samples(
        &self,
        id: ServerId,
        query: &SampleQuery,
    ) -> Result<Vec<ResourceSample>> {
        self.inner.resource_samples(id, query).await
    }

    async fn append_log(&self, record: &LogRecord) -> Result<()> {
        self.inner.append_log(record).await
    }

    async fn log_records(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<LogRecord>> {
        self.inner.log_records(id, query).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        self.inner.prune_before(cutoff).await
    }
}
