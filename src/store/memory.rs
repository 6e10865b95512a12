use crate::error::{Result, SupervisorError};
use crate::store::{PruneReport, SampleQuery, ServerFilter, Store};
use crate::types::{
    HealthSample, LogRecord, ProcessRecord, ResourceSample, ServerId, ServerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Record tables held by the in-memory store
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub servers: HashMap<ServerId, ServerRecord>,
    pub processes: HashMap<ServerId, ProcessRecord>,
    pub health: HashMap<ServerId, Vec<HealthSample>>,
    pub resources: HashMap<ServerId, Vec<ResourceSample>>,
    pub logs: HashMap<ServerId, Vec<LogRecord>>,
}

/// Store keeping every table in memory; lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub(crate) tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }
}

fn prune_series<T>(
    series: &mut HashMap<ServerId, Vec<T>>,
    cutoff: DateTime<Utc>,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> usize {
    let mut removed = 0;
    for entries in series.values_mut() {
        let before = entries.len();
        entries.retain(|e| timestamp(e) >= cutoff);
        removed += before - entries.len();
    }
    series.retain(|_, entries| !entries.is_empty());
    removed
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_server(&self, record: &ServerRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.servers.contains_key(&record.id) {
            return Err(SupervisorError::Store(format!(
                "Server record already exists: {}",
                record.id
            )));
        }
        tables.servers.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>> {
        Ok(self.tables.read().await.servers.get(&id).cloned())
    }

    async fn find_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<ServerRecord> = tables
            .servers
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        // Stable order for pagination
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(records
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn update_server(&self, record: &ServerRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.servers.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(SupervisorError::NotFound(record.id.to_string())),
        }
    }

    async fn delete_server(&self, id: ServerId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let removed = tables.servers.remove(&id).is_some();
        tables.processes.remove(&id);
        Ok(removed)
    }

    async fn upsert_process(&self, record: &ProcessRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .processes
            .insert(record.server_id, record.clone());
        Ok(())
    }

    async fn get_process(&self, id: ServerId) -> Result<Option<ProcessRecord>> {
        Ok(self.tables.read().await.processes.get(&id).cloned())
    }

    async fn delete_process(&self, id: ServerId) -> Result<()> {
        self.tables.write().await.processes.remove(&id);
        Ok(())
    }

    async fn append_health(&self, sample: &HealthSample) -> Result<()> {
        self.tables
            .write()
            .await
            .health
            .entry(sample.server_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn health_samples(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<HealthSample>> {
        let tables = self.tables.read().await;
        Ok(tables
            .health
            .get(&id)
            .map(|s| query.apply(s, |h| h.timestamp))
            .unwrap_or_default())
    }

    async fn append_resource(&self, sample: &ResourceSample) -> Result<()> {
        self.tables
            .write()
            .await
            .resources
            .entry(sample.server_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn resource_samples(
        &self,
        id: ServerId,
        query: &SampleQuery,
    ) -> Result<Vec<ResourceSample>> {
        let tables = self.tables.read().await;
        Ok(tables
            .resources
            .get(&id)
            .map(|s| query.apply(s, |r| r.timestamp))
            .unwrap_or_default())
    }

    async fn append_log(&self, record: &LogRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .logs
            .entry(record.server_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn log_records(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<LogRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .logs
            .get(&id)
            .map(|s| query.apply(s, |l| l.timestamp))
            .unwrap_or_default())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let mut tables = self.tables.write().await;
        Ok(PruneReport {
            health: prune_series(&mut tables.health, cutoff, |h| h.timestamp),
            resources: prune_series(&mut tables.resources, cutoff, |r| r.timestamp),
            logs: prune_series(&mut tables.logs, cutoff, |l| l.timestamp),
        })
    }
}
