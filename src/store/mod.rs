// Store module - Durable record storage used by the orchestrator

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{
    HealthSample, LogRecord, ProcessRecord, ResourceSample, ServerId, ServerRecord, ServerStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Equality filters and pagination over server records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerFilter {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub status: Option<ServerStatus>,
    pub auto_start: Option<bool>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ServerFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn by_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ServerRecord) -> bool {
        self.name.as_ref().map_or(true, |n| &record.name == n)
            && self.port.map_or(true, |p| record.port == p)
            && self.status.map_or(true, |s| record.status == s)
            && self.auto_start.map_or(true, |a| record.auto_start == a)
    }
}

/// Range filter and limit over a time series; results are newest first
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SampleQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| timestamp >= s) && self.until.map_or(true, |u| timestamp <= u)
    }

    /// Apply range and limit to a series stored oldest first
    pub fn apply<T: Clone>(&self, series: &[T], timestamp: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
        series
            .iter()
            .rev()
            .filter(|item| self.contains(timestamp(item)))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Number of series entries removed by a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub health: usize,
    pub resources: usize,
    pub logs: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.health + self.resources + self.logs
    }
}

/// CRUD and filter primitives the supervisor needs from durable storage
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_server(&self, record: &ServerRecord) -> Result<()>;
    async fn get_server(&self, id: ServerId) -> Result<Option<ServerRecord>>;
    async fn find_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>>;
    async fn update_server(&self, record: &ServerRecord) -> Result<()>;
    async fn delete_server(&self, id: ServerId) -> Result<bool>;

    async fn upsert_process(&self, record: &ProcessRecord) -> Result<()>;
    async fn get_process(&self, id: ServerId) -> Result<Option<ProcessRecord>>;
    async fn delete_process(&self, id: ServerId) -> Result<()>;

    async fn append_health(&self, sample: &HealthSample) -> Result<()>;
    async fn health_samples(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<HealthSample>>;

    async fn append_resource(&self, sample: &ResourceSample) -> Result<()>;
    async fn resource_samples(
        &self,
        id: ServerId,
        query: &SampleQuery,
    ) -> Result<Vec<ResourceSample>>;

    async fn append_log(&self, record: &LogRecord) -> Result<()>;
    async fn log_records(&self, id: ServerId, query: &SampleQuery) -> Result<Vec<LogRecord>>;

    /// Drop series entries older than `cutoff`
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport>;
}
