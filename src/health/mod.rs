// Health module - Periodic probing with history, stats and escalation

mod probe;

pub use probe::{run_probe, Probe, ProbeOutcome};

use crate::config::HealthSettings;
use crate::events::{DomainEvent, EventBus, HealthSignal};
use crate::ring::Ring;
use crate::store::Store;
use crate::types::{HealthSample, ServerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Rolling health figures over a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStats {
    pub checks: usize,
    pub failures: usize,
    pub avg_response_ms: f64,
    pub uptime_percent: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub healthy: Option<bool>,
}

struct HealthTrack {
    history: Ring<HealthSample>,
    healthy: Option<bool>,
    consecutive_failures: u32,
    escalated: bool,
}

/// What changed after recording a sample
struct Transition {
    changed: Option<bool>,
    escalated: Option<u32>,
}

/// Probes each server on its own interval.
///
/// The first probe runs immediately on `start`. A flip between healthy and
/// unhealthy is sent as [`HealthSignal::Changed`]; reaching the failure
/// threshold sends [`HealthSignal::Unhealthy`] once per failure streak.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    interval: Duration,
    timeout: Duration,
    history_size: usize,
    failure_threshold: u32,
    client: reqwest::Client,
    tracks: RwLock<HashMap<ServerId, HealthTrack>>,
    tasks: Mutex<HashMap<ServerId, JoinHandle<()>>>,
    store: Option<Arc<dyn Store>>,
    signals: mpsc::UnboundedSender<HealthSignal>,
    events: EventBus,
}

impl HealthChecker {
    pub fn new(
        settings: &HealthSettings,
        store: Option<Arc<dyn Store>>,
        signals: mpsc::UnboundedSender<HealthSignal>,
        events: EventBus,
    ) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(HealthInner {
                interval: Duration::from_millis(settings.interval_ms),
                timeout,
                history_size: settings.history_size,
                failure_threshold: settings.failure_threshold,
                client,
                tracks: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                store,
                signals,
                events,
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<ServerId, JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin probing. Returns `false` if the server is already being checked.
    pub fn start(&self, id: ServerId, probe: Probe) -> bool {
        let mut tasks = self.tasks();
        if tasks.get(&id).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        debug!("Health checks for {} via {}", id, probe.describe());
        let checker = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let outcome = checker.check_once(&probe).await;
                checker.record(id, outcome).await;
                tokio::time::sleep(checker.inner.interval).await;
            }
        });

        tasks.insert(id, handle);
        true
    }

    /// Stop probing. Health state resets so the next start reports afresh.
    pub async fn stop(&self, id: ServerId) -> bool {
        let stopped = match self.tasks().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };

        if let Some(track) = self.inner.tracks.write().await.get_mut(&id) {
            track.healthy = None;
            track.consecutive_failures = 0;
            track.escalated = false;
        }
        stopped
    }

    pub fn is_checking(&self, id: ServerId) -> bool {
        self.tasks().get(&id).is_some_and(|h| !h.is_finished())
    }

    /// Run a probe without recording anything
    pub async fn check_once(&self, probe: &Probe) -> ProbeOutcome {
        run_probe(probe, &self.inner.client, self.inner.timeout).await
    }

    async fn record(&self, id: ServerId, outcome: ProbeOutcome) {
        let sample = HealthSample {
            server_id: id,
            healthy: outcome.healthy,
            response_time_ms: outcome.response_time_ms,
            error: outcome.error,
            timestamp: Utc::now(),
        };

        if let Some(ref error) = sample.error {
            debug!("Health check failed for {}: {}", id, error);
        }

        let transition = {
            let mut tracks = self.inner.tracks.write().await;
            let track = tracks.entry(id).or_insert_with(|| HealthTrack {
                history: Ring::new(self.inner.history_size),
                healthy: None,
                consecutive_failures: 0,
                escalated: false,
            });
            track.history.push(sample.clone());

            let changed = (track.healthy != Some(sample.healthy)).then_some(sample.healthy);
            track.healthy = Some(sample.healthy);

            let mut escalated = None;
            if sample.healthy {
                track.consecutive_failures = 0;
                track.escalated = false;
            } else {
                track.consecutive_failures += 1;
                if track.consecutive_failures >= self.inner.failure_threshold && !track.escalated
                {
                    track.escalated = true;
                    escalated = Some(track.consecutive_failures);
                }
            }
            Transition { changed, escalated }
        };

        if let Some(ref store) = self.inner.store {
            if let Err(e) = store.append_health(&sample).await {
                warn!("Failed to persist health sample for {}: {}", id, e);
            }
        }

        if let Some(healthy) = transition.changed {
            info!(
                "Server {} is now {}",
                id,
                if healthy { "healthy" } else { "unhealthy" }
            );
            self.inner.events.publish(DomainEvent::HealthChanged {
                server_id: id,
                healthy,
            });
            let _ = self.inner.signals.send(HealthSignal::Changed {
                server_id: id,
                healthy,
            });
        }

        if let Some(consecutive_failures) = transition.escalated {
            warn!(
                "Server {} failed {} consecutive health checks",
                id, consecutive_failures
            );
            self.inner.events.publish(DomainEvent::HealthEscalated {
                server_id: id,
                consecutive_failures,
            });
            let _ = self.inner.signals.send(HealthSignal::Unhealthy {
                server_id: id,
                consecutive_failures,
            });
        }
    }

    /// Up to `limit` samples, newest first
    pub async fn history(&self, id: ServerId, limit: usize) -> Vec<HealthSample> {
        self.inner
            .tracks
            .read()
            .await
            .get(&id)
            .map(|t| t.history.newest(limit))
            .unwrap_or_default()
    }

    /// Stats over the buffered samples, optionally only those within `window`
    pub async fn stats(&self, id: ServerId, window: Option<Duration>) -> HealthStats {
        let tracks = self.inner.tracks.read().await;
        let Some(track) = tracks.get(&id) else {
            return HealthStats {
                checks: 0,
                failures: 0,
                avg_response_ms: 0.0,
                uptime_percent: 0.0,
                last_check: None,
                healthy: None,
            };
        };

        let cutoff = window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .map(|w| Utc::now() - w);
        let samples: Vec<&HealthSample> = track
            .history
            .iter()
            .filter(|s| cutoff.map_or(true, |c| s.timestamp >= c))
            .collect();

        let checks = samples.len();
        let failures = samples.iter().filter(|s| !s.healthy).count();
        let (avg_response_ms, uptime_percent) = if checks == 0 {
            (0.0, 0.0)
        } else {
            let total: u64 = samples.iter().map(|s| s.response_time_ms).sum();
            (
                total as f64 / checks as f64,
                (checks - failures) as f64 * 100.0 / checks as f64,
            )
        };

        HealthStats {
            checks,
            failures,
            avg_response_ms,
            uptime_percent,
            last_check: samples.last().map(|s| s.timestamp),
            healthy: track.healthy,
        }
    }

    /// Stop probing and drop the history
    pub async fn forget(&self, id: ServerId) {
        self.stop(id).await;
        self.inner.tracks.write().await.remove(&id);
    }
}
