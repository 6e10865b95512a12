// Shared helpers for integration tests
#![allow(dead_code)]

use gateway_supervisor::{
    BasicValidator, MemoryStore, ServerId, ServerOrchestrator, ServerSpec, ServerStatus, Store,
    SupervisorSettings, Transport,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Settings with short delays so restart and health behaviour is observable quickly
pub fn fast_settings() -> SupervisorSettings {
    let mut settings = SupervisorSettings::default();
    settings.supervisor.stop_timeout_ms = 2_000;
    settings.supervisor.port_range = (21_000, 22_000);
    settings.restart.base_delay_ms = 50;
    settings.restart.max_delay_ms = 400;
    settings.restart.min_uptime_ms = 300;
    settings.health.interval_ms = 200;
    settings.health.timeout_ms = 200;
    settings.resources.interval_ms = 200;
    settings.retention.prune_interval_ms = 60_000;
    settings
}

pub fn orchestrator(settings: SupervisorSettings) -> (ServerOrchestrator, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let orchestrator =
        ServerOrchestrator::new(settings, Arc::clone(&store), Arc::new(BasicValidator));
    (orchestrator, store)
}

/// Stdio server running `sh -c script`
pub fn shell_spec(name: &str, script: &str) -> ServerSpec {
    let mut spec = ServerSpec::new(name, Transport::Stdio, "/bin/sh");
    spec.launch.args = vec!["-c".to_string(), script.to_string()];
    spec
}

pub fn sleeper_spec(name: &str) -> ServerSpec {
    let mut spec = ServerSpec::new(name, Transport::Stdio, "/bin/sleep");
    spec.launch.args = vec!["30".to_string()];
    spec
}

/// Long enough past `fast_settings` min uptime that an exit counts as a crash
pub const SETTLED: Duration = Duration::from_millis(400);

/// Poll `check` every 25ms until it returns true or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_status(
    orchestrator: &ServerOrchestrator,
    id: ServerId,
    status: ServerStatus,
    timeout: Duration,
) -> bool {
    wait_for(timeout, || {
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator
                .get(id)
                .await
                .map(|r| r.status == status)
                .unwrap_or(false)
        }
    })
    .await
}

/// Port nobody is listening on right now
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
