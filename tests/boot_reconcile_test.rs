#![cfg(unix)]

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{fast_settings, sleeper_spec, unused_port};
use gateway_supervisor::types::{LaunchConfig, ProcessRecord, ProcessStatus, ServerMetrics};
use gateway_supervisor::{
    BasicValidator, FileStore, ServerId, ServerOrchestrator, ServerRecord, ServerStatus, Store,
    Transport,
};
use std::sync::Arc;
use tempfile::TempDir;

fn record(name: &str, port: u16, status: ServerStatus, age_secs: i64) -> ServerRecord {
    let at = Utc::now() - ChronoDuration::seconds(age_secs);
    let mut launch = LaunchConfig::new("/bin/sleep");
    launch.args = vec!["30".to_string()];
    ServerRecord {
        id: ServerId::new(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        port,
        transport: Transport::Stdio,
        status,
        endpoint: Some("stdio://1".to_string()),
        healthy: status == ServerStatus::Running,
        last_error: None,
        metrics: ServerMetrics::default(),
        auto_start: false,
        launch,
        config: serde_json::Value::Null,
        created_at: at,
        updated_at: at,
    }
}

async fn open_store(dir: &TempDir) -> Arc<dyn Store> {
    Arc::new(FileStore::open(dir.path().join("state.json")).await.unwrap())
}

#[tokio::test]
async fn test_reconcile_resets_stale_and_resolves_duplicates() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let base = unused_port();
    let old_alpha = record("alpha", base, ServerStatus::Running, 600);
    let new_alpha = record("alpha", base.wrapping_add(1), ServerStatus::Stopped, 60);
    let beta = record("beta", base.wrapping_add(2), ServerStatus::Starting, 30);
    let gamma = record("gamma", base.wrapping_add(2), ServerStatus::Stopped, 300);

    for r in [&old_alpha, &new_alpha, &beta, &gamma] {
        store.insert_server(r).await.unwrap();
    }
    store
        .upsert_process(&ProcessRecord {
            server_id: beta.id,
            pid: 999_999,
            start_time: Utc::now(),
            status: ProcessStatus::Running,
            restart_count: 0,
            last_error: None,
        })
        .await
        .unwrap();

    let orchestrator =
        ServerOrchestrator::new(fast_settings(), Arc::clone(&store), Arc::new(BasicValidator));
    let report = orchestrator.reconcile().await.unwrap();

    // The newest record keeps the name
    assert_eq!(report.removed, vec![old_alpha.id]);
    assert!(store.get_server(old_alpha.id).await.unwrap().is_none());
    assert!(store.get_server(new_alpha.id).await.unwrap().is_some());

    // The newer of beta/gamma keeps the shared port
    assert_eq!(report.relocated.len(), 1);
    let (moved, old_port, new_port) = report.relocated[0];
    assert_eq!(moved, gamma.id);
    assert_eq!(old_port, beta.port);
    let gamma_now = store.get_server(gamma.id).await.unwrap().unwrap();
    assert_eq!(gamma_now.port, new_port);
    assert_ne!(new_port, beta.port);

    // In-flight statuses from the previous run are reset
    assert_eq!(report.reset, vec![beta.id]);
    let beta_now = store.get_server(beta.id).await.unwrap().unwrap();
    assert_eq!(beta_now.status, ServerStatus::Stopped);
    assert!(beta_now.endpoint.is_none());
    assert!(!beta_now.healthy);

    let process = store.get_process(beta.id).await.unwrap().unwrap();
    assert_eq!(process.status, ProcessStatus::Stopped);

    // Names and ports are now unique
    let servers = orchestrator.list().await.unwrap();
    assert_eq!(servers.len(), 3);
    let mut ports: Vec<u16> = servers.iter().map(|s| s.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);
}

#[tokio::test]
async fn test_reconciled_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let stale = record("stale", unused_port(), ServerStatus::Running, 10);
    {
        let store = open_store(&dir).await;
        store.insert_server(&stale).await.unwrap();

        let orchestrator =
            ServerOrchestrator::new(fast_settings(), store, Arc::new(BasicValidator));
        orchestrator.boot().await.unwrap();
        orchestrator.shutdown().await;
    }

    let reopened = open_store(&dir).await;
    let record = reopened.get_server(stale.id).await.unwrap().unwrap();
    assert_eq!(record.status, ServerStatus::Stopped);
}

#[tokio::test]
async fn test_boot_registers_declared_servers_and_auto_starts() {
    let dir = TempDir::new().unwrap();

    let mut settings = fast_settings();
    let mut declared = sleeper_spec("declared");
    declared.auto_start = true;
    settings.servers.push(declared);
    settings.servers.push(sleeper_spec("manual"));

    let first_id = {
        let store = open_store(&dir).await;
        let orchestrator =
            ServerOrchestrator::new(settings.clone(), store, Arc::new(BasicValidator));
        let report = orchestrator.boot().await.unwrap();

        assert_eq!(report.registered.len(), 2);
        assert_eq!(report.auto_start.started.len(), 1);
        assert!(report.auto_start.failed.is_empty());

        let declared = orchestrator.find_by_name("declared").await.unwrap().unwrap();
        assert_eq!(declared.status, ServerStatus::Running);
        assert_eq!(report.auto_start.started[0], declared.id);

        let manual = orchestrator.find_by_name("manual").await.unwrap().unwrap();
        assert_eq!(manual.status, ServerStatus::Stopped);

        orchestrator.shutdown().await;
        declared.id
    };

    // A second boot finds the names already registered
    let store = open_store(&dir).await;
    let orchestrator = ServerOrchestrator::new(settings, store, Arc::new(BasicValidator));
    let report = orchestrator.boot().await.unwrap();

    assert!(report.registered.is_empty());
    assert_eq!(report.auto_start.started, vec![first_id]);
    assert_eq!(orchestrator.list().await.unwrap().len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_auto_start_skips_port_in_use() {
    let dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut settings = fast_settings();
    let mut blocked = sleeper_spec("blocked");
    blocked.port = Some(port);
    blocked.auto_start = true;
    let mut free = sleeper_spec("free");
    free.auto_start = true;
    settings.servers = vec![blocked, free];

    let store = open_store(&dir).await;
    let orchestrator = ServerOrchestrator::new(settings, store, Arc::new(BasicValidator));
    let report = orchestrator.boot().await.unwrap();

    let blocked = orchestrator.find_by_name("blocked").await.unwrap().unwrap();
    assert_eq!(report.auto_start.skipped.len(), 1);
    assert_eq!(report.auto_start.skipped[0].0, blocked.id);
    assert!(report.auto_start.skipped[0].1.contains(&port.to_string()));
    assert_eq!(blocked.status, ServerStatus::Stopped);
    assert_eq!(report.auto_start.started.len(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_prune_now_drops_old_samples() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let orchestrator =
        ServerOrchestrator::new(fast_settings(), Arc::clone(&store), Arc::new(BasicValidator));
    let id = orchestrator.create(sleeper_spec("pruned")).await.unwrap().id;

    store
        .append_health(&gateway_supervisor::types::HealthSample {
            server_id: id,
            healthy: true,
            response_time_ms: 3,
            error: None,
            timestamp: Utc::now() - ChronoDuration::days(30),
        })
        .await
        .unwrap();

    let report = orchestrator.prune_now().await.unwrap();
    assert_eq!(report.health, 1);
}
