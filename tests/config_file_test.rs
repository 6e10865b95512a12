// Integration test for settings file support

use gateway_supervisor::{SupervisorError, SupervisorSettings, Transport};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_load_toml_settings_with_servers() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.toml");

    let toml_content = r#"
        [supervisor]
        host = "0.0.0.0"
        stop_timeout_ms = 3000
        port_range = [9100, 9200]

        [restart]
        base_delay_ms = 500
        max_delay_ms = 8000
        max_attempts = 4

        [health]
        interval_ms = 10000
        failure_threshold = 5
        path = "/healthz"

        [[servers]]
        name = "search"
        transport = "event-stream"
        command = "/usr/bin/node"
        args = ["search.js", "--port", "{port}"]
        port = 9150
        auto_start = true
        health_path = "/ready"

        [[servers]]
        name = "files"
        transport = "stdio"
        command = "/usr/local/bin/files-server"
    "#;

    fs::write(&config_path, toml_content).unwrap();

    let settings = SupervisorSettings::from_file(&config_path).unwrap();
    assert_eq!(settings.supervisor.host, "0.0.0.0");
    assert_eq!(settings.supervisor.stop_timeout_ms, 3000);
    assert_eq!(settings.supervisor.port_range, (9100, 9200));
    assert_eq!(settings.restart.base_delay_ms, 500);
    assert_eq!(settings.restart.max_attempts, 4);
    assert_eq!(settings.restart.min_uptime_ms, 5_000);
    assert_eq!(settings.health.failure_threshold, 5);
    assert_eq!(settings.health.path, "/healthz");

    assert_eq!(settings.servers.len(), 2);
    let search = &settings.servers[0];
    assert_eq!(search.transport, Transport::EventStream);
    assert_eq!(search.port, Some(9150));
    assert!(search.auto_start);
    assert_eq!(search.launch.health_path.as_deref(), Some("/ready"));

    let files = &settings.servers[1];
    assert_eq!(files.transport, Transport::Stdio);
    assert_eq!(files.port, None);
    assert!(!files.auto_start);
}

#[test]
fn test_load_json_settings() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.json");

    let json_content = r#"
        {
            "logs": { "buffer_size": 50, "persist": false },
            "retention": { "days": 2 },
            "servers": [
                {
                    "name": "weather",
                    "transport": "socket",
                    "command": "/usr/bin/python3",
                    "args": ["weather.py"],
                    "env": { "API_KEY": "abc" },
                    "stop_timeout_ms": 1500,
                    "config": { "restart_policy": "always" }
                }
            ]
        }
    "#;

    fs::write(&config_path, json_content).unwrap();

    let settings = SupervisorSettings::from_file(&config_path).unwrap();
    assert_eq!(settings.logs.buffer_size, 50);
    assert!(!settings.logs.persist);
    assert_eq!(settings.retention.days, 2);
    assert_eq!(settings.retention.prune_interval_ms, 3_600_000);

    let weather = &settings.servers[0];
    assert_eq!(weather.transport, Transport::Socket);
    assert_eq!(weather.launch.env.get("API_KEY"), Some(&"abc".to_string()));
    assert_eq!(weather.launch.stop_timeout_ms, Some(1500));
    assert_eq!(weather.config["restart_policy"], "always");
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.toml");
    fs::write(&config_path, "").unwrap();

    let settings = SupervisorSettings::from_file(&config_path).unwrap();
    assert_eq!(settings, SupervisorSettings::default());
}

#[test]
fn test_settings_validation_rejects_zero_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.toml");

    fs::write(&config_path, "[health]\nfailure_threshold = 0\n").unwrap();

    let result = SupervisorSettings::from_file(&config_path);
    assert!(matches!(result, Err(SupervisorError::Config(_))));
}

#[test]
fn test_settings_validation_rejects_relative_health_path() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.json");

    fs::write(&config_path, r#"{ "health": { "path": "health" } }"#).unwrap();

    assert!(SupervisorSettings::from_file(&config_path).is_err());
}

#[test]
fn test_malformed_toml_is_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.toml");

    fs::write(&config_path, "[restart\nmax_attempts = ").unwrap();

    let result = SupervisorSettings::from_file(&config_path);
    assert!(matches!(result, Err(SupervisorError::InvalidConfig(_))));
}

#[test]
fn test_unknown_transport_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.json");

    let json_content = r#"
        { "servers": [ { "name": "x", "transport": "carrier-pigeon", "command": "/bin/true" } ] }
    "#;
    fs::write(&config_path, json_content).unwrap();

    assert!(SupervisorSettings::from_file(&config_path).is_err());
}

#[test]
fn test_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = SupervisorSettings::from_file(&temp_dir.path().join("absent.toml"));
    assert!(matches!(result, Err(SupervisorError::Config(_))));
}

#[test]
fn test_env_var_expansion_in_servers() {
    std::env::set_var("GWSUP_IT_BIN", "/opt/gateway/bin");
    std::env::set_var("GWSUP_IT_REGION", "eu-west");

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("supervisor.json");

    let json_content = r#"
        {
            "servers": [
                {
                    "name": "regional",
                    "transport": "stream",
                    "command": "$GWSUP_IT_BIN/server",
                    "args": ["--region=${GWSUP_IT_REGION}"],
                    "env": { "REGION": "$GWSUP_IT_REGION" }
                }
            ]
        }
    "#;

    fs::write(&config_path, json_content).unwrap();

    let settings = SupervisorSettings::from_file(&config_path).unwrap();
    let server = &settings.servers[0];
    assert_eq!(server.launch.command, PathBuf::from("/opt/gateway/bin/server"));
    assert_eq!(server.launch.args[0], "--region=eu-west");
    assert_eq!(server.launch.env.get("REGION"), Some(&"eu-west".to_string()));
}
