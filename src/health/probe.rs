use crate::process::terminate::{has_exited, ExitWatch};
use crate::types::{ServerRecord, Transport};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Fixed key from RFC 6455; the handshake is only checked for its status line
const WEBSOCKET_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// How a server's health is determined
#[derive(Debug, Clone)]
pub enum Probe {
    /// GET the URL, healthy on any 2xx
    Http { url: String },
    /// Websocket upgrade handshake, healthy on `101 Switching Protocols`
    Socket { host: String, port: u16 },
    /// Stdio servers have no endpoint; healthy while the process is alive
    Process { pid: u32, exit: ExitWatch },
}

impl Probe {
    /// Pick the probe matching the server's transport
    pub fn for_server(
        record: &ServerRecord,
        host: &str,
        default_path: &str,
        pid: u32,
        exit: ExitWatch,
    ) -> Self {
        match record.transport {
            Transport::Stream | Transport::EventStream => {
                let path = record
                    .launch
                    .health_path
                    .as_deref()
                    .unwrap_or(default_path);
                Probe::Http {
                    url: format!("http://{}:{}{}", host, record.port, path),
                }
            }
            Transport::Socket => Probe::Socket {
                host: host.to_string(),
                port: record.port,
            },
            Transport::Stdio => Probe::Process { pid, exit },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Probe::Http { url } => format!("GET {}", url),
            Probe::Socket { host, port } => format!("ws://{}:{}", host, port),
            Probe::Process { pid, .. } => format!("pid {}", pid),
        }
    }
}

/// Result of running a probe once
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn from_result(started: Instant, result: std::result::Result<(), String>) -> Self {
        let response_time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Self {
                healthy: true,
                response_time_ms,
                error: None,
            },
            Err(error) => Self {
                healthy: false,
                response_time_ms,
                error: Some(error),
            },
        }
    }
}

/// Run `probe` once, bounded by `timeout`
pub async fn run_probe(probe: &Probe, client: &reqwest::Client, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let result = match probe {
        Probe::Http { url } => probe_http(client, url, timeout).await,
        Probe::Socket { host, port } => {
            match tokio::time::timeout(timeout, probe_socket(host, *port)).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            }
        }
        Probe::Process { pid, exit } => {
            if has_exited(exit) {
                Err(format!("process {} is not running", pid))
            } else {
                Ok(())
            }
        }
    };
    ProbeOutcome::from_result(started, result)
}

async fn probe_http(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {:?}", timeout)
            } else {
                format!("request failed: {}", e)
            }
        })?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status {}", status))
    }
}

async fn probe_socket(host: &str, port: u16) -> std::result::Result<(), String> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| format!("connect failed: {}", e))?;

    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        host, port, WEBSOCKET_KEY
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("handshake write failed: {}", e))?;

    let mut buf = [0u8; 512];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| format!("handshake read failed: {}", e))?;
    if n == 0 {
        return Err("connection closed during handshake".to_string());
    }

    let response = String::from_utf8_lossy(&buf[..n]);
    let status_line = response.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("101") => Ok(()),
        Some(code) => Err(format!("handshake rejected with status {}", code)),
        None => Err(format!("malformed handshake response: {}", status_line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    /// Answer every connection with `response` after reading the request
    async fn serve(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let port = serve("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let probe = Probe::Http {
            url: format!("http://127.0.0.1:{}/health", port),
        };

        let outcome = run_probe(&probe, &client(), Duration::from_secs(2)).await;
        assert!(outcome.healthy, "{:?}", outcome.error);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_http_probe_non_2xx() {
        let port = serve(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = Probe::Http {
            url: format!("http://127.0.0.1:{}/health", port),
        };

        let outcome = run_probe(&probe, &client(), Duration::from_secs(2)).await;
        assert!(!outcome.healthy);
        assert!(outcome.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = Probe::Http {
            url: format!("http://127.0.0.1:{}/health", port),
        };

        let outcome = run_probe(&probe, &client(), Duration::from_secs(2)).await;
        assert!(!outcome.healthy);
    }

    #[tokio::test]
    async fn test_socket_probe_upgrade() {
        let port = serve(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await;
        let probe = Probe::Socket {
            host: "127.0.0.1".to_string(),
            port,
        };

        let outcome = run_probe(&probe, &client(), Duration::from_secs(2)).await;
        assert!(outcome.healthy, "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn test_socket_probe_rejected() {
        let port = serve("HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
        let probe = Probe::Socket {
            host: "127.0.0.1".to_string(),
            port,
        };

        let outcome = run_probe(&probe, &client(), Duration::from_secs(2)).await;
        assert!(!outcome.healthy);
        assert!(outcome.error.unwrap().contains("400"));
    }

    #[tokio::test]
    async fn test_process_probe() {
        let (tx, rx) = watch::channel(None);
        let probe = Probe::Process { pid: 42, exit: rx };

        assert!(run_probe(&probe, &client(), Duration::from_secs(1)).await.healthy);

        tx.send(Some(crate::process::ExitInfo {
            code: Some(0),
            signal: None,
        }))
        .unwrap();
        assert!(!run_probe(&probe, &client(), Duration::from_secs(1)).await.healthy);
    }

    #[test]
    fn test_probe_for_transport() {
        let mut record = crate::types::ServerRecord {
            transport: Transport::EventStream,
            ..sample_record()
        };
        record.launch.health_path = Some("/ready".to_string());
        let (_tx, rx) = watch::channel(None);

        match Probe::for_server(&record, "127.0.0.1", "/health", 1, rx.clone()) {
            Probe::Http { url } => assert_eq!(url, "http://127.0.0.1:9100/ready"),
            other => panic!("unexpected probe {:?}", other),
        }

        record.transport = Transport::Stdio;
        assert!(matches!(
            Probe::for_server(&record, "127.0.0.1", "/health", 7, rx),
            Probe::Process { pid: 7, .. }
        ));
    }

    fn sample_record() -> crate::types::ServerRecord {
        let now = chrono::Utc::now();
        crate::types::ServerRecord {
            id: crate::types::ServerId::new(),
            name: "probe-target".to_string(),
            version: "1.0.0".to_string(),
            port: 9100,
            transport: Transport::Stream,
            status: crate::types::ServerStatus::Running,
            endpoint: None,
            healthy: false,
            last_error: None,
            metrics: Default::default(),
            auto_start: false,
            launch: crate::types::LaunchConfig::new("/bin/true"),
            config: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}
