use crate::config::LogSettings;
use crate::error::Result;
use crate::events::{DomainEvent, EventBus};
use crate::logs::tail::LogTailer;
use crate::logs::{decode_line, infer_level, LogQuery, LogSource};
use crate::ring::Ring;
use crate::store::Store;
use crate::types::{LogLevel, LogRecord, ServerId};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// How often a tailed file is polled once its end has been reached
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collects log lines per server from process pipes and tailed files.
///
/// Every line lands in a capped per-server ring, is published as a
/// `LogEntry` event and, when persistence is on, appended to the store.
#[derive(Clone)]
pub struct LogMonitor {
    inner: Arc<LogInner>,
}

struct LogInner {
    buffer_size: usize,
    persist: bool,
    store: Option<Arc<dyn Store>>,
    events: EventBus,
    buffers: RwLock<HashMap<ServerId, Ring<LogRecord>>>,
    tails: Mutex<HashMap<ServerId, JoinHandle<()>>>,
}

impl LogMonitor {
    pub fn new(settings: &LogSettings, store: Option<Arc<dyn Store>>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(LogInner {
                buffer_size: settings.buffer_size,
                persist: settings.persist,
                store,
                events,
                buffers: RwLock::new(HashMap::new()),
                tails: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Capture a child's stdout and stderr until they close
    pub fn attach_streams<O, E>(&self, id: ServerId, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        if let Some(stdout) = stdout {
            self.capture(id, LogSource::Stdout, stdout);
        }
        if let Some(stderr) = stderr {
            self.capture(id, LogSource::Stderr, stderr);
        }
    }

    /// Read lines from `reader` in a background task until EOF
    pub fn capture<R>(&self, id: ServerId, source: LogSource, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    // EOF, the process closed the pipe
                    Ok(0) => break,
                    Ok(_) => {
                        // Keep reading past invalid UTF-8; the child still owns the pipe
                        let line = decode_line(&buf);
                        let level = infer_level(&line, source);
                        monitor
                            .push(id, level, line, Some(json!({ "stream": source.as_str() })))
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!("Stopped reading {} of {}: {}", source.as_str(), id, e);
                        break;
                    }
                }
            }
        })
    }

    /// Follow `path` from its current end.
    ///
    /// Returns `false` when the server already has a tail running.
    pub async fn tail_file(&self, id: ServerId, path: &Path) -> Result<bool> {
        let mut tails = self.inner.tails.lock().await;
        if tails.get(&id).is_some_and(|h| !h.is_finished()) {
            return Ok(false);
        }

        let mut tailer = LogTailer::at_end(path).await?;
        let monitor = self.clone();
        let display_path = path.display().to_string();

        let handle = tokio::spawn(async move {
            loop {
                match tailer.read_next().await {
                    Ok(Some(line)) => {
                        let level = infer_level(&line, LogSource::File);
                        monitor
                            .push(
                                id,
                                level,
                                line,
                                Some(json!({ "stream": "file", "path": display_path })),
                            )
                            .await;
                    }
                    Ok(None) => tokio::time::sleep(TAIL_POLL_INTERVAL).await,
                    Err(e) => {
                        tracing::warn!("Tail of {} for {} failed: {}", display_path, id, e);
                        tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                    }
                }
            }
        });

        tracing::debug!("Tailing {} for server {}", path.display(), id);
        tails.insert(id, handle);
        Ok(true)
    }

    /// Stop following the server's log file. Returns `false` if none was tailed.
    pub async fn stop_tail(&self, id: ServerId) -> bool {
        match self.inner.tails.lock().await.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_tailing(&self, id: ServerId) -> bool {
        self.inner
            .tails
            .lock()
            .await
            .get(&id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Record one line for a server
    pub async fn push(
        &self,
        id: ServerId,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> LogRecord {
        let record = LogRecord {
            server_id: id,
            level,
            message: message.into(),
            metadata,
            timestamp: Utc::now(),
        };

        {
            let mut buffers = self.inner.buffers.write().await;
            buffers
                .entry(id)
                .or_insert_with(|| Ring::new(self.inner.buffer_size))
                .push(record.clone());
        }

        if self.inner.persist {
            if let Some(ref store) = self.inner.store {
                if let Err(e) = store.append_log(&record).await {
                    tracing::warn!("Failed to persist log line for {}: {}", id, e);
                }
            }
        }

        self.inner.events.publish(DomainEvent::LogEntry(record.clone()));
        record
    }

    /// Up to `limit` buffered lines, newest first
    pub async fn recent(&self, id: ServerId, limit: usize) -> Vec<LogRecord> {
        self.inner
            .buffers
            .read()
            .await
            .get(&id)
            .map(|ring| ring.newest(limit))
            .unwrap_or_default()
    }

    /// Buffered lines matching `query`, newest first
    pub async fn search(&self, id: ServerId, query: &LogQuery) -> Vec<LogRecord> {
        let buffers = self.inner.buffers.read().await;
        let Some(ring) = buffers.get(&id) else {
            return Vec::new();
        };

        ring.iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop the server's buffer and stop any tail
    pub async fn clear(&self, id: ServerId) {
        self.stop_tail(id).await;
        self.inner.buffers.write().await.remove(&id);
    }
}
