// Logs module - Per-server log capture, tailing and search

mod monitor;
mod tail;

pub use monitor::LogMonitor;

use crate::types::{LogLevel, LogRecord};
use chrono::{DateTime, Utc};

/// Where a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    File,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::File => "file",
        }
    }
}

/// Filter for searching buffered log lines
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    /// Case-insensitive substring
    pub keyword: Option<String>,
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: Some(keyword.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(level) = self.level {
            if record.level != level {
                return false;
            }
        }
        if self.since.is_some_and(|s| record.timestamp < s)
            || self.until.is_some_and(|u| record.timestamp > u)
        {
            return false;
        }
        match self.keyword {
            Some(ref keyword) => record
                .message
                .to_lowercase()
                .contains(&keyword.to_lowercase()),
            None => true,
        }
    }
}

/// One raw line without its terminator, invalid UTF-8 replaced
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Level from a leading marker in the line, else a per-source default
pub fn infer_level(line: &str, source: LogSource) -> LogLevel {
    let head: String = line.chars().take(40).collect::<String>().to_uppercase();

    if head.contains("ERROR") || head.contains("FATAL") || head.contains("PANIC") {
        LogLevel::Error
    } else if head.contains("WARN") {
        LogLevel::Warn
    } else if head.contains("DEBUG") || head.contains("TRACE") {
        LogLevel::Debug
    } else if head.contains("INFO") {
        LogLevel::Info
    } else {
        match source {
            LogSource::Stderr => LogLevel::Warn,
            LogSource::Stdout | LogSource::File => LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerId;
    use chrono::Duration;

    #[test]
    fn test_decode_line_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"plain\r\n"), "plain");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{fffd}b");
        assert_eq!(decode_line(b"no newline"), "no newline");
    }

    #[test]
    fn test_infer_level() {
        assert_eq!(
            infer_level("2024-01-01 ERROR db down", LogSource::Stdout),
            LogLevel::Error
        );
        assert_eq!(infer_level("[warn] slow", LogSource::Stdout), LogLevel::Warn);
        assert_eq!(infer_level("INFO ready", LogSource::Stderr), LogLevel::Info);
        assert_eq!(infer_level("plain", LogSource::Stderr), LogLevel::Warn);
        assert_eq!(infer_level("plain", LogSource::File), LogLevel::Info);
    }

    #[test]
    fn test_query_time_range() {
        let now = Utc::now();
        let record = LogRecord {
            server_id: ServerId::new(),
            level: LogLevel::Info,
            message: "Ready".to_string(),
            metadata: None,
            timestamp: now,
        };

        let query = LogQuery {
            since: Some(now - Duration::seconds(1)),
            until: Some(now + Duration::seconds(1)),
            ..LogQuery::keyword("ready")
        };
        assert!(query.matches(&record));

        let query = LogQuery {
            since: Some(now + Duration::seconds(1)),
            ..LogQuery::default()
        };
        assert!(!query.matches(&record));
    }
}
