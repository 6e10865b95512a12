use crate::error::{Result, SupervisorError};
use crate::logs::decode_line;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// Follows a log file written by someone else, starting at its current end
pub(crate) struct LogTailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    position: u64,
}

impl LogTailer {
    /// Start at the file's current end. A file that does not exist yet is
    /// followed from its beginning once it appears.
    pub async fn at_end(path: &Path) -> Result<Self> {
        let position = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(SupervisorError::Log(format!(
                    "Failed to stat log file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader: None,
            position,
        })
    }

    /// Read the next complete line, if one is available
    pub async fn read_next(&mut self) -> Result<Option<String>> {
        // Truncated or replaced file: start over from the top
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            if meta.len() < self.position {
                self.position = 0;
                self.reader = None;
            }
        }

        if self.reader.is_none() {
            if !self.path.exists() {
                return Ok(None);
            }

            let file = File::open(&self.path)
                .await
                .map_err(|e| SupervisorError::Log(format!("Failed to open log file: {}", e)))?;

            let mut reader = BufReader::new(file);
            reader
                .seek(std::io::SeekFrom::Start(self.position))
                .await
                .map_err(|e| SupervisorError::Log(format!("Failed to seek in log file: {}", e)))?;

            self.reader = Some(reader);
        }

        let Some(ref mut reader) = self.reader else {
            return Ok(None);
        };

        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => Ok(None),
            Ok(n) if !buf.ends_with(b"\n") => {
                // Partial line; rewind and wait for the writer to finish it
                reader
                    .seek(std::io::SeekFrom::Current(-(n as i64)))
                    .await
                    .map_err(|e| {
                        SupervisorError::Log(format!("Failed to seek in log file: {}", e))
                    })?;
                Ok(None)
            }
            Ok(n) => {
                self.position += n as u64;
                Ok(Some(decode_line(&buf).trim_end().to_string()))
            }
            Err(e) => {
                // Possibly rotated; reopen on the next call
                self.reader = None;
                Err(SupervisorError::Log(format!("Failed to read log line: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &Path, text: &str) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(text.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("server.log");
        append(&path, "old line\n").await;

        let mut tailer = LogTailer::at_end(&path).await.unwrap();
        assert_eq!(tailer.read_next().await.unwrap(), None);

        append(&path, "new line\n").await;
        assert_eq!(tailer.read_next().await.unwrap().as_deref(), Some("new line"));
        assert_eq!(tailer.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_waits_for_partial_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("server.log");

        let mut tailer = LogTailer::at_end(&path).await.unwrap();
        assert_eq!(tailer.read_next().await.unwrap(), None);

        append(&path, "half").await;
        assert_eq!(tailer.read_next().await.unwrap(), None);

        append(&path, " done\n").await;
        assert_eq!(
            tailer.read_next().await.unwrap().as_deref(),
            Some("half done")
        );
    }

    #[tokio::test]
    async fn test_moves_past_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("server.log");

        let mut tailer = LogTailer::at_end(&path).await.unwrap();
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"\xff\xfe bad\nafter\n").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(
            tailer.read_next().await.unwrap().as_deref(),
            Some("\u{fffd}\u{fffd} bad")
        );
        assert_eq!(tailer.read_next().await.unwrap().as_deref(), Some("after"));
        assert_eq!(tailer.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restarts_after_truncation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("server.log");
        append(&path, "a fairly long line that will be truncated\n").await;

        let mut tailer = LogTailer::at_end(&path).await.unwrap();
        tokio::fs::write(&path, "fresh\n").await.unwrap();

        assert_eq!(tailer.read_next().await.unwrap().as_deref(), Some("fresh"));
    }
}
