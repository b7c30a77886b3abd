use serde::Serialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

const DEFAULT_MAX_BYTES: u64 = 102_400;
pub const FAILURE_CHANNEL_CAPACITY: usize = 1024;

/// Append-only JSON lines file of requests that ended in a fallback image.
#[derive(Clone)]
pub struct FailureLog {
    path: PathBuf,
    max_bytes: u64,
    guard: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
pub struct FailureLogEntry {
    pub timestamp: String,
    pub timestamp_ms: u64,
    pub path: String,
    pub error_kind: String,
    pub reason: String,
}

impl FailureLogEntry {
    pub fn new(path: String, error_kind: &str, reason: String) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp,
            timestamp_ms,
            path,
            error_kind: error_kind.to_string(),
            reason,
        }
    }
}

impl FailureLog {
    pub fn new(path: PathBuf, max_bytes: u64) -> Option<Self> {
        if path.as_os_str().is_empty() {
            return None;
        }
        let max_bytes = if max_bytes == 0 {
            DEFAULT_MAX_BYTES
        } else {
            max_bytes
        };
        Some(Self {
            path,
            max_bytes,
            guard: Arc::new(Mutex::new(())),
        })
    }

    /// Appends one entry. Failures are logged and never reach the request.
    pub async fn write(&self, entry: FailureLogEntry) {
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = ?err, "failed to serialize failure log entry");
                return;
            }
        };
        line.push(b'\n');
        let _guard = self.guard.lock().await;
        if let Err(err) = self.append(&line).await {
            warn!(error = ?err, path = %self.path.display(), "failed to write failure log");
        }
    }

    /// Starts the file over when `line` would push it past `max_bytes`.
    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let current = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        let truncate = current.saturating_add(line.len() as u64) > self.max_bytes;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(!truncate)
            .truncate(truncate)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.flush().await
    }
}

pub async fn run_failure_log(log: FailureLog, mut receiver: mpsc::Receiver<FailureLogEntry>) {
    while let Some(entry) = receiver.recv().await {
        log.write(entry).await;
    }
}
