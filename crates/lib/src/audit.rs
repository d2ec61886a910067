//! Append-only audit trail: one JSON object per line, one line per inbound request plus
//! service start/stop records.
//!
//! The sink is the only shared mutable resource in the gateway. [`FileSink`] serializes
//! writers behind a mutex and flushes each line to disk before releasing it, so concurrent
//! requests never interleave partial records. A write that fails halfway is cut back off
//! the file; if even that fails, the next record starts on a fresh line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::exec::ExecutionResult;
use crate::gateway::RunRequest;

/// Caller address used for lifecycle records.
pub const SYSTEM_CALLER: &str = "system";

/// Disposition of one audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    AuthFailed,
    Rejected,
    Completed,
    ServiceStart,
    ServiceStop,
}

/// One audit line. Field names match the log format consumed by external tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    #[serde(rename = "ip")]
    pub caller: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl AuditRecord {
    fn base(caller: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            timestamp: now_rfc3339(),
            caller: caller.into(),
            command: String::new(),
            args: Vec::new(),
            cwd: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            status,
            reason: None,
        }
    }

    fn with_request(mut self, req: &RunRequest) -> Self {
        self.command = req.command.clone();
        self.args = req.args.clone();
        self.cwd = req.cwd.clone();
        self
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn auth_failed(caller: impl Into<String>) -> Self {
        Self::base(caller, AuditStatus::AuthFailed).with_reason("invalid or missing token")
    }

    /// Rejected by validation, or by the protocol checks when no request could be parsed.
    pub fn rejected(caller: impl Into<String>, req: Option<&RunRequest>, reason: impl Into<String>) -> Self {
        let rec = Self::base(caller, AuditStatus::Rejected).with_reason(reason);
        match req {
            Some(req) => rec.with_request(req),
            None => rec,
        }
    }

    /// Executed (or attempted). Spawn failures and deadlines are noted in `reason`.
    pub fn completed(caller: impl Into<String>, req: &RunRequest, result: &ExecutionResult) -> Self {
        use crate::exec::Termination;

        let mut rec = Self::base(caller, AuditStatus::Completed).with_request(req);
        rec.stdout = result.stdout_lossy();
        rec.stderr = result.stderr_lossy();
        rec.exit_code = result.exit_code;
        match result.termination {
            Termination::SpawnFailed => {
                let reason = format!("spawn failed: {}", rec.stderr);
                rec.with_reason(reason)
            }
            Termination::TimedOut => rec.with_reason("killed after exceeding execution deadline"),
            Termination::Exited | Termination::Signaled => rec,
        }
    }

    pub fn service_start(addr: &str) -> Self {
        Self::base(SYSTEM_CALLER, AuditStatus::ServiceStart)
            .with_reason(format!("DevProxy service started on {}", addr))
    }

    pub fn service_stop() -> Self {
        Self::base(SYSTEM_CALLER, AuditStatus::ServiceStop).with_reason("DevProxy service stopping")
    }
}

/// Destination for serialized audit lines. Implementations must write each line whole.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one line (already newline-terminated) and make it durable before returning.
    async fn append_line(&self, line: &[u8]) -> std::io::Result<()>;
}

/// Append-only audit file. One writer at a time; every line is flushed and synced.
pub struct FileSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

struct SinkState {
    file: tokio::fs::File,
    /// The file ends in an unterminated fragment of a failed write.
    torn: bool,
}

impl FileSink {
    /// Open (or create) `path` for appending, creating the parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            path,
            state: Mutex::new(SinkState { file, torn: false }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn append_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock().await;
        let SinkState { file, torn } = &mut *state;
        let was_torn = *torn;
        let start = file.metadata().await?.len();
        if let Err(e) = write_record(file, line, torn).await {
            match file.set_len(start).await {
                Ok(()) => *torn = was_torn,
                Err(trunc) => log::error!(
                    "could not cut partial record off {}: {}",
                    self.path.display(),
                    trunc
                ),
            }
            return Err(e);
        }
        file.sync_data().await
    }
}

/// Write one line, first closing off the fragment a previous failed write left behind.
/// Sets `torn` when this write fails partway.
async fn write_record<W>(out: &mut W, line: &[u8], torn: &mut bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if *torn {
        out.write_all(b"\n").await?;
        *torn = false;
    }
    let written = async {
        out.write_all(line).await?;
        out.flush().await
    }
    .await;
    if written.is_err() {
        *torn = true;
    }
    written
}

/// Serializes records and hands them to the sink.
pub struct AuditLogger {
    sink: Box<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: impl AuditSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }

    /// Logger writing to an append-only file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let sink = FileSink::open(path).await?;
        log::debug!("appending audit records to {}", sink.path().display());
        Ok(Self::new(sink))
    }

    /// Append one record, returning any write error.
    pub async fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        self.sink.append_line(&line).await
    }

    /// Append one record; failures are logged and otherwise ignored so request handling
    /// carries on regardless.
    pub async fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.append(record).await {
            log::error!(
                "audit write failed (status {:?}, caller {}): {}",
                record.status,
                record.caller,
                e
            );
        }
    }
}
