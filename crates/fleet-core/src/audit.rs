use crate::model::{ActionResult, ResultKind};
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use uuid::Uuid;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Append-only JSONL trail of fleet commands and per-repo outcomes. Files are
/// split per UTC day and rolled over once they reach `max_bytes`.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    session_id: String,
    dir: PathBuf,
    max_bytes: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditStatus {
    Ok,
    Failed,
    Skipped,
}

impl AuditStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Ok => "ok",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }

    fn level(&self) -> &'static str {
        match self {
            AuditStatus::Ok => "INFO",
            AuditStatus::Failed => "ERROR",
            AuditStatus::Skipped => "WARN",
        }
    }
}

impl From<ResultKind> for AuditStatus {
    fn from(kind: ResultKind) -> Self {
        match kind {
            ResultKind::Succeeded => AuditStatus::Ok,
            ResultKind::Failed => AuditStatus::Failed,
            ResultKind::Skipped => AuditStatus::Skipped,
        }
    }
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    ts: String,
    level: &'static str,
    event: &'a str,
    audit_id: String,
    session_id: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("create audit dir")?;
        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            dir,
            max_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Records a command-level event and returns its audit id.
    pub fn record(
        &self,
        event: &str,
        status: AuditStatus,
        command: Option<&str>,
        details: Option<Value>,
        error: Option<&str>,
    ) -> anyhow::Result<String> {
        self.write(AuditEntry {
            ts: timestamp()?,
            level: status.level(),
            event,
            audit_id: Uuid::new_v4().to_string(),
            session_id: &self.session_id,
            status: status.as_str(),
            command,
            repo: None,
            path: None,
            error,
            details,
        })
    }

    /// Records the outcome of one executed action.
    pub fn record_action(&self, result: &ActionResult) -> anyhow::Result<String> {
        let status = AuditStatus::from(result.kind);
        let details = serde_json::json!({
            "action": result.action.kind.as_str(),
            "strategy": result.action.strategy.as_str(),
            "message": result.message,
        });
        self.write(AuditEntry {
            ts: timestamp()?,
            level: status.level(),
            event: "sync.action",
            audit_id: Uuid::new_v4().to_string(),
            session_id: &self.session_id,
            status: status.as_str(),
            command: None,
            repo: Some(&result.action.repo.name),
            path: Some(result.action.repo.path.display().to_string()),
            error: result.error.as_deref(),
            details: Some(details),
        })
    }

    fn write(&self, entry: AuditEntry<'_>) -> anyhow::Result<String> {
        let date = OffsetDateTime::now_utc()
            .format(format_description!("[year][month][day]"))
            .context("format date")?;
        let path = next_audit_path(&self.dir, &date, self.max_bytes);
        let line = serde_json::to_string(&entry).context("serialize audit entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        writeln!(file, "{line}").context("write audit entry")?;
        Ok(entry.audit_id)
    }
}

fn timestamp() -> anyhow::Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format timestamp")
}

fn next_audit_path(dir: &Path, date: &str, max_bytes: u64) -> PathBuf {
    let mut suffix = 0;
    loop {
        let name = if suffix == 0 {
            format!("audit-{date}.jsonl")
        } else {
            format!("audit-{date}-{suffix}.jsonl")
        };
        let path = dir.join(name);
        match fs::metadata(&path) {
            Ok(metadata) if metadata.len() >= max_bytes => suffix += 1,
            _ => return path,
        }
    }
}
