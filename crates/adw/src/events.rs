//! Observability event log.
//!
//! An append-only JSONL stream at `agents/<run_id>/events.jsonl`, one line
//! per phase-level occurrence (queued, started, retried, completed,
//! failed, blocked). Distinct from [`crate::history`]: this log is
//! per-run and unbounded, meant for `tail -f`/`adw status --follow`-style
//! consumption; History is the queryable cross-run table.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use adw_types::{ErrorKind, PhaseName, QueueStatus, RunId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    pub run_id: RunId,
    pub phase: PhaseName,
    pub status: QueueStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
}

pub struct EventLog {
    agents_dir: PathBuf,
}

impl EventLog {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.agents_dir.join(run_id).join("events.jsonl")
    }

    pub fn append(&self, event: &ObservabilityEvent) -> std::io::Result<()> {
        let path = self.path(&event.run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        writeln!(file, "{line}")
    }

    /// Read back every event recorded for `run_id`, in append order.
    /// Malformed lines (a torn write from a crash mid-append) are skipped.
    pub fn read_all(&self, run_id: &str) -> std::io::Result<Vec<ObservabilityEvent>> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
