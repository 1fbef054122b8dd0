//! Phase Queue (C3).
//!
//! The durable, authoritative record of coordination state: one row per
//! `(run_id, phase_number)` work item. Backed by SQLite (`rusqlite`), the
//! same embedded-SQL idiom the pack's `forge` example uses for its
//! `pipeline_runs`/`pipeline_phases` tables — the natural fit for a
//! single-process durable queue that needs row-level mutual exclusion
//! without standing up an external service.
//!
//! Status transitions race between workers; every mutating operation
//! issues an `UPDATE ... WHERE status = <expected>` and treats zero rows
//! affected as "another writer won the race" rather than an error a caller
//! needs to distinguish from "row missing".

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use adw_types::{ErrorKind, PhaseName, PhaseQueueEntry, QueueId, QueueStatus, RunId};

use crate::error::QueueError;

/// Legal `(from, to)` status edges, per spec §4.3.
const LEGAL_EDGES: &[(QueueStatus, QueueStatus)] = &[
    (QueueStatus::Queued, QueueStatus::Ready),
    (QueueStatus::Queued, QueueStatus::Blocked),
    (QueueStatus::Queued, QueueStatus::Cancelled),
    (QueueStatus::Ready, QueueStatus::Running),
    (QueueStatus::Ready, QueueStatus::Blocked),
    (QueueStatus::Ready, QueueStatus::Cancelled),
    (QueueStatus::Blocked, QueueStatus::Ready),
    (QueueStatus::Blocked, QueueStatus::Cancelled),
    (QueueStatus::Running, QueueStatus::Completed),
    (QueueStatus::Running, QueueStatus::Failed),
    (QueueStatus::Running, QueueStatus::Cancelled),
    (QueueStatus::Failed, QueueStatus::Ready),
    (QueueStatus::Failed, QueueStatus::Cancelled),
];

pub fn is_legal_transition(from: QueueStatus, to: QueueStatus) -> bool {
    LEGAL_EDGES.contains(&(from, to))
}

pub struct PhaseQueue {
    conn: Connection,
}

impl PhaseQueue {
    pub fn open(path: &std::path::Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let q = Self { conn };
        q.migrate()?;
        Ok(q)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let q = Self { conn };
        q.migrate()?;
        Ok(q)
    }

    fn migrate(&self) -> Result<(), QueueError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS phase_queue (
                queue_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                parent_issue INTEGER,
                phase_number INTEGER NOT NULL,
                phase_name TEXT NOT NULL,
                status TEXT NOT NULL,
                depends_on_phase INTEGER,
                webhook_fingerprint TEXT,
                created_at TEXT NOT NULL,
                ready_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error_kind TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_phase_queue_run ON phase_queue(run_id, phase_number);
            CREATE INDEX IF NOT EXISTS idx_phase_queue_status ON phase_queue(status, created_at, queue_id);
            ",
        )?;
        Ok(())
    }

    /// Insert the first row for `phase_name` of `run_id`. `Plan` seeds
    /// `Ready`; every later phase seeds `Queued`, matching
    /// `PhaseQueueEntry::new`.
    pub fn enqueue(
        &self,
        run_id: &RunId,
        parent_issue: Option<u64>,
        phase_name: PhaseName,
        now: DateTime<Utc>,
    ) -> Result<QueueId, QueueError> {
        let queue_id = format!("{run_id}-p{}", phase_name.phase_number());
        let entry = PhaseQueueEntry::new(queue_id.clone(), run_id.clone(), parent_issue, phase_name, now)
            .expect("PhaseName::phase_number is always in 1..=10");

        self.conn.execute(
            "INSERT INTO phase_queue
             (queue_id, run_id, parent_issue, phase_number, phase_name, status,
              depends_on_phase, webhook_fingerprint, created_at, ready_at,
              started_at, completed_at, retry_count, last_error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.queue_id,
                entry.run_id,
                entry.parent_issue.map(|v| v as i64),
                entry.phase_number as i64,
                phase_name_str(entry.phase_name),
                status_str(entry.status),
                entry.depends_on_phase.map(|v| v as i64),
                entry.webhook_fingerprint,
                entry.created_at.to_rfc3339(),
                entry.ready_at.map(|t| t.to_rfc3339()),
                entry.started_at.map(|t| t.to_rfc3339()),
                entry.completed_at.map(|t| t.to_rfc3339()),
                entry.retry_count as i64,
                entry.last_error_kind.map(error_kind_str),
            ],
        )?;
        Ok(queue_id)
    }

    /// Enqueue every phase of a fresh run up front, `Plan` depending on
    /// nothing and each later phase depending on the one before it.
    pub fn enqueue_run(
        &self,
        run_id: &RunId,
        parent_issue: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueId>, QueueError> {
        PhaseName::ALL
            .iter()
            .map(|p| self.enqueue(run_id, parent_issue, *p, now))
            .collect()
    }

    /// Oldest `ready` entry, ties broken by `queue_id` ascending.
    pub fn get_next_ready(&self) -> Result<Option<PhaseQueueEntry>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM phase_queue WHERE status = 'ready'
             ORDER BY created_at ASC, queue_id ASC LIMIT 1",
        )?;
        let entry = stmt.query_row([], row_to_entry).optional()?;
        Ok(entry)
    }

    pub fn get_by_id(&self, queue_id: &str) -> Result<Option<PhaseQueueEntry>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM phase_queue WHERE queue_id = ?1")?;
        Ok(stmt.query_row(params![queue_id], row_to_entry).optional()?)
    }

    pub fn require_by_id(&self, queue_id: &str) -> Result<PhaseQueueEntry, QueueError> {
        self.get_by_id(queue_id)?
            .ok_or_else(|| QueueError::NotFound(queue_id.to_string()))
    }

    pub fn get_by_run(&self, run_id: &str) -> Result<Vec<PhaseQueueEntry>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM phase_queue WHERE run_id = ?1 ORDER BY phase_number ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Transition `queue_id` to `new_status`, rejecting illegal DAG edges
    /// and racing writers alike (via `UPDATE ... WHERE status = <expected>`).
    pub fn transition(
        &self,
        queue_id: &str,
        new_status: QueueStatus,
        error_kind: Option<ErrorKind>,
        now: DateTime<Utc>,
    ) -> Result<PhaseQueueEntry, QueueError> {
        let current = self.require_by_id(queue_id)?;
        if !is_legal_transition(current.status, new_status) {
            return Err(QueueError::StatusMismatch {
                expected: current.status,
                actual: new_status,
            });
        }

        let (ready_col, started_col, completed_col, retry_incr) = match new_status {
            QueueStatus::Ready => (Some(now), None, None, current.status == QueueStatus::Failed),
            QueueStatus::Running => (current.ready_at, Some(now), None, false),
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled => {
                (current.ready_at, current.started_at, Some(now), false)
            }
            QueueStatus::Blocked => (None, current.started_at, None, false),
            QueueStatus::Queued => (None, None, None, false),
        };

        let new_retry_count = if retry_incr {
            current.retry_count + 1
        } else {
            current.retry_count
        };

        let affected = self.conn.execute(
            "UPDATE phase_queue SET status = ?1, ready_at = ?2, started_at = ?3,
             completed_at = ?4, retry_count = ?5, last_error_kind = ?6
             WHERE queue_id = ?7 AND status = ?8",
            params![
                status_str(new_status),
                ready_col.map(|t| t.to_rfc3339()),
                started_col.map(|t| t.to_rfc3339()),
                completed_col.map(|t| t.to_rfc3339()),
                new_retry_count as i64,
                error_kind.map(error_kind_str),
                queue_id,
                status_str(current.status),
            ],
        )?;

        if affected == 0 {
            let actual = self.require_by_id(queue_id)?.status;
            return Err(QueueError::StatusMismatch {
                expected: current.status,
                actual,
            });
        }

        self.require_by_id(queue_id)
    }

    /// Mark every `queued`/`blocked` dependent of `completed_phase_number`
    /// within `run_id` as `ready`.
    pub fn mark_dependents_ready(
        &self,
        run_id: &str,
        completed_phase_number: u8,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueId>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT queue_id FROM phase_queue
             WHERE run_id = ?1 AND depends_on_phase = ?2
             AND status IN ('queued', 'blocked')",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![run_id, completed_phase_number as i64], |r| {
                r.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for id in &ids {
            self.conn.execute(
                "UPDATE phase_queue SET status = 'ready', ready_at = ?1
                 WHERE queue_id = ?2 AND status IN ('queued', 'blocked')",
                params![now.to_rfc3339(), id],
            )?;
        }
        Ok(ids)
    }

    /// Re-stamp a dependent `blocked` if its dependency is not yet
    /// `completed` at the moment a worker tries to start it.
    pub fn block_if_dependency_unsatisfied(
        &self,
        queue_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let entry = self.require_by_id(queue_id)?;
        let Some(dep) = entry.depends_on_phase else {
            return Ok(false);
        };
        let dep_id = format!("{}-p{dep}", entry.run_id);
        let dep_status = self.get_by_id(&dep_id)?.map(|e| e.status);
        if dep_status != Some(QueueStatus::Completed) {
            self.transition(queue_id, QueueStatus::Blocked, None, now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Crash recovery (spec E2): rows still `running` with no heartbeat in
    /// `stale_after` belong to a worker that died mid-phase. Reset them to
    /// `ready` so the Orchestrator picks them back up; the Idempotency Gate
    /// decides on re-entry whether to resume or re-execute.
    pub fn recover_stale_running(
        &self,
        stale_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueId>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT queue_id, started_at FROM phase_queue WHERE status = 'running'",
        )?;
        let rows: Vec<(String, Option<String>)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut recovered = Vec::new();
        for (queue_id, started_at) in rows {
            let stale = match started_at {
                Some(s) => now.signed_duration_since(parse_dt(s)) >= stale_after,
                None => true,
            };
            if !stale {
                continue;
            }
            let affected = self.conn.execute(
                "UPDATE phase_queue SET status = 'ready', ready_at = ?1
                 WHERE queue_id = ?2 AND status = 'running'",
                params![now.to_rfc3339(), queue_id],
            )?;
            if affected > 0 {
                recovered.push(queue_id);
            }
        }
        Ok(recovered)
    }
}

pub(crate) fn phase_name_str(p: PhaseName) -> &'static str {
    match p {
        PhaseName::Plan => "plan",
        PhaseName::Validate => "validate",
        PhaseName::Build => "build",
        PhaseName::Lint => "lint",
        PhaseName::Test => "test",
        PhaseName::Review => "review",
        PhaseName::Document => "document",
        PhaseName::Ship => "ship",
        PhaseName::Cleanup => "cleanup",
        PhaseName::Verify => "verify",
    }
}

pub(crate) fn phase_name_from_str(s: &str) -> Option<PhaseName> {
    Some(match s {
        "plan" => PhaseName::Plan,
        "validate" => PhaseName::Validate,
        "build" => PhaseName::Build,
        "lint" => PhaseName::Lint,
        "test" => PhaseName::Test,
        "review" => PhaseName::Review,
        "document" => PhaseName::Document,
        "ship" => PhaseName::Ship,
        "cleanup" => PhaseName::Cleanup,
        "verify" => PhaseName::Verify,
        _ => return None,
    })
}

pub(crate) fn status_str(s: QueueStatus) -> &'static str {
    match s {
        QueueStatus::Queued => "queued",
        QueueStatus::Ready => "ready",
        QueueStatus::Running => "running",
        QueueStatus::Completed => "completed",
        QueueStatus::Failed => "failed",
        QueueStatus::Blocked => "blocked",
        QueueStatus::Cancelled => "cancelled",
    }
}

pub(crate) fn status_from_str(s: &str) -> Option<QueueStatus> {
    Some(match s {
        "queued" => QueueStatus::Queued,
        "ready" => QueueStatus::Ready,
        "running" => QueueStatus::Running,
        "completed" => QueueStatus::Completed,
        "failed" => QueueStatus::Failed,
        "blocked" => QueueStatus::Blocked,
        "cancelled" => QueueStatus::Cancelled,
        _ => return None,
    })
}

pub(crate) fn error_kind_str(k: ErrorKind) -> &'static str {
    match k {
        ErrorKind::ContractBreach => "contract_breach",
        ErrorKind::ResourceExhausted => "resource_exhausted",
        ErrorKind::ExternalToolFailure => "external_tool_failure",
        ErrorKind::AgentFailure => "agent_failure",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Looping => "looping",
        ErrorKind::AuthFailure => "auth_failure",
    }
}

pub(crate) fn error_kind_from_str(s: &str) -> Option<ErrorKind> {
    Some(match s {
        "contract_breach" => ErrorKind::ContractBreach,
        "resource_exhausted" => ErrorKind::ResourceExhausted,
        "external_tool_failure" => ErrorKind::ExternalToolFailure,
        "agent_failure" => ErrorKind::AgentFailure,
        "timeout" => ErrorKind::Timeout,
        "cancelled" => ErrorKind::Cancelled,
        "looping" => ErrorKind::Looping,
        "auth_failure" => ErrorKind::AuthFailure,
        _ => return None,
    })
}

pub(crate) fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<PhaseQueueEntry> {
    let phase_name_raw: String = row.get("phase_name")?;
    let status_raw: String = row.get("status")?;
    let last_error_raw: Option<String> = row.get("last_error_kind")?;
    Ok(PhaseQueueEntry {
        queue_id: row.get("queue_id")?,
        run_id: row.get("run_id")?,
        parent_issue: row.get::<_, Option<i64>>("parent_issue")?.map(|v| v as u64),
        phase_number: row.get::<_, i64>("phase_number")? as u8,
        phase_name: phase_name_from_str(&phase_name_raw).unwrap_or(PhaseName::Plan),
        status: status_from_str(&status_raw).unwrap_or(QueueStatus::Queued),
        depends_on_phase: row.get::<_, Option<i64>>("depends_on_phase")?.map(|v| v as u8),
        webhook_fingerprint: row.get("webhook_fingerprint")?,
        created_at: parse_dt(row.get("created_at")?),
        ready_at: row.get::<_, Option<String>>("ready_at")?.map(parse_dt),
        started_at: row.get::<_, Option<String>>("started_at")?.map(parse_dt),
        completed_at: row.get::<_, Option<String>>("completed_at")?.map(parse_dt),
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        last_error_kind: last_error_raw.and_then(|s| error_kind_from_str(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_run_seeds_plan_ready_rest_queued() {
        let q = PhaseQueue::open_in_memory().unwrap();
        q.enqueue_run(&"run-1".to_string(), Some(42), Utc::now())
            .unwrap();
        let rows = q.get_by_run("run-1").unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].status, QueueStatus::Ready);
        for row in &rows[1..] {
            assert_eq!(row.status, QueueStatus::Queued);
        }
    }

    #[test]
    fn get_next_ready_breaks_ties_by_queue_id() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-b".to_string(), None, now).unwrap();
        q.enqueue_run(&"run-a".to_string(), None, now).unwrap();
        let next = q.get_next_ready().unwrap().unwrap();
        assert_eq!(next.run_id, "run-a");
    }

    #[test]
    fn transition_rejects_illegal_edge() {
        let q = PhaseQueue::open_in_memory().unwrap();
        q.enqueue_run(&"run-1".to_string(), None, Utc::now())
            .unwrap();
        let err = q
            .transition("run-1-p1", QueueStatus::Completed, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QueueError::StatusMismatch { .. }));
    }

    #[test]
    fn transition_to_running_then_completed_marks_dependents_ready() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();

        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();
        let ready = q.mark_dependents_ready("run-1", 1, now).unwrap();
        assert_eq!(ready, vec!["run-1-p2".to_string()]);

        let p2 = q.require_by_id("run-1-p2").unwrap();
        assert_eq!(p2.status, QueueStatus::Ready);
    }

    #[test]
    fn block_if_dependency_unsatisfied_restamps_blocked() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();

        // p2 depends on p1, which hasn't completed; force it to `ready`
        // the way a misbehaving caller might, bypassing `mark_dependents_ready`.
        q.transition("run-1-p2", QueueStatus::Ready, None, now)
            .unwrap();

        let blocked = q
            .block_if_dependency_unsatisfied("run-1-p2", now)
            .unwrap();
        assert!(blocked);
        assert_eq!(
            q.require_by_id("run-1-p2").unwrap().status,
            QueueStatus::Blocked
        );
    }

    #[test]
    fn block_if_dependency_unsatisfied_leaves_satisfied_row_alone() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();
        q.mark_dependents_ready("run-1", 1, now).unwrap();

        let blocked = q
            .block_if_dependency_unsatisfied("run-1-p2", now)
            .unwrap();
        assert!(!blocked);
        assert_eq!(
            q.require_by_id("run-1-p2").unwrap().status,
            QueueStatus::Ready
        );
    }

    #[test]
    fn failed_to_ready_increments_retry_count() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition(
            "run-1-p1",
            QueueStatus::Failed,
            Some(ErrorKind::ExternalToolFailure),
            now,
        )
        .unwrap();
        let retried = q
            .transition("run-1-p1", QueueStatus::Ready, None, now)
            .unwrap();
        assert_eq!(retried.retry_count, 1);
    }

    #[test]
    fn concurrent_transition_loses_race_cleanly() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();

        // A second worker still believes the row is `running`.
        let err = q
            .transition("run-1-p1", QueueStatus::Failed, None, now)
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::StatusMismatch {
                actual: QueueStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn get_by_id_is_o1_primary_key_lookup() {
        let q = PhaseQueue::open_in_memory().unwrap();
        q.enqueue_run(&"run-1".to_string(), None, Utc::now())
            .unwrap();
        assert!(q.get_by_id("run-1-p5").unwrap().is_some());
        assert!(q.get_by_id("nope").unwrap().is_none());
    }

    #[test]
    fn cancelled_run_leaves_completed_rows_intact() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();
        q.transition("run-1-p2", QueueStatus::Cancelled, None, now)
            .unwrap();

        let rows = q.get_by_run("run-1").unwrap();
        assert_eq!(rows[0].status, QueueStatus::Completed);
        assert_eq!(rows[1].status, QueueStatus::Cancelled);
    }

    #[test]
    fn recover_stale_running_resets_rows_past_the_threshold() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let started = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, started).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, started)
            .unwrap();

        let still_fresh = q
            .recover_stale_running(chrono::Duration::minutes(30), started + chrono::Duration::seconds(5))
            .unwrap();
        assert!(still_fresh.is_empty());
        assert_eq!(
            q.require_by_id("run-1-p1").unwrap().status,
            QueueStatus::Running
        );

        let recovered = q
            .recover_stale_running(chrono::Duration::minutes(30), started + chrono::Duration::minutes(31))
            .unwrap();
        assert_eq!(recovered, vec!["run-1-p1".to_string()]);
        assert_eq!(
            q.require_by_id("run-1-p1").unwrap().status,
            QueueStatus::Ready
        );
    }

    #[test]
    fn recover_stale_running_ignores_rows_already_completed() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();

        let recovered = q
            .recover_stale_running(chrono::Duration::minutes(0), now + chrono::Duration::hours(1))
            .unwrap();
        assert!(recovered.is_empty());
    }
}
