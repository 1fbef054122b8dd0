//! History Recorder (C10).
//!
//! An append-only, queryable record of every phase transition across every
//! run, independent of the Phase Queue (which only keeps the *current*
//! row per phase). Backed by the same rusqlite upsert-free insert idiom as
//! the Phase Queue's migrations, kept in its own table so the Queue can be
//! pruned or rebuilt without losing audit history.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use adw_types::{ErrorKind, PhaseName, QueueStatus, RunId};

use crate::error::QueueError;

/// A phase whose `duration_ms` is at or below this is treated as an
/// Idempotency Gate `Skip` rather than a real tool invocation, for the
/// purposes of [`HistoryRecorder::enrich_run`]'s `cache_efficiency`.
const CACHE_SKIP_THRESHOLD_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub run_id: RunId,
    pub phase_name: PhaseName,
    pub status: QueueStatus,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub summary: Option<String>,
}

/// One row per terminal run, written once by [`HistoryRecorder::enrich_run`]
/// when a run reaches `completed` or `failed`. Per spec §4.10: duration,
/// per-phase durations, bottleneck phase, cost totals, cache efficiency,
/// error category, temporal fields, and derived scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEnrichment {
    pub run_id: RunId,
    pub status: QueueStatus,
    pub recorded_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub phase_durations_ms: BTreeMap<String, u64>,
    pub bottleneck_phase: Option<String>,
    pub cost_total: f64,
    pub cache_efficiency: f64,
    pub error_category: Option<ErrorKind>,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub clarity_score: f64,
    pub cost_efficiency_score: f64,
    pub performance_score: f64,
    pub quality_score: f64,
}

pub struct HistoryRecorder {
    conn: Connection,
}

impl HistoryRecorder {
    pub fn open(path: &std::path::Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let r = Self { conn };
        r.migrate()?;
        Ok(r)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let r = Self { conn };
        r.migrate()?;
        Ok(r)
    }

    fn migrate(&self) -> Result<(), QueueError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflow_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                phase_name TEXT NOT NULL,
                status TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                duration_ms INTEGER,
                error_kind TEXT,
                summary TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_history_run ON workflow_history(run_id, recorded_at);

            CREATE TABLE IF NOT EXISTS workflow_history_enrichment (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                total_duration_ms INTEGER NOT NULL,
                phase_durations_ms TEXT NOT NULL,
                bottleneck_phase TEXT,
                cost_total REAL NOT NULL,
                cache_efficiency REAL NOT NULL,
                error_category TEXT,
                hour_of_day INTEGER NOT NULL,
                day_of_week INTEGER NOT NULL,
                clarity_score REAL NOT NULL,
                cost_efficiency_score REAL NOT NULL,
                performance_score REAL NOT NULL,
                quality_score REAL NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn record(
        &self,
        run_id: &str,
        phase_name: PhaseName,
        status: QueueStatus,
        recorded_at: DateTime<Utc>,
        duration_ms: Option<u64>,
        error_kind: Option<ErrorKind>,
        summary: Option<&str>,
    ) -> Result<i64, QueueError> {
        self.conn.execute(
            "INSERT INTO workflow_history
             (run_id, phase_name, status, recorded_at, duration_ms, error_kind, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                crate::queue::phase_name_str(phase_name),
                crate::queue::status_str(status),
                recorded_at.to_rfc3339(),
                duration_ms.map(|v| v as i64),
                error_kind.map(crate::queue::error_kind_str),
                summary,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn for_run(&self, run_id: &str) -> Result<Vec<HistoryRecord>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM workflow_history WHERE run_id = ?1 ORDER BY recorded_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent(&self, limit: u32) -> Result<Vec<HistoryRecord>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM workflow_history ORDER BY recorded_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Compute and persist a [`RunEnrichment`] for `run_id`, which has just
    /// reached the terminal `status` (`Completed` or `Failed`). Replaces
    /// any prior enrichment for the run (a retried-then-completed run
    /// reaching a terminal state twice keeps only the final analysis).
    /// Never called on the hot path of a phase transition itself — the
    /// Orchestrator invokes this once, after the run as a whole finishes.
    pub fn enrich_run(
        &self,
        run_id: &str,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<RunEnrichment, QueueError> {
        let records = self.for_run(run_id)?;

        let mut phase_durations_ms: BTreeMap<String, u64> = BTreeMap::new();
        let mut failures: u32 = 0;
        let mut error_category: Option<ErrorKind> = None;
        let mut timed_phases: u32 = 0;
        let mut skipped_phases: u32 = 0;

        for record in &records {
            if let Some(duration) = record.duration_ms {
                phase_durations_ms.insert(crate::queue::phase_name_str(record.phase_name).to_string(), duration);
                timed_phases += 1;
                if duration <= CACHE_SKIP_THRESHOLD_MS {
                    skipped_phases += 1;
                }
            }
            if record.status == QueueStatus::Failed {
                failures += 1;
                error_category = record.error_kind.or(error_category);
            }
        }

        let total_duration_ms: u64 = phase_durations_ms.values().sum();
        let bottleneck_phase = phase_durations_ms
            .iter()
            .max_by_key(|(_, d)| **d)
            .map(|(name, _)| name.clone());
        let cache_efficiency = if timed_phases == 0 {
            0.0
        } else {
            skipped_phases as f64 / timed_phases as f64
        };

        // No external agent cost report is wired into this core (out of
        // scope per §1); cost_total stays a documented zero until a real
        // agent cost feed is plumbed through the Phase Runner.
        let cost_total = 0.0;

        let phase_count = PhaseName::ALL.len() as f64;
        let baseline_ms_per_phase = 5.0 * 60.0 * 1000.0;
        let performance_score =
            (1.0 - (total_duration_ms as f64 / (phase_count * baseline_ms_per_phase))).clamp(0.0, 1.0);
        let cost_efficiency_score = (1.0 - (cost_total / phase_count.max(1.0))).clamp(0.0, 1.0);
        let clarity_score = (1.0 / (1.0 + failures as f64)).clamp(0.0, 1.0);
        let quality_score =
            ((clarity_score + cost_efficiency_score + performance_score) / 3.0).clamp(0.0, 1.0);

        let enrichment = RunEnrichment {
            run_id: run_id.to_string(),
            status,
            recorded_at: now,
            total_duration_ms,
            phase_durations_ms,
            bottleneck_phase,
            cost_total,
            cache_efficiency,
            error_category,
            hour_of_day: now.hour(),
            day_of_week: now.weekday().num_days_from_monday(),
            clarity_score,
            cost_efficiency_score,
            performance_score,
            quality_score,
        };

        self.conn.execute(
            "INSERT INTO workflow_history_enrichment
             (run_id, status, recorded_at, total_duration_ms, phase_durations_ms, bottleneck_phase,
              cost_total, cache_efficiency, error_category, hour_of_day, day_of_week,
              clarity_score, cost_efficiency_score, performance_score, quality_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(run_id) DO UPDATE SET
               status = excluded.status, recorded_at = excluded.recorded_at,
               total_duration_ms = excluded.total_duration_ms,
               phase_durations_ms = excluded.phase_durations_ms,
               bottleneck_phase = excluded.bottleneck_phase, cost_total = excluded.cost_total,
               cache_efficiency = excluded.cache_efficiency, error_category = excluded.error_category,
               hour_of_day = excluded.hour_of_day, day_of_week = excluded.day_of_week,
               clarity_score = excluded.clarity_score, cost_efficiency_score = excluded.cost_efficiency_score,
               performance_score = excluded.performance_score, quality_score = excluded.quality_score",
            params![
                enrichment.run_id,
                crate::queue::status_str(enrichment.status),
                enrichment.recorded_at.to_rfc3339(),
                enrichment.total_duration_ms as i64,
                serde_json::to_string(&enrichment.phase_durations_ms)?,
                enrichment.bottleneck_phase,
                enrichment.cost_total,
                enrichment.cache_efficiency,
                enrichment.error_category.map(crate::queue::error_kind_str),
                enrichment.hour_of_day as i64,
                enrichment.day_of_week as i64,
                enrichment.clarity_score,
                enrichment.cost_efficiency_score,
                enrichment.performance_score,
                enrichment.quality_score,
            ],
        )?;

        Ok(enrichment)
    }

    pub fn enrichment_for_run(&self, run_id: &str) -> Result<Option<RunEnrichment>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM workflow_history_enrichment WHERE run_id = ?1")?;
        stmt.query_row(params![run_id], row_to_enrichment)
            .optional()
            .map_err(QueueError::from)
    }
}

fn row_to_enrichment(row: &rusqlite::Row) -> rusqlite::Result<RunEnrichment> {
    let status_raw: String = row.get("status")?;
    let error_raw: Option<String> = row.get("error_category")?;
    let recorded_raw: String = row.get("recorded_at")?;
    let phase_durations_raw: String = row.get("phase_durations_ms")?;
    Ok(RunEnrichment {
        run_id: row.get("run_id")?,
        status: crate::queue::status_from_str(&status_raw).unwrap_or(QueueStatus::Queued),
        recorded_at: DateTime::parse_from_rfc3339(&recorded_raw)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        total_duration_ms: row.get::<_, i64>("total_duration_ms")? as u64,
        phase_durations_ms: serde_json::from_str(&phase_durations_raw).unwrap_or_default(),
        bottleneck_phase: row.get("bottleneck_phase")?,
        cost_total: row.get("cost_total")?,
        cache_efficiency: row.get("cache_efficiency")?,
        error_category: error_raw.and_then(|s| crate::queue::error_kind_from_str(&s)),
        hour_of_day: row.get::<_, i64>("hour_of_day")? as u32,
        day_of_week: row.get::<_, i64>("day_of_week")? as u32,
        clarity_score: row.get("clarity_score")?,
        cost_efficiency_score: row.get("cost_efficiency_score")?,
        performance_score: row.get("performance_score")?,
        quality_score: row.get("quality_score")?,
    })
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<HistoryRecord> {
    let phase_raw: String = row.get("phase_name")?;
    let status_raw: String = row.get("status")?;
    let error_raw: Option<String> = row.get("error_kind")?;
    let recorded_raw: String = row.get("recorded_at")?;
    Ok(HistoryRecord {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        phase_name: crate::queue::phase_name_from_str(&phase_raw)
            .unwrap_or(PhaseName::Plan),
        status: crate::queue::status_from_str(&status_raw).unwrap_or(QueueStatus::Queued),
        recorded_at: DateTime::parse_from_rfc3339(&recorded_raw)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|v| v as u64),
        error_kind: error_raw.and_then(|s| crate::queue::error_kind_from_str(&s)),
        summary: row.get("summary")?,
    })
}
