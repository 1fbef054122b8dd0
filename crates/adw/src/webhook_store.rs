//! Durable webhook delivery record (`webhook_events`, spec §3/§6).
//!
//! Backs the Webhook Gateway's dedupe decision with a real table instead
//! of an in-process map, so a delivery retried after the gateway process
//! restarts is still recognized as one already handled. Follows the same
//! rusqlite migrate-then-query idiom as the Phase Queue and History
//! Recorder. The `webhook_id` column's `UNIQUE` constraint is itself the
//! serialization point per §5: two concurrent deliveries with the same
//! fingerprint race on the same `INSERT`, and exactly one wins.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use adw_types::{IssueId, WebhookEvent, WebhookSource};

use crate::error::QueueError;

/// How long a delivery record is kept before [`WebhookEventStore::purge_expired`] drops it.
const RETENTION_DAYS: i64 = 7;

pub struct WebhookEventStore {
    conn: Connection,
}

impl WebhookEventStore {
    pub fn open(path: &std::path::Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let s = Self { conn };
        s.migrate()?;
        Ok(s)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let s = Self { conn };
        s.migrate()?;
        Ok(s)
    }

    fn migrate(&self) -> Result<(), QueueError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS webhook_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                received_at TEXT NOT NULL,
                payload_digest TEXT NOT NULL,
                run_id TEXT,
                issue_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_events_id_received ON webhook_events(webhook_id, received_at);
            CREATE INDEX IF NOT EXISTS idx_webhook_events_received ON webhook_events(received_at);
            ",
        )?;
        Ok(())
    }

    /// Records `event`, purging deliveries older than the retention window
    /// first. Returns `true` the first time `event.webhook_id` is seen,
    /// `false` if the `UNIQUE` constraint rejected it as a duplicate.
    pub fn record_if_new(&self, event: &WebhookEvent) -> Result<bool, QueueError> {
        self.purge_expired(event.received_at)?;

        let result = self.conn.execute(
            "INSERT INTO webhook_events (webhook_id, source, received_at, payload_digest, run_id, issue_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.webhook_id,
                source_str(event.source),
                event.received_at.to_rfc3339(),
                event.payload_digest,
                event.run_id,
                event.issue_id.map(|v| v as i64),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let cutoff = (now - chrono::Duration::days(RETENTION_DAYS)).to_rfc3339();
        let deleted = self
            .conn
            .execute("DELETE FROM webhook_events WHERE received_at < ?1", params![cutoff])?;
        Ok(deleted)
    }

    pub fn get(&self, webhook_id: &str) -> Result<Option<WebhookEvent>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM webhook_events WHERE webhook_id = ?1")?;
        stmt.query_row(params![webhook_id], row_to_event)
            .optional()
            .map_err(QueueError::from)
    }
}

fn source_str(source: WebhookSource) -> &'static str {
    match source {
        WebhookSource::ExternalIssue => "external_issue",
        WebhookSource::WorkflowComplete => "workflow_complete",
    }
}

fn source_from_str(s: &str) -> Option<WebhookSource> {
    match s {
        "external_issue" => Some(WebhookSource::ExternalIssue),
        "workflow_complete" => Some(WebhookSource::WorkflowComplete),
        _ => None,
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<WebhookEvent> {
    let source_raw: String = row.get("source")?;
    let received_raw: String = row.get("received_at")?;
    Ok(WebhookEvent {
        webhook_id: row.get("webhook_id")?,
        source: source_from_str(&source_raw).unwrap_or(WebhookSource::ExternalIssue),
        received_at: DateTime::parse_from_rfc3339(&received_raw)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        payload_digest: row.get("payload_digest")?,
        run_id: row.get("run_id")?,
        issue_id: row.get::<_, Option<i64>>("issue_id")?.map(|v| v as IssueId),
    })
}
