//! # Types
//!
//! Core domain types shared by every component of the ADW orchestrator:
//! run identity, the Phase Queue's coordination record, the Run State
//! Document, webhook events, and the resource allocation shapes.
//!
//! ## Serialization
//!
//! All persisted types implement `Serialize`/`Deserialize`. Durations route
//! through [`adw_duration`] so config, queue rows, and state documents all
//! accept either a human-readable string or a millisecond count and always
//! serialize back out as milliseconds.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use adw_duration::{deserialize_duration, parse_duration, serialize_duration};

pub type RunId = String;
pub type QueueId = String;
pub type IssueId = u64;
pub type WebhookId = String;

/// Backend port pool reserved for live runs (frontend ports use [`FRONTEND_PORT_RANGE`]).
pub const BACKEND_PORT_RANGE: std::ops::RangeInclusive<u16> = 9100..=9114;
pub const FRONTEND_PORT_RANGE: std::ops::RangeInclusive<u16> = 9200..=9214;

#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("phase_number {0} out of range 1..=10")]
    PhaseNumberOutOfRange(u8),
}

/// Which pipeline variant a run follows.
///
/// - `SinglePhase` never leaves Plan/Build.
/// - `MultiPhase` walks Plan through Test but skips Review/Document/Ship.
/// - `FullSdlc` walks all ten phases, Plan through Verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTemplate {
    SinglePhase,
    MultiPhase,
    FullSdlc,
}

/// Identifies a single run: which issue it's for (if any) and which
/// pipeline variant it follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: RunId,
    pub issue_id: Option<IssueId>,
    pub workflow_template: WorkflowTemplate,
}

/// The ten fixed phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Plan,
    Validate,
    Build,
    Lint,
    Test,
    Review,
    Document,
    Ship,
    Cleanup,
    Verify,
}

impl PhaseName {
    pub const ALL: [PhaseName; 10] = [
        PhaseName::Plan,
        PhaseName::Validate,
        PhaseName::Build,
        PhaseName::Lint,
        PhaseName::Test,
        PhaseName::Review,
        PhaseName::Document,
        PhaseName::Ship,
        PhaseName::Cleanup,
        PhaseName::Verify,
    ];

    /// 1-indexed position in the fixed pipeline.
    pub fn phase_number(self) -> u8 {
        Self::ALL
            .iter()
            .position(|p| *p == self)
            .expect("PhaseName::ALL covers every variant") as u8
            + 1
    }

    pub fn from_phase_number(n: u8) -> Option<Self> {
        if n == 0 {
            return None;
        }
        Self::ALL.get((n - 1) as usize).copied()
    }

    /// The phase that must be `Completed` before this one may become `Ready`.
    /// `Plan` has no dependency; it's the entry point of every run.
    pub fn depends_on(self) -> Option<PhaseName> {
        let n = self.phase_number();
        if n == 1 { None } else { Self::from_phase_number(n - 1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

/// Taxonomy a Phase Runner or Orchestrator classifies a failure under.
/// Carried by both [`PhaseQueueEntry::last_error_kind`] and
/// [`PhaseOutcome::Failed`] so recovery logic can match on it without
/// downcasting a boxed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ContractBreach,
    ResourceExhausted,
    ExternalToolFailure,
    AgentFailure,
    Timeout,
    Cancelled,
    Looping,
    AuthFailure,
}

impl ErrorKind {
    /// `ContractBreach` and `Looping` are never retried at any layer.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::ContractBreach | ErrorKind::Looping)
    }
}

/// The authoritative coordination record for one phase of one run.
///
/// Phases execute in strictly ascending `phase_number`; `status` only
/// reaches `Ready` once `depends_on_phase` (if any) is `Completed`. At most
/// one entry exists per `(run_id, phase_number)` except for explicit
/// retries, which insert a new row rather than mutating the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseQueueEntry {
    pub queue_id: QueueId,
    pub run_id: RunId,
    pub parent_issue: Option<IssueId>,
    pub phase_number: u8,
    pub phase_name: PhaseName,
    pub status: QueueStatus,
    pub depends_on_phase: Option<u8>,
    pub webhook_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error_kind: Option<ErrorKind>,
}

impl PhaseQueueEntry {
    /// Build the first queue row for `phase_name` of a run. `phase_number`
    /// and `depends_on_phase` are derived from `phase_name`; `Plan` starts
    /// `Ready`, every later phase starts `Queued`.
    pub fn new(
        queue_id: QueueId,
        run_id: RunId,
        parent_issue: Option<IssueId>,
        phase_name: PhaseName,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TypesError> {
        let phase_number = phase_name.phase_number();
        if !(1..=10).contains(&phase_number) {
            return Err(TypesError::PhaseNumberOutOfRange(phase_number));
        }
        let status = if phase_name.depends_on().is_none() {
            QueueStatus::Ready
        } else {
            QueueStatus::Queued
        };
        Ok(Self {
            queue_id,
            run_id,
            parent_issue,
            phase_number,
            phase_name,
            status,
            depends_on_phase: phase_name.depends_on().map(|p| p.phase_number()),
            webhook_fingerprint: None,
            created_at,
            ready_at: if status == QueueStatus::Ready {
                Some(created_at)
            } else {
                None
            },
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error_kind: None,
        })
    }
}

/// What a Phase Runner reports back to the Orchestrator at the end of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
    Blocked { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub tool: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub log_tail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintResult {
    pub tool: String,
    pub warnings: u32,
    pub errors: u32,
    pub clean: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub tool: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub reviewer: String,
    pub approved: bool,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub worktree_removed: bool,
    pub ports_released: Vec<u16>,
    pub branches_deleted: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationResult {
    pub check: String,
    pub passed: bool,
    pub detail: String,
}

/// The authoritative execution record for one run, keyed externally by
/// `run_id`. Updated once per successful phase and never deleted.
///
/// Deliberately carries no `status` or `current_phase` field: that
/// coordination state lives on the Phase Queue, not here, so a reader can
/// never derive a run's progress from two disagreeing sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateDocument {
    pub run_id: RunId,
    pub workflow_template: WorkflowTemplate,
    pub plan_file_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub issue_class: Option<String>,
    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub baseline_errors: BTreeMap<String, u32>,
    pub external_build_results: BTreeMap<String, BuildResult>,
    pub lint_results: BTreeMap<String, LintResult>,
    pub test_results: BTreeMap<String, TestResult>,
    pub pr_url: Option<String>,
    pub review_results: Vec<ReviewResult>,
    pub doc_files_paths: Vec<PathBuf>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub cleanup_summary: Option<CleanupSummary>,
    pub verification_results: Vec<VerificationResult>,
}

impl RunStateDocument {
    pub fn new(run_id: RunId, workflow_template: WorkflowTemplate) -> Self {
        Self {
            run_id,
            workflow_template,
            plan_file_path: None,
            branch_name: None,
            worktree_path: None,
            issue_class: None,
            backend_port: None,
            frontend_port: None,
            baseline_errors: BTreeMap::new(),
            external_build_results: BTreeMap::new(),
            lint_results: BTreeMap::new(),
            test_results: BTreeMap::new(),
            pr_url: None,
            review_results: Vec::new(),
            doc_files_paths: Vec::new(),
            shipped_at: None,
            merge_commit_sha: None,
            cleanup_summary: None,
            verification_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    ExternalIssue,
    WorkflowComplete,
}

/// A received, not-yet-dispatched webhook delivery. `(webhook_id, 30-second
/// window)` is processed at most once; the Broadcast Hub and Phase Queue
/// dedupe on that pair before acting on the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub webhook_id: WebhookId,
    pub source: WebhookSource,
    pub received_at: DateTime<Utc>,
    pub payload_digest: String,
    pub run_id: Option<RunId>,
    pub issue_id: Option<IssueId>,
}

/// `fingerprint(source ∥ run_id ∥ status ∥ queue_id)`.
///
/// Used both to dedupe webhook deliveries and to suppress duplicate issue
/// comments for the same logical event. Unconditional and unified across
/// every source; there is no legacy fingerprint shape to fall back to.
pub fn webhook_fingerprint(source: &str, run_id: &str, status: &str, queue_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\0");
    hasher.update(run_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(status.as_bytes());
    hasher.update(b"\0");
    hasher.update(queue_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// A live lease on a worktree and a port pair, keyed to `run_id`. Released
/// when the run reaches Cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub run_id: RunId,
    pub worktree_path: PathBuf,
    pub backend_port: u16,
    pub frontend_port: u16,
    pub allocated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_name_round_trips_through_phase_number() {
        for phase in PhaseName::ALL {
            let n = phase.phase_number();
            assert_eq!(PhaseName::from_phase_number(n), Some(phase));
        }
    }

    #[test]
    fn plan_has_no_dependency_every_other_phase_does() {
        assert_eq!(PhaseName::Plan.depends_on(), None);
        for phase in &PhaseName::ALL[1..] {
            assert!(phase.depends_on().is_some());
        }
    }

    #[test]
    fn phase_queue_entry_new_seeds_ready_only_for_plan() {
        let now = Utc::now();
        let plan =
            PhaseQueueEntry::new("q-1".into(), "run-1".into(), Some(42), PhaseName::Plan, now)
                .unwrap();
        assert_eq!(plan.status, QueueStatus::Ready);
        assert_eq!(plan.depends_on_phase, None);

        let build = PhaseQueueEntry::new(
            "q-2".into(),
            "run-1".into(),
            Some(42),
            PhaseName::Build,
            now,
        )
        .unwrap();
        assert_eq!(build.status, QueueStatus::Queued);
        assert_eq!(
            build.depends_on_phase,
            Some(PhaseName::Validate.phase_number())
        );
    }

    #[test]
    fn run_state_document_has_no_status_field_at_serialization_time() {
        let doc = RunStateDocument::new("run-1".into(), WorkflowTemplate::FullSdlc);
        let json = serde_json::to_value(&doc).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("status"));
        assert!(!obj.contains_key("current_phase"));
    }

    #[test]
    fn webhook_fingerprint_is_deterministic_and_input_sensitive() {
        let a = webhook_fingerprint("external_issue", "run-1", "ready", "q-1");
        let b = webhook_fingerprint("external_issue", "run-1", "ready", "q-1");
        let c = webhook_fingerprint("external_issue", "run-1", "running", "q-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn phase_outcome_serializes_with_tagged_representation() {
        let outcome = PhaseOutcome::Failed {
            kind: ErrorKind::ExternalToolFailure,
            message: "cargo build failed".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
        assert!(json.contains("\"kind\":\"external_tool_failure\""));

        let parsed: PhaseOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn error_kind_recoverability_matches_propagation_policy() {
        assert!(!ErrorKind::ContractBreach.is_recoverable());
        assert!(!ErrorKind::Looping.is_recoverable());
        assert!(ErrorKind::ExternalToolFailure.is_recoverable());
        assert!(ErrorKind::Timeout.is_recoverable());
    }

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn phase_queue_entry_roundtrip(
                queue_id in "[a-z0-9-]{4,12}",
                run_id in "[a-z0-9-]{4,12}",
                phase_variant in 0usize..10,
                retry_count in 0u32..10,
            ) {
                let phase_name = PhaseName::ALL[phase_variant];
                let entry = PhaseQueueEntry {
                    queue_id: queue_id.clone(),
                    run_id: run_id.clone(),
                    parent_issue: Some(7),
                    phase_number: phase_name.phase_number(),
                    phase_name,
                    status: QueueStatus::Running,
                    depends_on_phase: phase_name.depends_on().map(|p| p.phase_number()),
                    webhook_fingerprint: None,
                    created_at: Utc::now(),
                    ready_at: None,
                    started_at: None,
                    completed_at: None,
                    retry_count,
                    last_error_kind: None,
                };

                let json = serde_json::to_string(&entry).unwrap();
                let parsed: PhaseQueueEntry = serde_json::from_str(&json).unwrap();
                assert_eq!(parsed.queue_id, entry.queue_id);
                assert_eq!(parsed.run_id, entry.run_id);
                assert_eq!(parsed.phase_number, entry.phase_number);
                assert_eq!(parsed.retry_count, entry.retry_count);
            }

            #[test]
            fn phase_number_never_panics_on_arbitrary_input(n in 0u8..=255) {
                let _ = PhaseName::from_phase_number(n);
            }
        }
    }
}
