//! Idempotency Gate (C5).
//!
//! Decides, before the Phase Runner invokes a phase's external tools, what
//! a re-entry into an already-attempted phase should do: skip straight to
//! the recorded outcome, resume partial work, or discard it and re-execute
//! from scratch. Re-entry happens whenever the Orchestrator restarts a
//! crashed process and finds `ready`/`running` rows already on the queue,
//! or a webhook nudges a phase that already produced output once.
//!
//! `Skip` is never granted on field-presence alone: a phase whose
//! path-typed output was deleted or truncated out from under its state
//! document must re-execute rather than silently succeed on stale say-so.

use std::path::Path;

use adw_types::{PhaseName, RunStateDocument};

/// A plan file below this size is treated as not having been produced at
/// all, matching the Requires/Produces contract's own plan-file floor.
const MIN_PLAN_FILE_BYTES: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyDecision {
    /// The phase already produced its Requires/Produces contract; treat
    /// the phase as already `Completed`.
    Skip,
    /// Partial work exists (a worktree, a branch) that should be reused
    /// rather than torn down, but the phase's own tool invocation must
    /// still run.
    Resume,
    /// No usable partial work exists, or this phase is never safe to
    /// skip; run its tools from a clean slate.
    Execute,
}

/// Per-phase re-entry policy, keyed by [`PhaseName`].
pub fn decide(phase: PhaseName, state: &RunStateDocument) -> IdempotencyDecision {
    match phase {
        // Worktree/branch creation is reused if present, but the plan
        // content itself is always regenerated: a re-run may be reacting
        // to an issue edit the first plan never saw.
        PhaseName::Plan => {
            if state.worktree_path.is_some() {
                IdempotencyDecision::Resume
            } else {
                IdempotencyDecision::Execute
            }
        }
        PhaseName::Validate => {
            if !state.baseline_errors.is_empty() && plan_file_on_disk_is_valid(state) {
                IdempotencyDecision::Skip
            } else {
                IdempotencyDecision::Execute
            }
        }
        PhaseName::Build => {
            if state.external_build_results.is_empty() {
                IdempotencyDecision::Execute
            } else {
                IdempotencyDecision::Resume
            }
        }
        // Lint and Test always re-execute: their output can change out
        // from under a stale worktree even with nothing else different.
        PhaseName::Lint | PhaseName::Test => IdempotencyDecision::Execute,
        PhaseName::Review => {
            if state.review_results.is_empty() {
                IdempotencyDecision::Execute
            } else {
                IdempotencyDecision::Skip
            }
        }
        PhaseName::Document => {
            if !state.doc_files_paths.is_empty()
                && state.doc_files_paths.iter().all(|p| p.exists())
            {
                IdempotencyDecision::Skip
            } else {
                IdempotencyDecision::Execute
            }
        }
        // Ship checks for an existing merge record before re-merging the PR.
        PhaseName::Ship => {
            if state.merge_commit_sha.is_some() {
                IdempotencyDecision::Skip
            } else {
                IdempotencyDecision::Execute
            }
        }
        PhaseName::Cleanup => {
            if state.cleanup_summary.is_some() {
                IdempotencyDecision::Skip
            } else {
                IdempotencyDecision::Execute
            }
        }
        // Verify always re-executes: it is the final confirmation and must
        // observe current state, not a cached one.
        PhaseName::Verify => IdempotencyDecision::Execute,
    }
}

/// Whether `state.plan_file_path` both exists and meets the minimum plan
/// size, the floor below which the Requires/Produces contract treats a
/// plan file as never having been written.
fn plan_file_on_disk_is_valid(state: &RunStateDocument) -> bool {
    let Some(path) = &state.plan_file_path else {
        return false;
    };
    file_is_at_least(path, MIN_PLAN_FILE_BYTES)
}

fn file_is_at_least(path: &Path, min_bytes: u64) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() >= min_bytes)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adw_types::WorkflowTemplate;

    fn state() -> RunStateDocument {
        RunStateDocument::new("run-1".into(), WorkflowTemplate::FullSdlc)
    }

    #[test]
    fn plan_resumes_when_worktree_exists() {
        let mut s = state();
        assert_eq!(decide(PhaseName::Plan, &s), IdempotencyDecision::Execute);
        s.worktree_path = Some("/tmp/wt".into());
        assert_eq!(decide(PhaseName::Plan, &s), IdempotencyDecision::Resume);
    }

    #[test]
    fn test_phase_always_re_executes() {
        let mut s = state();
        s.test_results.insert("cargo-test".into(), Default::default());
        assert_eq!(decide(PhaseName::Test, &s), IdempotencyDecision::Execute);
    }

    #[test]
    fn ship_skips_when_already_merged() {
        let mut s = state();
        assert_eq!(decide(PhaseName::Ship, &s), IdempotencyDecision::Execute);
        s.merge_commit_sha = Some("abc123".into());
        assert_eq!(decide(PhaseName::Ship, &s), IdempotencyDecision::Skip);
    }

    #[test]
    fn validate_skips_once_baseline_recorded_and_plan_file_is_valid_on_disk() {
        let td = tempfile::tempdir().unwrap();
        let plan_path = td.path().join("plan.md");
        std::fs::write(&plan_path, "x".repeat(100)).unwrap();

        let mut s = state();
        assert_eq!(decide(PhaseName::Validate, &s), IdempotencyDecision::Execute);
        s.plan_file_path = Some(plan_path);
        s.baseline_errors.insert("cargo-check".into(), 0);
        assert_eq!(decide(PhaseName::Validate, &s), IdempotencyDecision::Skip);
    }

    #[test]
    fn validate_re_executes_when_plan_file_is_deleted_despite_baseline_recorded() {
        let td = tempfile::tempdir().unwrap();
        let mut s = state();
        s.plan_file_path = Some(td.path().join("plan.md")); // never written
        s.baseline_errors.insert("cargo-check".into(), 0);
        assert_eq!(decide(PhaseName::Validate, &s), IdempotencyDecision::Execute);
    }

    #[test]
    fn validate_re_executes_when_plan_file_is_truncated_below_the_floor() {
        let td = tempfile::tempdir().unwrap();
        let plan_path = td.path().join("plan.md");
        std::fs::write(&plan_path, "too short").unwrap();

        let mut s = state();
        s.plan_file_path = Some(plan_path);
        s.baseline_errors.insert("cargo-check".into(), 0);
        assert_eq!(decide(PhaseName::Validate, &s), IdempotencyDecision::Execute);
    }

    #[test]
    fn document_skips_only_once_every_doc_file_exists_on_disk() {
        let td = tempfile::tempdir().unwrap();
        let doc_path = td.path().join("CHANGELOG.md");

        let mut s = state();
        s.doc_files_paths.push(doc_path.clone());
        assert_eq!(
            decide(PhaseName::Document, &s),
            IdempotencyDecision::Execute,
            "doc file recorded but missing from disk must re-execute"
        );

        std::fs::write(&doc_path, "notes").unwrap();
        assert_eq!(decide(PhaseName::Document, &s), IdempotencyDecision::Skip);
    }

    #[test]
    fn verify_always_re_executes() {
        let mut s = state();
        s.verification_results.push(Default::default());
        assert_eq!(decide(PhaseName::Verify, &s), IdempotencyDecision::Execute);
    }
}
